//! framewire - main entry point
//!
//! Dispatches into the selected component. `all` co-locates the three
//! components in one host process, with a second of spacing so the
//! listening sockets settle before their dialers start.

mod args;

use args::{Args, Component};
use clap::Parser;
use framewire::config::Config;
use framewire::transport::ShutdownFlag;
use framewire::{input, output, worker};
use log::{error, info};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const ALL_SPAWN_SPACING: Duration = Duration::from_secs(1);

fn main() {
    let args = Args::parse();
    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("framewire: {}", e);
            std::process::exit(1);
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(config.log_level.to_filter())
        .format_timestamp_millis()
        .init();

    let shutdown = ShutdownFlag::new();
    shutdown.install();

    let ok = match args.component {
        Component::Input => run_input(&config, &shutdown),
        Component::Worker => run_worker(&config, args.app.clone(), &shutdown),
        Component::Output => run_output(&config, &shutdown),
        Component::All => run_all(&config, args.app.clone(), &shutdown),
    };
    if !ok {
        std::process::exit(1);
    }
}

fn run_input(config: &Config, shutdown: &ShutdownFlag) -> bool {
    match input::run(config, shutdown) {
        Ok(()) => true,
        Err(e) => {
            error!("input: {}", e);
            false
        }
    }
}

fn run_worker(config: &Config, app: Option<PathBuf>, shutdown: &ShutdownFlag) -> bool {
    match worker::run(config, app.as_deref(), shutdown) {
        Ok(()) => true,
        Err(e) => {
            error!("worker: {}", e);
            false
        }
    }
}

fn run_output(config: &Config, shutdown: &ShutdownFlag) -> bool {
    match output::run(config, shutdown) {
        Ok(()) => true,
        Err(e) => {
            error!("output: {}", e);
            false
        }
    }
}

/// Co-located mode: output, then input, then the configured number of
/// workers, all sharing one shutdown flag.
fn run_all(config: &Config, app: Option<PathBuf>, shutdown: &ShutdownFlag) -> bool {
    info!("Starting output, input and {} worker(s) in one process", config.worker.n_workers);
    let mut handles = Vec::new();

    {
        let config = config.clone();
        let shutdown = shutdown.clone();
        handles.push(thread::spawn(move || run_output(&config, &shutdown)));
    }
    thread::sleep(ALL_SPAWN_SPACING);
    {
        let config = config.clone();
        let shutdown = shutdown.clone();
        handles.push(thread::spawn(move || run_input(&config, &shutdown)));
    }
    thread::sleep(ALL_SPAWN_SPACING);
    for _ in 0..config.worker.n_workers {
        let config = config.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();
        handles.push(thread::spawn(move || run_worker(&config, app, &shutdown)));
    }

    let mut ok = true;
    for handle in handles {
        match handle.join() {
            Ok(success) => ok &= success,
            Err(_) => {
                error!("a component thread panicked");
                ok = false;
            }
        }
    }
    ok
}
