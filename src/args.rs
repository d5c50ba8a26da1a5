use clap::{Parser, ValueEnum};
use framewire::config::{Config, ConfigError};
use std::path::PathBuf;

/// Which part of the engine this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Component {
    /// Decode the source and fan frames out to the workers
    Input,
    /// Run the user hook/plugin graph over frames
    Worker,
    /// Re-encode processed frames into the configured sink
    Output,
    /// Run all three components co-located in one process
    All,
}

#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(author = "Framewire Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Distributed real-time video frame processing engine", long_about = None)]
pub struct Args {
    /// Component to run
    #[arg(value_enum)]
    pub component: Component,

    /// Configuration file path
    #[arg(short, long, default_value = "framewire.toml")]
    pub config: PathBuf,

    /// User app artifact; the worker requires it
    #[arg(short, long)]
    pub app: Option<PathBuf>,
}

impl Args {
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        Config::load(&self.config)
    }
}
