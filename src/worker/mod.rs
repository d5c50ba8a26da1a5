//! Worker process
//!
//! Pulls frames from the input, runs the hook/plugin graph (optionally with
//! an inference session) and forwards the result to the output. One stream
//! per iteration: the user app instance and the processing metrics are reset
//! at every stream boundary.

pub mod hooks;
pub mod inference;
pub mod metrics;

use crate::config::Config;
use crate::messages::{Message, MessageError, RgbImage};
use crate::transport::{
    InputPullSocket, OutputPushSocket, SendOutcome, ShutdownFlag, TransportError, WorkerReadySocket,
};
use hooks::{AppArtifact, AppContext, HookError, HookGraph, Stage};
use inference::{InferenceError, InferenceSession, Tensor};
use log::{error, info, warn};
use metrics::ProcessingMetrics;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const IDLE_POLL_DELAY: Duration = Duration::from_millis(1);

/// Worker process errors
#[derive(Debug)]
pub enum WorkerError {
    /// No app artifact path was provided
    MissingAppPath,
    /// The app artifact does not exist on disk
    MissingApp(PathBuf),
    /// A plugin wraps the `process` stage while inference replaces it
    PluginInferenceConflict(String),
    /// A message that never belongs on the frame channel arrived
    UnexpectedMessage(&'static str),
    Transport(TransportError),
    Message(MessageError),
    Hook(HookError),
    Inference(InferenceError),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::MissingAppPath => write!(f, "missing app artifact path"),
            WorkerError::MissingApp(path) => {
                write!(f, "app artifact {} does not exist", path.display())
            }
            WorkerError::PluginInferenceConflict(id) => write!(
                f,
                "plugin '{}' implements process-stage hooks but inference is configured; \
                 inference replaces the process stage",
                id
            ),
            WorkerError::UnexpectedMessage(kind) => {
                write!(f, "unsupported message type on the frame channel: {}", kind)
            }
            WorkerError::Transport(e) => write!(f, "{}", e),
            WorkerError::Message(e) => write!(f, "{}", e),
            WorkerError::Hook(e) => write!(f, "{}", e),
            WorkerError::Inference(e) => write!(f, "{}", e),
        }
    }
}

impl Error for WorkerError {}

impl From<TransportError> for WorkerError {
    fn from(e: TransportError) -> Self {
        WorkerError::Transport(e)
    }
}

impl From<MessageError> for WorkerError {
    fn from(e: MessageError) -> Self {
        WorkerError::Message(e)
    }
}

impl From<HookError> for WorkerError {
    fn from(e: HookError) -> Self {
        WorkerError::Hook(e)
    }
}

impl From<InferenceError> for WorkerError {
    fn from(e: InferenceError) -> Self {
        WorkerError::Inference(e)
    }
}

/// What the frame loop decided after one poll.
enum LoopStep {
    Continue,
    StreamEnd,
}

/// Run the worker until its streams are exhausted or shutdown is requested.
pub fn run(
    config: &Config,
    app_path: Option<&Path>,
    shutdown: &ShutdownFlag,
) -> Result<(), WorkerError> {
    let app_path = app_path.ok_or(WorkerError::MissingAppPath)?;
    if !app_path.is_file() {
        return Err(WorkerError::MissingApp(app_path.to_path_buf()));
    }
    let artifact = AppArtifact::load(app_path)?;

    let context = zmq::Context::new();
    let input_pull = InputPullSocket::dial(
        &context,
        &config.input.address,
        config.worker.recv_buffer_size,
        shutdown,
    )?;
    let output_address =
        if config.output.video.enable { config.output.address.as_ref() } else { None };
    let output_push = match output_address {
        Some(address) => Some(OutputPushSocket::dial(&context, address, shutdown)?),
        None => None,
    };

    // One session for the whole worker lifetime; a broken model is fatal
    // before any frame is touched.
    let mut session: Option<Box<dyn InferenceSession>> = match &config.worker.inference {
        Some(inference_config) => {
            Some(inference::load_session(inference_config, artifact.library())?)
        }
        None => None,
    };

    info!("Notifying worker ready to input");
    let ready = WorkerReadySocket::dial(&context, &config.input.address, shutdown)?;
    ready.announce(shutdown)?;

    loop {
        // Fresh app instance, plugins and metrics for every stream.
        let app = artifact.instantiate()?;
        let plugins = hooks::load_plugins(&config.plugins.dir, &config.plugins.order);
        let mut graph = HookGraph::new(
            app,
            plugins,
            config.worker.show_exec_time,
            config.worker.enable_profiler,
        );
        if session.is_some() {
            if let Some(id) = graph.process_plugin_ids().first() {
                return Err(WorkerError::PluginInferenceConflict(id.to_string()));
            }
        }

        let mut ctx = AppContext::new();
        let mut stream_metrics = ProcessingMetrics::new();
        let mut cached_results: Option<Tensor> = None;

        graph.run_stage(Stage::Before, &mut ctx);

        let mut interrupted = false;
        loop {
            if shutdown.is_set() {
                interrupted = true;
                break;
            }
            let step = fetch_and_process(
                config,
                &input_pull,
                output_push.as_ref(),
                &mut graph,
                &mut ctx,
                &mut stream_metrics,
                session.as_deref_mut(),
                &mut cached_results,
                shutdown,
            )?;
            match step {
                LoopStep::Continue => {}
                LoopStep::StreamEnd => break,
            }
        }

        graph.run_stage(Stage::After, &mut ctx);
        graph.end_stream();
        stream_metrics.reset();

        if interrupted {
            break;
        }
        if config.uses_file_protocol() {
            // A file stream is one-shot: the sink must not be overwritten
            // and the decoder cannot reopen the source for a new stream.
            break;
        }
    }

    info!("Worker finished. Please wait for the output (if enabled).");
    Ok(())
}

/// Poll the frame channel once and run the per-frame algorithm.
#[allow(clippy::too_many_arguments)]
fn fetch_and_process(
    config: &Config,
    input_pull: &InputPullSocket,
    output_push: Option<&OutputPushSocket>,
    graph: &mut HookGraph,
    ctx: &mut AppContext,
    stream_metrics: &mut ProcessingMetrics,
    session: Option<&mut dyn InferenceSession>,
    cached_results: &mut Option<Tensor>,
    shutdown: &ShutdownFlag,
) -> Result<LoopStep, WorkerError> {
    let payload = match input_pull.recv()? {
        Some(payload) => payload,
        None => {
            thread::sleep(IDLE_POLL_DELAY);
            return Ok(LoopStep::Continue);
        }
    };
    match Message::decode(&payload)? {
        Message::Frame(frame) => {
            process_frame(
                config,
                frame,
                output_push,
                graph,
                ctx,
                stream_metrics,
                session,
                cached_results,
            )?;
            Ok(LoopStep::Continue)
        }
        Message::Eos => {
            info!("Worker iteration finished. Notifying output. About to reset worker");
            if let Some(push) = output_push {
                // Forward the already-serialized marker; the output drains
                // and closes on it.
                push.ensure_send(&payload, shutdown)?;
            }
            Ok(LoopStep::StreamEnd)
        }
        other => {
            error!("Unsupported message type on the frame channel: {}", other.kind());
            Err(WorkerError::UnexpectedMessage(other.kind()))
        }
    }
}

/// The per-frame algorithm: skip decision, pre-process chain, inference or
/// process chain, post-process chain, forward.
#[allow(clippy::too_many_arguments)]
fn process_frame(
    config: &Config,
    frame: RgbImage,
    output_push: Option<&OutputPushSocket>,
    graph: &mut HookGraph,
    ctx: &mut AppContext,
    stream_metrics: &mut ProcessingMetrics,
    session: Option<&mut dyn InferenceSession>,
    cached_results: &mut Option<Tensor>,
) -> Result<(), WorkerError> {
    let started = Instant::now();
    let fps = frame.fps();
    // Immutable view of the incoming pixels; user code replaces buffers
    // wholesale, never in place.
    ctx.original_frame = Some(frame.clone());

    let skipped = config.worker.skip_frames && stream_metrics.should_skip(fps);

    let pre_processed = graph.run_frame_stage(Stage::PreProcess, frame, ctx)?;

    let staged = match session {
        Some(session) => {
            if skipped {
                // Keep rendering the last known predictions while catching up.
                ctx.inference_results = cached_results.clone();
                stream_metrics.count_skip();
            } else {
                let results = session.run(&pre_processed)?;
                *cached_results = Some(results.clone());
                ctx.inference_results = Some(results);
            }
            // Inference replaces the process stage; post-process works over
            // the original frame.
            match ctx.original_frame.clone() {
                Some(original) => original,
                None => pre_processed,
            }
        }
        None => {
            if skipped {
                stream_metrics.count_skip();
                pre_processed
            } else {
                graph.run_frame_stage(Stage::Process, pre_processed, ctx)?
            }
        }
    };

    let post_processed = graph.run_frame_stage(Stage::PostProcess, staged, ctx)?;
    let elapsed = started.elapsed();

    if let Some(push) = output_push {
        // Update the payload with the final pixels while keeping the
        // original timing metadata.
        let outgoing = match &ctx.original_frame {
            Some(original) => original.with_pixels(post_processed.into_pixels())?,
            None => post_processed,
        };
        match push.send(&Message::Frame(outgoing).encode()?)? {
            SendOutcome::Sent => {}
            SendOutcome::WouldBlock | SendOutcome::Timeout => {
                warn!("Output socket queue full, frame dropped");
            }
        }
    }

    if !skipped {
        stream_metrics.record(elapsed, fps);
    }
    Ok(())
}
