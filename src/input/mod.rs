//! Input process
//!
//! Decodes the configured source into raw RGB frames and fans them out to
//! the workers. Stream metadata (caps, tags, EOS) goes to the output over
//! its own channel. The loop is single-threaded and cooperative: drain the
//! appsink, drain the bus, tick. A stream ending on a non-file protocol
//! tears the source pipeline down and rebuilds it for the next stream; file
//! protocols are one-shot.

pub mod source;

use crate::config::{Config, VideoUri};
use crate::media::{self, PipelineError, StreamShape};
use crate::messages::{Message, MessageError, RgbImage};
use crate::transport::{
    InputOutputSocket, InputPushSocket, SendOutcome, ShutdownFlag, TransportError,
    WorkerReadySocket,
};
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use source::SharedCaps;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const IDLE_TICK: Duration = Duration::from_millis(3);

/// Input process errors
#[derive(Debug)]
pub enum InputError {
    /// The configured input file does not exist
    MissingFile(String),
    Pipeline(PipelineError),
    Transport(TransportError),
    Message(MessageError),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputError::MissingFile(path) => {
                write!(f, "input video file {} doesn't exist", path)
            }
            InputError::Pipeline(e) => write!(f, "{}", e),
            InputError::Transport(e) => write!(f, "{}", e),
            InputError::Message(e) => write!(f, "{}", e),
        }
    }
}

impl Error for InputError {}

impl From<PipelineError> for InputError {
    fn from(e: PipelineError) -> Self {
        InputError::Pipeline(e)
    }
}

impl From<TransportError> for InputError {
    fn from(e: TransportError) -> Self {
        InputError::Transport(e)
    }
}

impl From<MessageError> for InputError {
    fn from(e: MessageError) -> Self {
        InputError::Message(e)
    }
}

/// The decode pipeline of the current stream.
struct InputPipeline {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    bus: gst::Bus,
}

impl InputPipeline {
    fn build(uri: &VideoUri, pending_caps: &SharedCaps) -> Result<InputPipeline, PipelineError> {
        let pipeline = gst::Pipeline::new();
        let bin = source::build_source_bin(uri, pending_caps)?;

        // videoconvert negotiates whatever the decoder produces into the
        // RGB the workers expect.
        let sink_caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let appsink = gst_app::AppSink::builder().name("appsink").caps(&sink_caps).build();

        pipeline.add(&bin).map_err(|e| PipelineError::Link(e.to_string()))?;
        pipeline.add(&appsink).map_err(|e| PipelineError::Link(e.to_string()))?;
        bin.link(&appsink)
            .map_err(|e| PipelineError::Link(format!("source bin to appsink: {}", e)))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| PipelineError::Element("pipeline without bus".to_string()))?;
        Ok(InputPipeline { pipeline, appsink, bus })
    }

    fn start(&self) -> Result<(), PipelineError> {
        info!("Starting input pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::StateChange(format!("unable to start playing: {}", e)))?;
        Ok(())
    }

    fn stop(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }

    fn try_pull(&self) -> Option<gst::Sample> {
        self.appsink.try_pull_sample(gst::ClockTime::ZERO)
    }
}

impl Drop for InputPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the input process until its streams are exhausted or shutdown is
/// requested.
pub fn run(config: &Config, shutdown: &ShutdownFlag) -> Result<(), InputError> {
    let uri = match (config.input.video.enable, &config.input.video.uri) {
        (true, Some(uri)) => uri,
        _ => {
            info!("Input video is disabled");
            return Ok(());
        }
    };
    info!("Reading video from {}", uri.uri());
    if uri.is_file() && !Path::new(uri.location()).is_file() {
        return Err(InputError::MissingFile(uri.location().to_string()));
    }

    media::init()?;
    let context = zmq::Context::new();
    let push = InputPushSocket::bind(&context, &config.input.address)?;
    let ready = WorkerReadySocket::listen(&context, &config.input.address)?;

    // Frames pushed while no worker has dialed in would be silently
    // dropped; wait for the first one before going live.
    info!("Waiting first worker to be available");
    ready.await_worker(shutdown)?;
    info!("First worker ready");

    let io_socket = match (config.output.video.enable, &config.output.address) {
        (true, Some(address)) => Some(InputOutputSocket::dial(&context, address, shutdown)?),
        _ => None,
    };

    let pending_caps: SharedCaps = Arc::new(Mutex::new(None));
    let mut pipeline = InputPipeline::build(uri, &pending_caps)?;
    pipeline.start()?;

    let result = main_loop(
        config,
        uri,
        &push,
        io_socket.as_ref(),
        &pending_caps,
        &mut pipeline,
        shutdown,
    );
    pipeline.stop();
    info!("Input finished. Please wait for workers and output (if enabled).");
    result
}

fn main_loop(
    config: &Config,
    uri: &VideoUri,
    push: &InputPushSocket,
    io_socket: Option<&InputOutputSocket>,
    pending_caps: &SharedCaps,
    pipeline: &mut InputPipeline,
    shutdown: &ShutdownFlag,
) -> Result<(), InputError> {
    use gst::MessageView;
    loop {
        if shutdown.is_set() {
            return Ok(());
        }
        let mut idle = true;

        // Caps first: no frame of a stream may overtake its announcement.
        announce_caps(pending_caps, io_socket, shutdown)?;
        while let Some(sample) = pipeline.try_pull() {
            idle = false;
            announce_caps(pending_caps, io_socket, shutdown)?;
            forward_sample(&sample, push)?;
            if shutdown.is_set() {
                return Ok(());
            }
        }

        while let Some(msg) = pipeline.bus.pop() {
            idle = false;
            match msg.view() {
                MessageView::Eos(..) => {
                    info!("End of stream reached.");
                    // Samples decoded before the marker still belong to the
                    // stream.
                    while let Some(sample) = pipeline.try_pull() {
                        announce_caps(pending_caps, io_socket, shutdown)?;
                        forward_sample(&sample, push)?;
                    }
                    broadcast_eos(config, push, shutdown)?;
                    if config.uses_file_protocol() {
                        // One-shot: the sink must not be overwritten and a
                        // finished file cannot produce another stream.
                        return Ok(());
                    }
                    info!("Resetting the input pipeline for the next stream");
                    pipeline.stop();
                    *pipeline = InputPipeline::build(uri, pending_caps)?;
                    pipeline.start()?;
                }
                MessageView::Error(e) => {
                    error!(
                        "Error received from element {}: {}",
                        msg.src().map(|s| s.name().to_string()).unwrap_or_default(),
                        e.error()
                    );
                    error!(
                        "Debugging information: {}",
                        e.debug().map(|d| d.to_string()).unwrap_or_else(|| "none".to_string())
                    );
                    return Err(PipelineError::Bus(e.error().to_string()).into());
                }
                MessageView::Warning(w) => {
                    warn!(
                        "Warning received from element {}: {}",
                        msg.src().map(|s| s.name().to_string()).unwrap_or_default(),
                        w.error()
                    );
                }
                MessageView::StateChanged(s) => {
                    debug!("New pipeline state: {:?}", s.current());
                }
                MessageView::Tag(t) => {
                    let tags = t.tags();
                    info!("Tags parsed: {}", tags);
                    if let Some(io) = io_socket {
                        io.ensure_send(&Message::Tags(tags.to_string()).encode()?, shutdown)?;
                    }
                }
                _ => {}
            }
        }

        if idle {
            thread::sleep(IDLE_TICK);
        }
    }
}

/// Send a parked caps announcement, if any. Dropped when output is disabled.
fn announce_caps(
    pending_caps: &SharedCaps,
    io_socket: Option<&InputOutputSocket>,
    shutdown: &ShutdownFlag,
) -> Result<(), InputError> {
    let caps = pending_caps.lock().take();
    let Some(caps) = caps else {
        return Ok(());
    };
    let Some(io) = io_socket else {
        return Ok(());
    };
    info!("Announcing stream caps: {}", caps);
    io.ensure_send(&Message::StreamCaps(caps).encode()?, shutdown)?;
    Ok(())
}

/// Wrap one decoded sample into a frame message and push it to the workers.
fn forward_sample(sample: &gst::Sample, push: &InputPushSocket) -> Result<(), InputError> {
    let caps = sample
        .caps()
        .ok_or_else(|| PipelineError::Caps("sample without caps".to_string()))?;
    let shape = StreamShape::from_caps(caps)?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| PipelineError::Bus("sample without buffer".to_string()))?;
    let map = buffer
        .map_readable()
        .map_err(|_| PipelineError::Bus("buffer is not readable".to_string()))?;

    let frame = RgbImage::new(
        shape.width as u32,
        shape.height as u32,
        Bytes::copy_from_slice(map.as_slice()),
        buffer.dts().map(|t| t.nseconds()),
        buffer.pts().map(|t| t.nseconds()),
        buffer.duration().map(|t| t.nseconds()),
        RgbImage::now_nanos(),
        shape.fps(),
    );
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping undeliverable frame: {}", e);
            return Ok(());
        }
    };

    match push.send(&Message::Frame(frame).encode()?)? {
        SendOutcome::Sent => {}
        SendOutcome::WouldBlock | SendOutcome::Timeout => {
            warn!("Input push queue full, frame dropped");
        }
    }
    Ok(())
}

/// The push socket is round robin; send one marker per worker so every one
/// of them sees the end of the stream.
fn broadcast_eos(
    config: &Config,
    push: &InputPushSocket,
    shutdown: &ShutdownFlag,
) -> Result<(), InputError> {
    let payload = Message::Eos.encode()?;
    for _ in 0..config.worker.n_workers {
        info!("Notifying EOS to worker");
        push.ensure_send(&payload, shutdown)?;
    }
    Ok(())
}
