//! Output process
//!
//! Starts without a pipeline and builds one per stream when the first caps
//! announcement arrives, keyed by the configured sink protocol. Frames from
//! the workers are pushed into an appsrc in arrival order; tags are merged
//! cumulatively and re-injected; the pipeline is torn down and rebuilt when
//! a new stream negotiates different caps.

pub mod sink;
pub mod tags;

use crate::config::{Config, VideoUri};
use crate::media::{self, PipelineError, StreamShape};
use crate::messages::{Message, MessageError, RgbImage};
use crate::transport::{InputOutputSocket, OutputPullSocket, ShutdownFlag, TransportError};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

const IDLE_TICK: Duration = Duration::from_millis(3);

/// 1 GB of appsrc queue before the encoder side pushes back.
const APPSRC_MAX_BYTES: u64 = 1_000_000_000;

/// Output process errors
#[derive(Debug)]
pub enum OutputError {
    Pipeline(PipelineError),
    Transport(TransportError),
    Message(MessageError),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::Pipeline(e) => write!(f, "{}", e),
            OutputError::Transport(e) => write!(f, "{}", e),
            OutputError::Message(e) => write!(f, "{}", e),
        }
    }
}

impl Error for OutputError {}

impl From<PipelineError> for OutputError {
    fn from(e: PipelineError) -> Self {
        OutputError::Pipeline(e)
    }
}

impl From<TransportError> for OutputError {
    fn from(e: TransportError) -> Self {
        OutputError::Transport(e)
    }
}

impl From<MessageError> for OutputError {
    fn from(e: MessageError) -> Self {
        OutputError::Message(e)
    }
}

/// What draining the bus of the active pipeline concluded.
enum BusOutcome {
    Nothing,
    Eos,
    Fatal(String),
}

/// The encode/mux pipeline of the active stream.
struct ActivePipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    bus: gst::Bus,
    /// Caps string the pipeline was built for; a different announcement
    /// forces a rebuild.
    caps: String,
    /// Screen sinks render on arrival and get no timestamps copied.
    copy_timestamps: bool,
    /// Cleared once EOS reaches the appsrc; late frames are ignored.
    fetching: bool,
}

impl ActivePipeline {
    fn build(uri: &VideoUri, caps: &str) -> Result<ActivePipeline, PipelineError> {
        info!("Creating new pipeline for caps: {}", caps);
        let shape = StreamShape::from_caps_str(caps)?;

        // The workers always deliver raw RGB at the size and rate the input
        // announced.
        let appsrc_caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", shape.width)
            .field("height", shape.height)
            .field("framerate", shape.framerate())
            .build();
        let appsrc = gst_app::AppSrc::builder().name("appsrc").build();
        appsrc.set_caps(Some(&appsrc_caps));
        appsrc.set_property("is-live", true);
        // The buffers already wear timestamps
        appsrc.set_property("do-timestamp", false);
        appsrc.set_property("format", gst::Format::Time);
        appsrc.set_max_bytes(APPSRC_MAX_BYTES);

        let pipeline = gst::Pipeline::new();
        let sink = sink::build_sink(uri.protocol(), uri.location())?;
        let processing = sink::build_processing_bin(uri.protocol(), uri.location())?;

        pipeline.add(&appsrc).map_err(|e| PipelineError::Link(e.to_string()))?;
        pipeline.add(&sink).map_err(|e| PipelineError::Link(e.to_string()))?;
        match &processing {
            Some(bin) => {
                pipeline.add(bin).map_err(|e| PipelineError::Link(e.to_string()))?;
                appsrc
                    .link(bin)
                    .map_err(|e| PipelineError::Link(format!("appsrc to processing bin: {}", e)))?;
                bin.link(&sink)
                    .map_err(|e| PipelineError::Link(format!("processing bin to sink: {}", e)))?;
            }
            None => {
                appsrc
                    .link(&sink)
                    .map_err(|e| PipelineError::Link(format!("appsrc to sink: {}", e)))?;
            }
        }

        let bus = pipeline
            .bus()
            .ok_or_else(|| PipelineError::Element("pipeline without bus".to_string()))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| PipelineError::StateChange(format!("unable to start playing: {}", e)))?;

        Ok(ActivePipeline {
            pipeline,
            appsrc,
            bus,
            caps: caps.to_string(),
            copy_timestamps: uri.protocol() != "screen",
            fetching: true,
        })
    }

    fn shutdown(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }

    /// Wrap the frame bytes into a buffer (no copy) and hand it to the
    /// appsrc.
    fn push_frame(&self, frame: RgbImage) -> Result<(), PipelineError> {
        let pts = frame.pts();
        let dts = frame.dts();
        let duration = frame.duration();
        let mut buffer = gst::Buffer::from_slice(frame.into_pixels());
        if self.copy_timestamps {
            if let Some(buffer) = buffer.get_mut() {
                buffer.set_pts(pts.map(gst::ClockTime::from_nseconds));
                buffer.set_dts(dts.map(gst::ClockTime::from_nseconds));
                buffer.set_duration(duration.map(gst::ClockTime::from_nseconds));
            }
        }
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|flow| PipelineError::Bus(format!("appsrc rejected the buffer: {:?}", flow)))
    }

    fn end_of_stream(&mut self) {
        let _ = self.appsrc.end_of_stream();
        self.fetching = false;
    }

    /// Re-render the merged tags into the graph, and follow a bitrate tag
    /// onto the encoder.
    fn apply_tags(&self, merged: &str) {
        let (rendered, bitrate) = match tags::sanitize_for_injection(merged) {
            Ok(result) => result,
            Err(e) => {
                warn!("Tags won't be injected: {}", e);
                return;
            }
        };
        match self.pipeline.by_name("taginject") {
            Some(inject) => {
                info!("Updating tags to {}", rendered);
                inject.set_property("tags", &rendered);
            }
            None => warn!("No taginject element found, video tags won't be injected"),
        }
        if let Some(bitrate) = bitrate {
            match self.pipeline.by_name("encoder") {
                Some(encoder) => {
                    info!("Updating bitrate on encoder to {}", bitrate);
                    encoder.set_property("bitrate", bitrate);
                }
                None => warn!("No encoder found, properties won't be updated"),
            }
        }
    }

    fn drain_bus(&self) -> (bool, BusOutcome) {
        use gst::MessageView;
        let mut activity = false;
        while let Some(msg) = self.bus.pop() {
            activity = true;
            match msg.view() {
                MessageView::Eos(..) => return (activity, BusOutcome::Eos),
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
                    return (activity, BusOutcome::Fatal(e.error().to_string()));
                }
                MessageView::Warning(w) => {
                    warn!(
                        "Warning received from element {}: {}",
                        msg.src().map(|s| s.name().to_string()).unwrap_or_default(),
                        w.error()
                    );
                }
                _ => {}
            }
        }
        (activity, BusOutcome::Nothing)
    }
}

impl Drop for ActivePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the output process until its streams are exhausted or shutdown is
/// requested.
pub fn run(config: &Config, shutdown: &ShutdownFlag) -> Result<(), OutputError> {
    let (address, uri) = match (config.output.video.enable, &config.output.address, &config.output.video.uri)
    {
        (true, Some(address), Some(uri)) => (address, uri),
        _ => {
            info!("Output video is disabled");
            return Ok(());
        }
    };

    media::init()?;
    let context = zmq::Context::new();
    let io_socket = InputOutputSocket::listen(&context, address)?;
    let pull = OutputPullSocket::bind(&context, address, config.output.recv_buffer_size)?;

    let mut active: Option<ActivePipeline> = None;
    let mut merged_tags: Option<String> = None;

    while !shutdown.is_set() {
        let mut idle = true;

        // Encoder-side bus events of the active stream.
        if let Some((activity, outcome)) = active.as_ref().map(ActivePipeline::drain_bus) {
            if activity {
                idle = false;
            }
            match outcome {
                BusOutcome::Nothing => {}
                BusOutcome::Eos => {
                    info!("End of stream reached.");
                    if let Some(pipeline) = active.take() {
                        pipeline.shutdown();
                    }
                    if config.uses_file_protocol() {
                        break;
                    }
                }
                BusOutcome::Fatal(msg) => return Err(PipelineError::Bus(msg).into()),
            }
        }

        // Metadata from the input: caps, tags, end of stream.
        if let Some(payload) = io_socket.recv()? {
            idle = false;
            match Message::decode(&payload) {
                Ok(Message::StreamCaps(caps)) => {
                    let rebuild = match &active {
                        None => true,
                        Some(pipeline) if pipeline.caps != caps => {
                            info!("Stream caps changed, rebuilding the output pipeline");
                            true
                        }
                        Some(_) => false,
                    };
                    if rebuild {
                        if let Some(pipeline) = active.take() {
                            pipeline.shutdown();
                        }
                        let pipeline = ActivePipeline::build(uri, &caps)?;
                        if let Some(tags) = &merged_tags {
                            // The input may send tags before the caps; they
                            // were held for this moment.
                            pipeline.apply_tags(tags);
                        }
                        active = Some(pipeline);
                    }
                }
                Ok(Message::Tags(new_tags)) => {
                    match tags::merge_tags(merged_tags.as_deref(), &new_tags) {
                        Ok(merged) => {
                            info!("Output tags updated to: {}", merged);
                            if let Some(pipeline) = &active {
                                pipeline.apply_tags(&merged);
                            }
                            merged_tags = Some(merged);
                        }
                        Err(e) => warn!("Ignoring unparseable tags: {}", e),
                    }
                }
                Ok(Message::Eos) => {
                    // The authoritative marker travels through the workers
                    // and reaches the appsrc on the frame channel.
                    info!("Input signalled end of stream");
                }
                Ok(other) => {
                    warn!("Unexpected message on the metadata channel: {}", other.kind());
                }
                Err(e) => {
                    error!("Stopping message handler: {}", e);
                    return Err(e.into());
                }
            }
        }

        // Frames coming back from the workers.
        if let Some(pipeline) = active.as_mut().filter(|p| p.fetching) {
            if let Some(payload) = pull.recv()? {
                idle = false;
                debug!("New message of {} bytes", payload.len());
                match Message::decode(&payload) {
                    Ok(Message::Frame(frame)) => {
                        if let Err(e) = pipeline.push_frame(frame) {
                            warn!("{}", e);
                        }
                    }
                    Ok(Message::Eos) => {
                        // With several workers only the first marker acts;
                        // a few frames may be lost in that transient.
                        pipeline.end_of_stream();
                    }
                    Ok(other) => {
                        error!("Unsupported message type: {}", other.kind());
                        pipeline.fetching = false;
                    }
                    Err(e) => {
                        error!("Undecodable frame payload: {}", e);
                        pipeline.fetching = false;
                    }
                }
            }
        }

        if idle {
            thread::sleep(IDLE_TICK);
        }
    }

    if let Some(pipeline) = active.take() {
        info!("Closing pipeline");
        pipeline.shutdown();
    }
    info!("Output finished.");
    Ok(())
}
