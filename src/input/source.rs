//! Source bin construction
//!
//! Two shapes of source: a webcam (`v4l2`) with a forced resolution and a
//! synthetic caps announcement, and everything else through a dynamic
//! decoder that grows pads once the container is inspected. The negotiated
//! caps are parked in a shared cell; the input loop announces them to the
//! output before forwarding any frame of the stream.

use crate::config::VideoUri;
use crate::media::{ghost_pad, make_element, PipelineError};
use gstreamer as gst;
use gstreamer::prelude::*;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Caps cell written by the pad probe on a decoder streaming thread and
/// drained by the input loop.
pub type SharedCaps = Arc<Mutex<Option<String>>>;

/// Webcam resolutions are not standard and the device caps cannot be read
/// up front; force a fixed size so the announced caps match what the
/// output will actually receive.
const V4L2_FORCED_SIZE: &str = "video/x-raw,width=1280,height=720";
const V4L2_ANNOUNCED_CAPS: &str = "video/x-raw,width=1280,height=720,format=RGB,framerate=30/1";

/// Build the source bin for the configured input URI.
pub(crate) fn build_source_bin(
    uri: &VideoUri,
    pending_caps: &SharedCaps,
) -> Result<gst::Bin, PipelineError> {
    if uri.protocol() == "v4l2" {
        build_webcam_bin(pending_caps)
    } else {
        build_decoder_bin(uri, pending_caps)
    }
}

fn build_webcam_bin(pending_caps: &SharedCaps) -> Result<gst::Bin, PipelineError> {
    let bin = gst::Bin::builder().name("source-bin").build();
    let source = make_element("v4l2src", "source")?;
    let convert = make_element("videoconvert", "videoconvert")?;
    let scale = make_element("videoscale", "videoscale")?;
    let capsfilter = make_element("capsfilter", "capsfilter")?;
    let forced = V4L2_FORCED_SIZE
        .parse::<gst::Caps>()
        .map_err(|_| PipelineError::Caps(V4L2_FORCED_SIZE.to_string()))?;
    capsfilter.set_property("caps", &forced);

    bin.add_many([&source, &convert, &scale, &capsfilter])
        .map_err(|e| PipelineError::Link(e.to_string()))?;
    gst::Element::link_many([&source, &convert, &scale, &capsfilter])
        .map_err(|e| PipelineError::Link(format!("webcam chain: {}", e)))?;
    ghost_pad(&bin, &capsfilter, "src", "src")?;

    // The device announces nothing the output could use, so the caps are
    // synthesized right away.
    *pending_caps.lock() = Some(V4L2_ANNOUNCED_CAPS.to_string());
    Ok(bin)
}

fn build_decoder_bin(uri: &VideoUri, pending_caps: &SharedCaps) -> Result<gst::Bin, PipelineError> {
    let bin = gst::Bin::builder().name("source-bin").build();
    let decoder = gst::ElementFactory::make("uridecodebin3")
        .name("source")
        .property("uri", uri.uri())
        .build()
        .map_err(|e| PipelineError::Element(format!("failed to create uridecodebin3: {}", e)))?;
    let convert = make_element("videoconvert", "videoconvert")?;

    bin.add_many([&decoder, &convert]).map_err(|e| PipelineError::Link(e.to_string()))?;

    // The decoder grows pads once streams are discovered; link the first
    // video pad and park its negotiated caps for the announcement.
    let convert_weak = convert.downgrade();
    let pending = pending_caps.clone();
    decoder.connect_pad_added(move |_element, pad| {
        let Some(convert) = convert_weak.upgrade() else {
            return;
        };
        let Some(sink) = convert.static_pad("sink") else {
            return;
        };
        if sink.is_linked() {
            warn!("Video converter pad is already linked. Skipping decoder link");
            return;
        }
        info!("Linking decoder pad to videoconvert pad");
        if let Err(e) = pad.link(&sink) {
            warn!("Failed to link decoder pad: {:?}", e);
            return;
        }
        // Caps negotiation finishes asynchronously; probe upstream events
        // until the caps appear, then announce once and remove the probe.
        let pending = pending.clone();
        pad.add_probe(gst::PadProbeType::EVENT_UPSTREAM, move |probe_pad, _info| {
            if let Some(caps) = probe_pad.current_caps() {
                info!("dynamic source pad \"{}\" with caps: {}", probe_pad.name(), caps);
                *pending.lock() = Some(caps.to_string());
                gst::PadProbeReturn::Remove
            } else {
                gst::PadProbeReturn::Ok
            }
        });
    });

    ghost_pad(&bin, &convert, "src", "src")?;
    Ok(bin)
}
