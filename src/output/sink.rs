//! Per-protocol encode/mux graphs and sinks
//!
//! The output always receives raw RGB from the appsrc, so each recipe only
//! has to convert, encode and mux for its destination. The encoder and
//! taginject elements carry fixed names so tag updates can find them later.

use crate::media::{ghost_pad, make_element, PipelineError};
use gstreamer as gst;
use gstreamer::prelude::*;

/// Build the processing bin between the appsrc and the sink. Sink-only
/// protocols (rtsp, https) return `None` and link the appsrc directly.
pub(crate) fn build_processing_bin(
    protocol: &str,
    location: &str,
) -> Result<Option<gst::Bin>, PipelineError> {
    match protocol {
        "file" => {
            if !location.ends_with(".mp4") {
                return Err(PipelineError::Unsupported(format!(
                    "unsupported file type for {}. Try with a different extension",
                    location
                )));
            }
            let bin = gst::Bin::builder().name("video-bin").build();
            let convert = make_element("videoconvert", "videoconvert")?;
            let capsfilter = make_element("capsfilter", "capsfilter")?;
            let encoder = make_element("x264enc", "encoder")?;
            let taginject = make_element("taginject", "taginject")?;
            let muxer = make_element("mp4mux", "muxer")?;

            let i420 = gst::Caps::builder("video/x-raw").field("format", "I420").build();
            capsfilter.set_property("caps", &i420);

            bin.add_many([&convert, &capsfilter, &encoder, &taginject, &muxer])
                .map_err(|e| PipelineError::Link(e.to_string()))?;
            gst::Element::link_many([&convert, &capsfilter, &encoder, &taginject, &muxer])
                .map_err(|e| PipelineError::Link(format!("mp4 chain: {}", e)))?;
            ghost_pad(&bin, &convert, "sink", "sink")?;
            ghost_pad(&bin, &muxer, "src", "src")?;
            Ok(Some(bin))
        }
        "rtmp" => {
            let bin = gst::Bin::builder().name("video-bin").build();
            let convert = make_element("videoconvert", "videoconvert")?;
            let queue = make_element("queue", "queue")?;
            let encoder = make_element("x264enc", "encoder")?;
            let taginject = make_element("taginject", "taginject")?;
            let muxer = make_element("flvmux", "muxer")?;
            muxer.set_property("streamable", true);

            bin.add_many([&convert, &queue, &encoder, &taginject, &muxer])
                .map_err(|e| PipelineError::Link(e.to_string()))?;
            gst::Element::link_many([&convert, &queue, &encoder, &taginject, &muxer])
                .map_err(|e| PipelineError::Link(format!("rtmp chain: {}", e)))?;
            ghost_pad(&bin, &convert, "sink", "sink")?;
            ghost_pad(&bin, &muxer, "src", "src")?;
            Ok(Some(bin))
        }
        "screen" => {
            let bin = gst::Bin::builder().name("video-bin").build();
            let queue1 = make_element("queue", "queue1")?;
            let convert = make_element("videoconvert", "videoconvert")?;
            let queue2 = make_element("queue", "queue2")?;

            bin.add_many([&queue1, &convert, &queue2])
                .map_err(|e| PipelineError::Link(e.to_string()))?;
            gst::Element::link_many([&queue1, &convert, &queue2])
                .map_err(|e| PipelineError::Link(format!("screen chain: {}", e)))?;
            ghost_pad(&bin, &queue1, "sink", "sink")?;
            ghost_pad(&bin, &queue2, "src", "src")?;
            Ok(Some(bin))
        }
        "rtsp" | "https" => Ok(None),
        other => Err(PipelineError::Unsupported(format!("unsupported output protocol {}", other))),
    }
}

/// Build the sink element for the configured destination.
pub(crate) fn build_sink(protocol: &str, location: &str) -> Result<gst::Element, PipelineError> {
    match protocol {
        "file" => {
            let sink = make_element("filesink", "sink")?;
            sink.set_property("location", location);
            Ok(sink)
        }
        "https" => {
            let sink = make_element("souphttpsink", "sink")?;
            sink.set_property("location", location);
            Ok(sink)
        }
        "rtmp" => {
            let sink = make_element("rtmpsink", "sink")?;
            sink.set_property("location", format!("rtmp://{}", location));
            Ok(sink)
        }
        "rtsp" => {
            let sink = make_element("rtspclientsink", "sink")?;
            sink.set_property("location", location);
            Ok(sink)
        }
        "screen" => make_element("autovideosink", "sink"),
        other => Err(PipelineError::Unsupported(format!("unsupported output protocol {}", other))),
    }
}
