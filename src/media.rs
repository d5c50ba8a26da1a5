//! Media framework plumbing shared by the input and output pipelines

use gstreamer as gst;
use gstreamer::prelude::*;
use log::warn;
use std::error::Error;
use std::fmt;

/// Pipeline-side errors
#[derive(Debug)]
pub enum PipelineError {
    /// Media framework initialization failed
    Init(String),
    /// An element could not be created
    Element(String),
    /// Element linking failed
    Link(String),
    /// State change failed
    StateChange(String),
    /// The capability string could not be parsed
    Caps(String),
    /// The configured protocol or container has no pipeline recipe
    Unsupported(String),
    /// The decoder or encoder reported a fatal error on the bus
    Bus(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Init(msg) => write!(f, "media framework init failed: {}", msg),
            PipelineError::Element(msg) => write!(f, "element creation failed: {}", msg),
            PipelineError::Link(msg) => write!(f, "element linking failed: {}", msg),
            PipelineError::StateChange(msg) => write!(f, "state change failed: {}", msg),
            PipelineError::Caps(msg) => write!(f, "bad capability string: {}", msg),
            PipelineError::Unsupported(msg) => write!(f, "unsupported output: {}", msg),
            PipelineError::Bus(msg) => write!(f, "pipeline error: {}", msg),
        }
    }
}

impl Error for PipelineError {}

/// Initialize the media framework. Safe to call more than once.
pub fn init() -> Result<(), PipelineError> {
    gst::init().map_err(|e| PipelineError::Init(e.to_string()))
}

/// Builder-style element construction with uniform error mapping.
pub fn make_element(factory: &str, name: &str) -> Result<gst::Element, PipelineError> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| PipelineError::Element(format!("failed to create {}: {}", factory, e)))
}

/// Expose one pad of an element inside a bin under a ghost pad, so the bin
/// links like a plain element.
pub fn ghost_pad(
    bin: &gst::Bin,
    element: &gst::Element,
    pad_name: &str,
    ghost_name: &str,
) -> Result<(), PipelineError> {
    let target = element.static_pad(pad_name).ok_or_else(|| {
        PipelineError::Link(format!("{} has no {} pad", element.name(), pad_name))
    })?;
    let ghost = gst::GhostPad::builder_with_target(&target)
        .map_err(|e| PipelineError::Link(e.to_string()))?
        .name(ghost_name)
        .build();
    bin.add_pad(&ghost).map_err(|e| PipelineError::Link(e.to_string()))?;
    Ok(())
}

/// Width, height and framerate negotiated for a stream, extracted from its
/// capability string. The output uses it to parameterize the appsrc; the
/// input uses it to stamp frames with the stream framerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamShape {
    pub width: i32,
    pub height: i32,
    pub fps_n: i32,
    pub fps_d: i32,
}

impl StreamShape {
    pub fn from_caps(caps: &gst::CapsRef) -> Result<StreamShape, PipelineError> {
        let structure = caps
            .structure(0)
            .ok_or_else(|| PipelineError::Caps("caps carry no structure".to_string()))?;
        let width = structure
            .get::<i32>("width")
            .map_err(|_| PipelineError::Caps("caps carry no width".to_string()))?;
        let height = structure
            .get::<i32>("height")
            .map_err(|_| PipelineError::Caps("caps carry no height".to_string()))?;
        let (fps_n, fps_d) = match structure.get::<gst::Fraction>("framerate") {
            Ok(fraction) => (fraction.numer(), fraction.denom()),
            Err(_) => {
                warn!("Caps carry no framerate, assuming 30/1");
                (30, 1)
            }
        };
        Ok(StreamShape { width, height, fps_n, fps_d })
    }

    pub fn from_caps_str(caps: &str) -> Result<StreamShape, PipelineError> {
        let caps = caps
            .parse::<gst::Caps>()
            .map_err(|_| PipelineError::Caps(format!("unparseable caps: {}", caps)))?;
        StreamShape::from_caps(&caps)
    }

    pub fn fps(&self) -> f64 {
        if self.fps_d == 0 {
            0.0
        } else {
            self.fps_n as f64 / self.fps_d as f64
        }
    }

    pub fn framerate(&self) -> gst::Fraction {
        gst::Fraction::new(self.fps_n, self.fps_d)
    }
}

#[cfg(test)]
mod tests {
    use super::StreamShape;

    #[test]
    fn shape_from_caps_string() {
        super::init().unwrap();
        let shape =
            StreamShape::from_caps_str("video/x-raw,format=RGB,width=1280,height=720,framerate=30/1")
                .unwrap();
        assert_eq!(shape.width, 1280);
        assert_eq!(shape.height, 720);
        assert_eq!(shape.fps(), 30.0);
    }

    #[test]
    fn fractional_framerate() {
        super::init().unwrap();
        let shape = StreamShape::from_caps_str(
            "video/x-raw,format=RGB,width=640,height=480,framerate=30000/1001",
        )
        .unwrap();
        assert!((shape.fps() - 29.97).abs() < 0.01);
    }

    #[test]
    fn caps_without_dimensions_are_rejected() {
        super::init().unwrap();
        assert!(StreamShape::from_caps_str("video/x-raw,format=RGB").is_err());
    }
}
