//! Wire message taxonomy and codec
//!
//! Everything the three processes exchange travels as one of these tagged
//! variants, encoded with bincode. The pixel payload of a frame is carried
//! as a contiguous byte run so encoding never walks it element by element.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Codec and frame-construction errors
#[derive(Debug)]
pub enum MessageError {
    /// Serialization failed
    Encode(String),
    /// Payload could not be decoded into a known message
    Decode(String),
    /// Pixel buffer length does not match the frame dimensions
    BufferMismatch { expected: usize, actual: usize },
    /// Decode timestamp is later than the presentation timestamp
    TimestampOrder { dts: u64, pts: u64 },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Encode(msg) => write!(f, "message encoding failed: {}", msg),
            MessageError::Decode(msg) => write!(f, "message decoding failed: {}", msg),
            MessageError::BufferMismatch { expected, actual } => write!(
                f,
                "pixel buffer of {} bytes does not match frame dimensions ({} expected)",
                actual, expected
            ),
            MessageError::TimestampOrder { dts, pts } => {
                write!(f, "decode timestamp {} is later than presentation timestamp {}", dts, pts)
            }
        }
    }
}

impl Error for MessageError {}

/// A raw RGB frame plus the timing metadata the output needs to re-encode it.
///
/// The pixel buffer is immutable; user hooks replace it wholesale via
/// [`RgbImage::with_pixels`], never in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RgbImage {
    width: u32,
    height: u32,
    pixels: Bytes,
    /// Decode timestamp in nanoseconds, when the decoder stamped one
    dts: Option<u64>,
    /// Presentation timestamp in nanoseconds
    pts: Option<u64>,
    /// Frame duration in nanoseconds
    duration: Option<u64>,
    /// Wall-clock ingestion time, nanoseconds since the Unix epoch
    input_ts: u64,
    /// Framerate of the stream the frame belongs to
    fps: f64,
}

impl RgbImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: u32,
        height: u32,
        pixels: Bytes,
        dts: Option<u64>,
        pts: Option<u64>,
        duration: Option<u64>,
        input_ts: u64,
        fps: f64,
    ) -> Result<Self, MessageError> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(MessageError::BufferMismatch { expected, actual: pixels.len() });
        }
        if let (Some(dts), Some(pts)) = (dts, pts) {
            if dts > pts {
                return Err(MessageError::TimestampOrder { dts, pts });
            }
        }
        Ok(Self { width, height, pixels, dts, pts, duration, input_ts, fps })
    }

    /// Nanoseconds since the Unix epoch, for stamping ingestion time.
    pub fn now_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    pub fn into_pixels(self) -> Bytes {
        self.pixels
    }

    pub fn dts(&self) -> Option<u64> {
        self.dts
    }

    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    pub fn input_ts(&self) -> u64 {
        self.input_ts
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Whether `other` has the same dimensions as this frame.
    pub fn same_shape(&self, other: &RgbImage) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Returns a frame with the same metadata and a replacement pixel buffer.
    /// The new buffer must match the frame dimensions.
    pub fn with_pixels(&self, pixels: Bytes) -> Result<RgbImage, MessageError> {
        let expected = self.width as usize * self.height as usize * 3;
        if pixels.len() != expected {
            return Err(MessageError::BufferMismatch { expected, actual: pixels.len() });
        }
        let mut frame = self.clone();
        frame.pixels = pixels;
        Ok(frame)
    }
}

/// Tagged message variants exchanged between input, workers and output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Capability string describing the negotiated format of a new stream
    StreamCaps(String),
    /// Serialized media metadata tags
    Tags(String),
    /// End-of-stream marker, zero payload
    Eos,
    /// One decoded frame
    Frame(RgbImage),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serialize(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Message, MessageError> {
        bincode::deserialize(payload).map_err(|e| MessageError::Decode(e.to_string()))
    }

    /// Short name used in log lines and unexpected-message errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StreamCaps(_) => "caps",
            Message::Tags(_) => "tags",
            Message::Eos => "eos",
            Message::Frame(_) => "frame",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, MessageError, RgbImage};
    use bytes::Bytes;

    fn frame(width: u32, height: u32) -> RgbImage {
        let pixels = Bytes::from(vec![7u8; width as usize * height as usize * 3]);
        RgbImage::new(width, height, pixels, Some(40), Some(80), Some(33_333_333), 123_456, 30.0)
            .expect("valid frame")
    }

    #[test]
    fn round_trip_caps() {
        let msg = Message::StreamCaps("video/x-raw,format=RGB,width=640,height=480".into());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_tags() {
        let msg = Message::Tags("taglist, title=(string)\"clip\", bitrate=(uint)128000;".into());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trip_eos() {
        let decoded = Message::decode(&Message::Eos.encode().unwrap()).unwrap();
        assert_eq!(Message::Eos, decoded);
    }

    #[test]
    fn round_trip_frame_preserves_pixels() {
        let original = frame(320, 240);
        let msg = Message::Frame(original.clone());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::Frame(img) => {
                assert_eq!(img.width(), original.width());
                assert_eq!(img.height(), original.height());
                assert_eq!(img.pixels(), original.pixels());
                assert_eq!(img.dts(), original.dts());
                assert_eq!(img.pts(), original.pts());
                assert_eq!(img.duration(), original.duration());
                assert_eq!(img.fps(), original.fps());
            }
            other => panic!("decoded into {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let result = Message::decode(&[0xde, 0xad, 0xbe, 0xef, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(MessageError::Decode(_))));
    }

    #[test]
    fn buffer_length_must_match_dimensions() {
        let result = RgbImage::new(4, 4, Bytes::from(vec![0u8; 5]), None, None, None, 0, 30.0);
        assert!(matches!(result, Err(MessageError::BufferMismatch { expected: 48, actual: 5 })));
    }

    #[test]
    fn dts_must_not_exceed_pts() {
        let pixels = Bytes::from(vec![0u8; 12]);
        let result = RgbImage::new(2, 2, pixels, Some(90), Some(80), None, 0, 30.0);
        assert!(matches!(result, Err(MessageError::TimestampOrder { .. })));
    }

    #[test]
    fn replacement_buffer_keeps_metadata_and_checks_shape() {
        let original = frame(2, 2);
        let replaced = original.with_pixels(Bytes::from(vec![9u8; 12])).unwrap();
        assert_eq!(replaced.pts(), original.pts());
        assert_eq!(replaced.pixels()[0], 9);
        assert!(original.with_pixels(Bytes::from(vec![9u8; 13])).is_err());
    }
}
