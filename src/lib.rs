//! framewire - distributed real-time video frame processing engine
//!
//! A media source is decoded into raw RGB frames by the input process,
//! passed through a user-supplied hook/plugin pipeline in one or more
//! worker processes, then re-encoded and written to a sink by the output
//! process. The processes communicate over bounded message sockets and can
//! be started independently or co-located.

pub mod config;
pub mod input;
pub mod media;
pub mod messages;
pub mod output;
pub mod transport;
pub mod worker;

// Re-exports
pub use config::Config;
pub use messages::{Message, RgbImage};
pub use transport::ShutdownFlag;
