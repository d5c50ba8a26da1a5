//! Inference session boundary
//!
//! The engine never touches a model runtime directly: the user artifact may
//! export a session factory, and the worker drives whatever it returns
//! through the `run(frame) -> tensor` contract. Loading problems are fatal
//! at worker startup; the session itself is owned by one worker and lives
//! for the whole process.

use crate::config::InferenceConfig;
use crate::messages::RgbImage;
use libloading::Library;
use std::error::Error;
use std::fmt;
use std::path::Path;

/// Symbol the user artifact exports to provide a session factory.
pub const INFERENCE_SYMBOL: &[u8] = b"framewire_inference";

/// Signature of the exported factory.
pub type SessionFactory = fn(&InferenceConfig) -> Result<Box<dyn InferenceSession>, String>;

/// Inference errors
#[derive(Debug)]
pub enum InferenceError {
    /// Model download, parse or check failed while building the session
    ModelLoad(String),
    /// The session failed on a frame
    Run(String),
    /// Tensor shape and data length disagree
    Shape { expected: usize, actual: usize },
}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceError::ModelLoad(msg) => write!(f, "failed to load inference model: {}", msg),
            InferenceError::Run(msg) => write!(f, "inference failed: {}", msg),
            InferenceError::Shape { expected, actual } => {
                write!(f, "tensor of {} values does not match its shape ({} expected)", actual, expected)
            }
        }
    }
}

impl Error for InferenceError {}

/// Opaque model output handed to the post-process hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Tensor, InferenceError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(InferenceError::Shape { expected, actual: data.len() });
        }
        Ok(Tensor { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// A loaded model ready to run over frames.
pub trait InferenceSession: Send {
    fn run(&mut self, frame: &RgbImage) -> Result<Tensor, InferenceError>;
}

/// Resolve the model URI and build the session through the factory the user
/// artifact exports.
pub fn load_session(
    config: &InferenceConfig,
    artifact: &Library,
) -> Result<Box<dyn InferenceSession>, InferenceError> {
    if let Some(path) = config.model_uri.strip_prefix("file://") {
        if !Path::new(path).is_file() {
            return Err(InferenceError::ModelLoad(format!(
                "model file {} does not exist",
                path
            )));
        }
    }
    let factory: libloading::Symbol<SessionFactory> = unsafe { artifact.get(INFERENCE_SYMBOL) }
        .map_err(|_| {
            InferenceError::ModelLoad(format!(
                "a model is configured ({}) but the app artifact exports no inference session factory",
                config.model_uri
            ))
        })?;
    factory(config).map_err(InferenceError::ModelLoad)
}

#[cfg(test)]
mod tests {
    use super::{InferenceError, Tensor};

    #[test]
    fn tensor_shape_must_match_data() {
        assert!(Tensor::new(vec![1, 3, 2], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::new(vec![1, 3, 2], vec![0.0; 5]),
            Err(InferenceError::Shape { expected: 6, actual: 5 })
        ));
    }
}
