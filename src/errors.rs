use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the nuclear segmentation core.
///
/// # Recovery policy
///
/// `ModelNotAvailable` is the only variant the core recovers from itself: the
/// orchestrator switches to the fallback segmenter when the adapter reports it
/// is unavailable before a run starts. Every other variant is surfaced to the
/// caller as is. In particular a `ModelExecution` failure during a run that
/// was declared available is never downgraded to fallback output, so a
/// returned ROI collection is always produced by exactly one method.
#[derive(Error, Debug)]
pub enum NucleiSegError {
    #[error("Unsupported image format: {channels} channel(s), {bit_depth}-bit ({reason})")]
    UnsupportedImageFormat {
        channels: u8,
        bit_depth: u8,
        reason: String,
    },

    #[error("Model not available: {model_id}")]
    ModelNotAvailable { model_id: String },

    #[error("Model execution error: {operation} failed")]
    ModelExecution {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Illegal state: cannot {operation} while {state}")]
    IllegalState { operation: String, state: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, NucleiSegError>;

impl NucleiSegError {
    /// Wrap a backend failure with the operation that produced it.
    pub fn model_execution<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::ModelExecution {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True for the one variant the orchestrator may recover from.
    pub const fn is_model_not_available(&self) -> bool {
        matches!(self, Self::ModelNotAvailable { .. })
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `NucleiSegError::FileSystem` directly; this conversion is the fallback for
/// call sites that do not.
impl From<std::io::Error> for NucleiSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for NucleiSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model execution errors.
impl From<ort::Error> for NucleiSegError {
    fn from(err: ort::Error) -> Self {
        Self::model_execution("ort operation", err)
    }
}

/// Shape errors only arise while reshaping model tensors, so they belong to
/// the model execution category.
impl From<ndarray::ShapeError> for NucleiSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model_execution("tensor shape conversion", err)
    }
}
