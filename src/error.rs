//! Custom error types for visualaid.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the visualaid library.
#[derive(Error, Debug)]
pub enum Error {
    /// The source bytes are not a decodable image.
    #[error("failed to decode image: {source}")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to load a model (missing or corrupt file, runtime rejected it).
    #[error("failed to load model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The model is not loaded yet, or its last load failed.
    #[error("model not ready: {state}")]
    NotReady { state: String },

    /// A background load is already running for this model.
    #[error("model {name} is already loading")]
    LoadInProgress { name: String },

    /// Tensor shape does not match the model contract.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Model inference failed inside the backend runtime.
    #[error("model inference failed: {source}")]
    Inference {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Failed to create the model cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn model_load(
        name: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ModelLoad {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Wrap a runtime failure from any [`crate::model::InferenceBackend`].
    pub fn inference(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Inference {
            source: source.into(),
        }
    }

    pub(crate) fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether retrying the same request later can succeed.
    ///
    /// Only readiness problems are transient; shape and decode failures need a
    /// different model or input.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::LoadInProgress { .. })
    }
}

/// Result type alias for visualaid operations.
pub type Result<T> = std::result::Result<T, Error>;
