//! Error Handling Module
//!
//! Defines the error type shared by the data feed, the model assembler,
//! the phase scheduler, the export pipeline and the predictor.
//! Messages are written for the operator running the trainer.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for thumbnail detector operations
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// The dataset root is missing, malformed, or yields no usable images
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// The pretrained backbone weights could not be obtained
    #[error("Pretrained backbone weights unavailable at '{path}': {reason}")]
    WeightsUnavailable { path: PathBuf, reason: String },

    /// Writing the export artifact or its sidecar failed
    #[error("Export failed: {0}")]
    Export(String),

    /// Persisting or restoring a checkpoint failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error decoding a single image
    #[error("Failed to load image at '{0}': {1}")]
    Image(PathBuf, String),

    /// Error while running inference on an exported model
    #[error("Inference error: {0}")]
    Inference(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    /// Short operator-facing hint describing how to fix the failed precondition
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ClassifierError::Dataset(_) => Some(
                "Expected <dataset>/<class_a>/ and <dataset>/<class_b>/ with jpg/png/webp images. \
                 Run the thumbnail collector first or pass --data-dir.",
            ),
            ClassifierError::WeightsUnavailable { .. } => Some(
                "Run `thumbnail_detector fetch-weights` to import ImageNet MobileNetV2 weights, \
                 or point --backbone-weights at an existing backbone record.",
            ),
            ClassifierError::Export(_) => Some(
                "Check that the output directory is writable. The best checkpoint can be \
                 exported again with `thumbnail_detector export --checkpoint <path>`.",
            ),
            ClassifierError::Checkpoint(_) | ClassifierError::Io(_) => {
                Some("Check that the target directory exists and is writable.")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        ClassifierError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::Image(PathBuf::new(), err.to_string())
    }
}

/// Convenience Result type for thumbnail detector operations
pub type Result<T> = std::result::Result<T, ClassifierError>;
