//! Inference module for exported models
//!
//! Loads the portable export produced by the training run and classifies
//! single images or whole directories of thumbnails.

pub mod predictor;

pub use predictor::{FolderSummary, Prediction, Predictor, Verdict};

/// Verdict threshold used when neither the sidecar nor the caller sets one
pub const DEFAULT_VERDICT_THRESHOLD: f64 = 0.6;
