//! # Thumbnail Detector
//!
//! Two-phase transfer learning that classifies 3D-model thumbnails as
//! AI-generated or human-created, built on the Burn framework, with export
//! to a portable JSON + raw-weights format for browser inference.
//!
//! ## Modules
//!
//! - `dataset`: Class-directory discovery, stratified split, augmentation and the prefetching batch feed
//! - `model`: MobileNetV2-style backbone, dense classification head, weight naming and pretrained import
//! - `training`: Phase state machine, epoch callbacks, checkpoints and history
//! - `export`: Portable model description, weight blob and class sidecar
//! - `inference`: Loading an export and thresholded predictions
//! - `pipeline`: The end-to-end run wiring everything together
//! - `utils`: Errors, logging, charts and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use thumbnail_detector::backend::{default_device, TrainingBackend};
//! use thumbnail_detector::pipeline::{run_training, RunOptions};
//! use thumbnail_detector::TrainingConfig;
//!
//! let config = TrainingConfig::default();
//! let summary = run_training::<TrainingBackend>(&config, &default_device(), RunOptions::default())?;
//! println!("exported to {:?}", summary.export.dir);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod export;
pub mod inference;
pub mod model;
pub mod pipeline;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::TrainingConfig;
pub use dataset::{DataFeed, DatasetSplit, ThumbnailDataset};
pub use export::{export_model, ClassInfo, ExportReport, PortableModel};
pub use inference::{Prediction, Predictor, Verdict, DEFAULT_VERDICT_THRESHOLD};
pub use model::{assemble, ThumbnailClassifier};
pub use pipeline::{export_checkpoint, run_training, RunOptions, RunSummary};
pub use training::{Phase, PhaseScheduler, TrainingHistory};
pub use utils::error::{ClassifierError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
