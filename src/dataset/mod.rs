//! Dataset module for thumbnail data handling
//!
//! This module provides functionality for:
//! - Discovering the two-class thumbnail directory tree and validating it
//! - Splitting it into training and validation partitions
//! - Decoding, resizing and augmenting images
//! - Streaming prefetched batches to the trainer

pub mod augmentation;
pub mod burn_dataset;
pub mod feed;
pub mod loader;
pub mod split;

// Re-export main types for convenience
pub use augmentation::{AugmentationConfig, AugmentationParams, Augmenter};
pub use burn_dataset::{
    load_image_data, ThumbnailBatch, ThumbnailBatcher, ThumbnailBurnDataset, ThumbnailItem,
};
pub use feed::{BatchStream, DataFeed, FeedConfig, LoadedBatch};
pub use loader::{DatasetStats, ImageSample, ThumbnailDataset, IMAGE_EXTENSIONS, NUM_CLASSES};
pub use split::DatasetSplit;
