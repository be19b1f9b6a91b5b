//! Burn Dataset Integration for thumbnails
//!
//! Implements Burn's `Dataset` trait for a partition of samples and a
//! `Batcher` that stacks decoded items into `[N, 3, S, S]` image tensors with
//! an integer target vector.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::ImageReader;
use rand_chacha::ChaCha8Rng;

use super::augmentation::Augmenter;
use super::loader::ImageSample;
use crate::utils::error::{ClassifierError, Result};

/// A single decoded thumbnail ready for Burn
#[derive(Clone, Debug)]
pub struct ThumbnailItem {
    /// Image data as flattened CHW float array [3 * S * S] in [0, 1]
    pub image: Vec<f32>,
    /// Class label
    pub label: usize,
    /// Source path (for logging skipped or mispredicted samples)
    pub path: PathBuf,
}

/// Decode an image file into preprocessed CHW data
pub fn load_image_data(
    path: &Path,
    augmenter: &Augmenter,
    rng: Option<&mut ChaCha8Rng>,
) -> Result<Vec<f32>> {
    let img = ImageReader::open(path)
        .map_err(|e| ClassifierError::Image(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| ClassifierError::Image(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| ClassifierError::Image(path.to_path_buf(), e.to_string()))?;

    Ok(augmenter.preprocess(&img, rng))
}

/// One partition of the dataset (training or validation)
///
/// Images are decoded lazily on every access; nothing is cached between epochs.
#[derive(Debug, Clone)]
pub struct ThumbnailBurnDataset {
    samples: Vec<ImageSample>,
    augmenter: Augmenter,
}

impl ThumbnailBurnDataset {
    pub fn new(samples: Vec<ImageSample>, augmenter: Augmenter) -> Self {
        Self { samples, augmenter }
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    /// Decode one sample, augmenting it when an RNG is supplied
    pub fn load(&self, index: usize, rng: Option<&mut ChaCha8Rng>) -> Result<ThumbnailItem> {
        let sample = self.samples.get(index).ok_or_else(|| {
            ClassifierError::Dataset(format!(
                "sample index {} out of range ({} samples)",
                index,
                self.samples.len()
            ))
        })?;

        let image = load_image_data(&sample.path, &self.augmenter, rng)?;

        Ok(ThumbnailItem {
            image,
            label: sample.label,
            path: sample.path.clone(),
        })
    }
}

impl Dataset<ThumbnailItem> for ThumbnailBurnDataset {
    fn get(&self, index: usize) -> Option<ThumbnailItem> {
        self.load(index, None).ok()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of thumbnails for training or evaluation
#[derive(Clone, Debug)]
pub struct ThumbnailBatch<B: Backend> {
    /// Images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Target labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// Batcher stacking decoded items into tensors
#[derive(Clone, Debug)]
pub struct ThumbnailBatcher<B: Backend> {
    image_size: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> ThumbnailBatcher<B> {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, ThumbnailItem, ThumbnailBatch<B>> for ThumbnailBatcher<B> {
    fn batch(&self, items: Vec<ThumbnailItem>, device: &B::Device) -> ThumbnailBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_data = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend(item.image);
            targets_data.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ThumbnailBatch { images, targets }
    }
}
