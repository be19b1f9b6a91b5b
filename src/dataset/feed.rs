//! Augmented data feed
//!
//! Produces the two batch sequences consumed by the trainer:
//!
//! - **training**: order reshuffled every epoch, one augmentation draw per
//!   sample per epoch
//! - **validation**: fixed order, no augmentation, identical every epoch
//!
//! Each epoch is decoded on a background worker that stays at most
//! `prefetch_batches` ahead of the consumer. Samples inside one batch are
//! decoded in parallel with rayon; the collected order always matches the
//! sample order, so the stream is deterministic for a given seed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::augmentation::{AugmentationConfig, Augmenter};
use super::burn_dataset::{ThumbnailBurnDataset, ThumbnailItem};
use super::split::DatasetSplit;

/// Settings for the data feed
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub image_size: usize,
    pub batch_size: usize,
    /// Number of decoded batches the worker may queue ahead of the trainer
    pub prefetch_batches: usize,
    pub seed: u64,
    pub augmentation: AugmentationConfig,
}

/// A decoded batch, before it is turned into tensors
#[derive(Debug)]
pub struct LoadedBatch {
    pub items: Vec<ThumbnailItem>,
    /// Samples of this batch that failed to decode
    pub dropped: usize,
}

/// Lazy, finite sequence of batches for one epoch
pub struct BatchStream {
    receiver: Option<Receiver<LoadedBatch>>,
    worker: Option<JoinHandle<()>>,
    num_batches: usize,
}

impl BatchStream {
    /// Number of batches this epoch will yield
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }
}

impl Iterator for BatchStream {
    type Item = LoadedBatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.as_ref()?.recv().ok()
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        // Dropping the receiver unblocks a worker waiting on a full channel.
        self.receiver.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Training and validation batch source for a run
pub struct DataFeed {
    train: Arc<ThumbnailBurnDataset>,
    validation: Arc<ThumbnailBurnDataset>,
    config: FeedConfig,
    epoch: u64,
    decode_failures: Arc<AtomicUsize>,
}

impl DataFeed {
    pub fn new(split: &DatasetSplit, config: FeedConfig) -> Self {
        let size = config.image_size as u32;
        let train = ThumbnailBurnDataset::new(
            split.train.clone(),
            Augmenter::new(config.augmentation.clone(), size),
        );
        let validation =
            ThumbnailBurnDataset::new(split.validation.clone(), Augmenter::no_augmentation(size));

        Self {
            train: Arc::new(train),
            validation: Arc::new(validation),
            config,
            epoch: 0,
            decode_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn train_len(&self) -> usize {
        self.train.samples().len()
    }

    pub fn validation_len(&self) -> usize {
        self.validation.samples().len()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    /// ceil(samples / batch_size)
    pub fn batches_per_epoch(&self, samples: usize) -> usize {
        samples.div_ceil(self.config.batch_size.max(1))
    }

    /// Total per-sample decode failures since the feed was created
    pub fn decode_failures(&self) -> usize {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Start a training epoch: fresh shuffle, fresh augmentation draws
    pub fn train_epoch(&mut self) -> BatchStream {
        let epoch = self.epoch;
        self.epoch += 1;

        let mut order: Vec<usize> = (0..self.train_len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.config.seed, epoch, u64::MAX));
        order.shuffle(&mut rng);

        debug!("Training epoch {} order drawn ({} samples)", epoch, order.len());
        self.spawn(Arc::clone(&self.train), order, Some(epoch))
    }

    /// Start a validation pass in the fixed partition order
    pub fn validation_epoch(&self) -> BatchStream {
        let order: Vec<usize> = (0..self.validation_len()).collect();
        self.spawn(Arc::clone(&self.validation), order, None)
    }

    fn spawn(
        &self,
        dataset: Arc<ThumbnailBurnDataset>,
        order: Vec<usize>,
        augment_epoch: Option<u64>,
    ) -> BatchStream {
        let batch_size = self.config.batch_size.max(1);
        let num_batches = self.batches_per_epoch(order.len());
        let (sender, receiver) = sync_channel(self.config.prefetch_batches.max(1));
        let failures = Arc::clone(&self.decode_failures);
        let seed = self.config.seed;

        let worker = std::thread::spawn(move || {
            for chunk in order.chunks(batch_size) {
                let results: Vec<_> = chunk
                    .par_iter()
                    .map(|&index| match augment_epoch {
                        Some(epoch) => {
                            let mut rng =
                                ChaCha8Rng::seed_from_u64(mix_seed(seed, epoch, index as u64));
                            dataset.load(index, Some(&mut rng))
                        }
                        None => dataset.load(index, None),
                    })
                    .collect();

                let mut items = Vec::with_capacity(results.len());
                let mut dropped = 0;
                for result in results {
                    match result {
                        Ok(item) => items.push(item),
                        Err(e) => {
                            warn!("Dropping sample: {}", e);
                            dropped += 1;
                        }
                    }
                }
                failures.fetch_add(dropped, Ordering::Relaxed);

                if sender.send(LoadedBatch { items, dropped }).is_err() {
                    break;
                }
            }
        });

        BatchStream {
            receiver: Some(receiver),
            worker: Some(worker),
            num_batches,
        }
    }
}

/// Derive an independent RNG seed for (run seed, epoch, sample)
fn mix_seed(seed: u64, epoch: u64, index: u64) -> u64 {
    let mut z = seed
        ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_dataset;
    use crate::dataset::ThumbnailDataset;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn feed(counts: &[(&str, usize)], batch_size: usize) -> (TempDir, DataFeed) {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), counts, 12);
        let ds = ThumbnailDataset::discover(dir.path()).unwrap();
        let split = DatasetSplit::partition(&ds, 0.2, 42).unwrap();
        let config = FeedConfig {
            image_size: 8,
            batch_size,
            prefetch_batches: 2,
            seed: 42,
            augmentation: AugmentationConfig::default(),
        };
        (dir, DataFeed::new(&split, config))
    }

    fn paths(stream: BatchStream) -> Vec<PathBuf> {
        stream
            .flat_map(|b| b.items.into_iter().map(|i| i.path))
            .collect()
    }

    #[test]
    fn test_validation_order_identical_across_epochs() {
        let (_dir, mut feed) = feed(&[("a", 10), ("b", 10)], 3);
        let first = paths(feed.validation_epoch());
        let _ = paths(feed.train_epoch());
        let second = paths(feed.validation_epoch());
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn test_validation_is_not_augmented() {
        let (_dir, feed) = feed(&[("a", 10), ("b", 10)], 4);
        let first: Vec<Vec<f32>> = feed
            .validation_epoch()
            .flat_map(|b| b.items.into_iter().map(|i| i.image))
            .collect();
        let second: Vec<Vec<f32>> = feed
            .validation_epoch()
            .flat_map(|b| b.items.into_iter().map(|i| i.image))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_train_epoch_covers_every_sample_once() {
        let (_dir, mut feed) = feed(&[("a", 10), ("b", 15)], 4);
        assert_eq!(feed.train_len(), 20);

        let stream = feed.train_epoch();
        assert_eq!(stream.num_batches(), 5);
        let batches: Vec<LoadedBatch> = stream.collect();
        assert_eq!(batches.len(), 5);
        assert!(batches[..4].iter().all(|b| b.items.len() == 4));

        let seen: HashSet<PathBuf> = batches
            .into_iter()
            .flat_map(|b| b.items.into_iter().map(|i| i.path))
            .collect();
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_last_batch_may_be_short() {
        let (_dir, mut feed) = feed(&[("a", 10), ("b", 15)], 6);
        let sizes: Vec<usize> = feed.train_epoch().map(|b| b.items.len()).collect();
        assert_eq!(sizes, vec![6, 6, 6, 2]);
    }

    #[test]
    fn test_training_order_reshuffled_each_epoch() {
        let (_dir, mut feed) = feed(&[("a", 10), ("b", 15)], 5);
        let first = paths(feed.train_epoch());
        let second = paths(feed.train_epoch());
        assert_eq!(first.len(), second.len());
        assert_ne!(first, second);
    }

    #[test]
    fn test_decode_failures_dropped_and_counted() {
        let (_dir, mut feed) = feed(&[("a", 10), ("b", 10)], 4);
        let victim = feed.train.samples()[0].path.clone();
        std::fs::write(&victim, b"corrupted after discovery").unwrap();

        let batches: Vec<LoadedBatch> = feed.train_epoch().collect();
        let delivered: usize = batches.iter().map(|b| b.items.len()).sum();
        let dropped: usize = batches.iter().map(|b| b.dropped).sum();

        assert_eq!(delivered, 15);
        assert_eq!(dropped, 1);
        assert_eq!(feed.decode_failures(), 1);
    }

    #[test]
    fn test_dropping_stream_early_stops_worker() {
        let (_dir, mut feed) = feed(&[("a", 20), ("b", 20)], 2);
        let mut stream = feed.train_epoch();
        assert!(stream.next().is_some());
        drop(stream);
    }

    #[test]
    fn test_mix_seed_varies() {
        assert_ne!(mix_seed(42, 0, 1), mix_seed(42, 0, 2));
        assert_ne!(mix_seed(42, 0, 1), mix_seed(42, 1, 1));
        assert_eq!(mix_seed(42, 3, 7), mix_seed(42, 3, 7));
    }
}
