//! Training / validation split
//!
//! The split is computed once per run, per class, so both partitions keep the
//! class ratio of the discovered dataset. Within a class the sorted sample list
//! is shuffled with a seeded RNG and the first `round(fraction * n)` samples go
//! to validation. The same dataset, fraction and seed always yield the same split.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::loader::{ImageSample, ThumbnailDataset};
use crate::utils::error::{ClassifierError, Result};

/// Deterministic partition of the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSplit {
    /// Samples used for optimization (augmented, reshuffled every epoch)
    pub train: Vec<ImageSample>,
    /// Held-out samples, never augmented, fixed order
    pub validation: Vec<ImageSample>,
    pub validation_fraction: f64,
    pub seed: u64,
}

impl DatasetSplit {
    /// Partition a discovered dataset
    pub fn partition(
        dataset: &ThumbnailDataset,
        validation_fraction: f64,
        seed: u64,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&validation_fraction) || validation_fraction == 0.0 {
            return Err(ClassifierError::Config(format!(
                "validation_split must be in (0, 1), got {}",
                validation_fraction
            )));
        }

        let mut train = Vec::new();
        let mut validation = Vec::new();

        for label in 0..dataset.num_classes() {
            let mut class_samples: Vec<ImageSample> =
                dataset.samples_of_class(label).into_iter().cloned().collect();
            class_samples.sort_by(|a, b| a.path.cmp(&b.path));

            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(label as u64));
            class_samples.shuffle(&mut rng);

            let n_val = (class_samples.len() as f64 * validation_fraction).round() as usize;
            let train_part = class_samples.split_off(n_val);
            validation.extend(class_samples);
            train.extend(train_part);
        }

        if train.is_empty() {
            return Err(ClassifierError::Dataset(
                "training partition is empty; add images or lower validation_split".to_string(),
            ));
        }
        if validation.is_empty() {
            return Err(ClassifierError::Dataset(
                "validation partition is empty; add images or raise validation_split".to_string(),
            ));
        }

        info!(
            "Split {} samples: {} training, {} validation ({:.0}% held out)",
            train.len() + validation.len(),
            train.len(),
            validation.len(),
            validation_fraction * 100.0
        );

        Ok(Self {
            train,
            validation,
            validation_fraction,
            seed,
        })
    }

    /// Per-class counts of (train, validation)
    pub fn class_counts(&self, num_classes: usize) -> Vec<(usize, usize)> {
        let mut counts = vec![(0usize, 0usize); num_classes];
        for s in &self.train {
            counts[s.label].0 += 1;
        }
        for s in &self.validation {
            counts[s.label].1 += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_dataset;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn dataset(counts: &[(&str, usize)]) -> (TempDir, ThumbnailDataset) {
        let dir = TempDir::new().unwrap();
        write_dataset(dir.path(), counts, 4);
        let ds = ThumbnailDataset::discover(dir.path()).unwrap();
        (dir, ds)
    }

    #[test]
    fn test_reference_split_sizes() {
        let (_dir, ds) = dataset(&[("ai_generated", 120), ("human_created", 130)]);
        let split = DatasetSplit::partition(&ds, 0.2, 42).unwrap();

        assert_eq!(split.validation.len(), 50);
        assert_eq!(split.train.len(), 200);
        assert_eq!(split.class_counts(2), vec![(96, 24), (104, 26)]);
    }

    #[test]
    fn test_partitions_are_disjoint_and_complete() {
        let (_dir, ds) = dataset(&[("ai_generated", 17), ("human_created", 23)]);
        let split = DatasetSplit::partition(&ds, 0.2, 7).unwrap();

        let train: HashSet<_> = split.train.iter().map(|s| &s.path).collect();
        let val: HashSet<_> = split.validation.iter().map(|s| &s.path).collect();
        assert!(train.is_disjoint(&val));
        assert_eq!(train.len() + val.len(), ds.len());
    }

    #[test]
    fn test_split_is_deterministic() {
        let (_dir, ds) = dataset(&[("a", 20), ("b", 20)]);
        let first = DatasetSplit::partition(&ds, 0.25, 42).unwrap();
        let second = DatasetSplit::partition(&ds, 0.25, 42).unwrap();
        assert_eq!(first.validation, second.validation);
        assert_eq!(first.train, second.train);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let (_dir, ds) = dataset(&[("a", 5), ("b", 5)]);
        assert!(DatasetSplit::partition(&ds, 0.0, 1).is_err());
        assert!(DatasetSplit::partition(&ds, 1.0, 1).is_err());
    }

    #[test]
    fn test_empty_validation_partition_rejected() {
        let (_dir, ds) = dataset(&[("a", 1), ("b", 1)]);
        let err = DatasetSplit::partition(&ds, 0.2, 1).unwrap_err();
        assert!(matches!(err, ClassifierError::Dataset(_)));
    }
}
