//! Best-checkpoint persistence
//!
//! The checkpoint is a Burn record (`<path>.mpk`) plus a JSON sidecar
//! (`<path>.json`) holding the epoch, accuracy, class names and the run
//! configuration, which is enough to rebuild the architecture and export it
//! later without the original run.

use std::path::{Path, PathBuf};

use burn::{module::Module, tensor::backend::Backend};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::history::EpochRecord;
use super::phase::Phase;
use crate::config::TrainingConfig;
use crate::model::{record_file, ModelBlueprint, ThumbnailClassifier, WeightsRecorder};
use crate::utils::error::{ClassifierError, Result};

/// Metadata written next to the checkpoint record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub phase: Phase,
    pub global_epoch: usize,
    pub val_accuracy: f64,
    pub val_loss: f64,
    pub classes: Vec<String>,
    pub timestamp: String,
    pub config: TrainingConfig,
}

impl CheckpointMetadata {
    pub fn new(record: &EpochRecord, classes: &[String], config: &TrainingConfig) -> Self {
        Self {
            phase: record.phase,
            global_epoch: record.global_epoch,
            val_accuracy: record.val_accuracy,
            val_loss: record.val_loss,
            classes: classes.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
            config: config.clone(),
        }
    }
}

/// Path of the JSON sidecar for a checkpoint base path
pub fn metadata_file(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Overwrite the checkpoint at `path` with `model`
pub fn save_checkpoint<B: Backend>(
    model: &ThumbnailClassifier<B>,
    path: &Path,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    model
        .clone()
        .save_file(record_file(path), &WeightsRecorder::new())
        .map_err(|e| ClassifierError::Checkpoint(format!("cannot write {:?}: {:?}", path, e)))?;

    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(metadata_file(path), json)?;

    info!(
        "Checkpoint saved to {:?} (epoch {}, val_acc {:.4})",
        record_file(path),
        metadata.global_epoch,
        metadata.val_accuracy
    );
    Ok(())
}

/// Rebuild the classifier stored at `path`
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(ThumbnailClassifier<B>, CheckpointMetadata)> {
    let meta_path = metadata_file(path);
    let json = std::fs::read_to_string(&meta_path).map_err(|e| {
        ClassifierError::Checkpoint(format!("cannot read metadata {:?}: {}", meta_path, e))
    })?;
    let metadata: CheckpointMetadata = serde_json::from_str(&json)?;

    let blueprint = ModelBlueprint::from_config(&metadata.config, metadata.classes.len());
    let model = blueprint
        .init::<B>(device)
        .load_file(record_file(path), &WeightsRecorder::new(), device)
        .map_err(|e| ClassifierError::Checkpoint(format!("cannot load {:?}: {:?}", path, e)))?;

    info!(
        "Loaded checkpoint from {:?} (epoch {}, val_acc {:.4})",
        record_file(path),
        metadata.global_epoch,
        metadata.val_accuracy
    );
    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::collect_named_tensors;
    use crate::training::callbacks::EpochMetrics;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_config() -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![16];
        config.head.dropout = vec![0.3];
        config
    }

    #[test]
    fn test_save_then_load_restores_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints").join("best_model");
        let config = tiny_config();
        let device = Default::default();
        let model = ModelBlueprint::from_config(&config, 2).init::<TestBackend>(&device);

        let metrics = EpochMetrics {
            train_loss: 0.4,
            train_accuracy: 0.8,
            val_loss: 0.5,
            val_accuracy: 0.75,
        };
        let record = EpochRecord::new(Phase::PartialUnfreeze, 12, 3, &metrics, 1e-4);
        let classes = vec!["ai_generated".to_string(), "human_created".to_string()];
        let metadata = CheckpointMetadata::new(&record, &classes, &config);

        save_checkpoint(&model, &path, &metadata).unwrap();
        assert!(path.with_extension("mpk").is_file());
        assert!(path.with_extension("json").is_file());

        let (loaded, loaded_meta) = load_checkpoint::<TestBackend>(&path, &device).unwrap();
        assert_eq!(loaded_meta.global_epoch, 12);
        assert_eq!(loaded_meta.classes, classes);
        assert_eq!(loaded_meta.config, config);

        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let a = model.forward_softmax(images.clone());
        let b = loaded.forward_softmax(images);
        let diff = (a - b).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_checkpoint_keeps_full_precision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("best_model");
        let config = tiny_config();
        let device = Default::default();
        let model = ModelBlueprint::from_config(&config, 2).init::<TestBackend>(&device);

        let metrics = EpochMetrics {
            train_loss: 0.3,
            train_accuracy: 0.9,
            val_loss: 0.35,
            val_accuracy: 0.85,
        };
        let record = EpochRecord::new(Phase::PartialUnfreeze, 4, 1, &metrics, 1e-4);
        let classes = vec!["ai_generated".to_string(), "human_created".to_string()];
        save_checkpoint(&model, &path, &CheckpointMetadata::new(&record, &classes, &config)).unwrap();

        let (loaded, _) = load_checkpoint::<TestBackend>(&path, &device).unwrap();
        let before = collect_named_tensors(&model).unwrap();
        let after = collect_named_tensors(&loaded).unwrap();
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.values, b.values, "{} changed across save/load", a.name);
        }
    }

    #[test]
    fn test_missing_checkpoint_is_checkpoint_error() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let err = load_checkpoint::<TestBackend>(&dir.path().join("nope"), &device).unwrap_err();
        assert!(matches!(err, ClassifierError::Checkpoint(_)));
    }
}
