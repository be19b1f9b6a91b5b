//! Model Assembler
//!
//! Builds the classifier exactly once per run: the pretrained backbone is read
//! from a Burn record file, a fresh head is stacked on top, and the backbone is
//! frozen. A missing or unreadable record fails the run before any epoch.

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::info;

use super::backbone::{Backbone, BackboneConfig};
use super::classifier::{ClassifierHead, ThumbnailClassifier};
use crate::config::{BackboneSettings, HeadSettings, TrainingConfig};
use crate::utils::error::{ClassifierError, Result};

/// Recorder for backbone and checkpoint records, stored in f32
pub type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Extension the recorder appends to record files
pub const RECORD_EXTENSION: &str = "mpk";

/// Path the recorder actually reads or writes for `path`
pub fn record_file(path: &Path) -> PathBuf {
    path.with_extension(RECORD_EXTENSION)
}

/// Everything needed to rebuild the classifier architecture
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBlueprint {
    pub num_classes: usize,
    pub backbone: BackboneSettings,
    pub head: HeadSettings,
}

impl ModelBlueprint {
    pub fn from_config(config: &TrainingConfig, num_classes: usize) -> Self {
        Self {
            num_classes,
            backbone: config.backbone.clone(),
            head: config.head.clone(),
        }
    }

    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new()
            .with_width_multiplier(self.backbone.width_multiplier)
            .with_last_channels(self.backbone.last_channels)
    }

    /// Randomly initialized classifier (used before loading exported weights)
    pub fn init<B: Backend>(&self, device: &B::Device) -> ThumbnailClassifier<B> {
        let backbone = Backbone::new(&self.backbone_config(), device);
        self.with_backbone(backbone, device)
    }

    /// Stack a fresh head on an existing backbone; the backbone starts frozen
    pub fn with_backbone<B: Backend>(
        &self,
        backbone: Backbone<B>,
        device: &B::Device,
    ) -> ThumbnailClassifier<B> {
        let head = ClassifierHead::new(backbone.out_channels(), self.num_classes, &self.head, device);
        ThumbnailClassifier::new(backbone, head)
    }
}

/// Load pretrained backbone weights from a record file
pub fn load_backbone<B: Backend>(
    blueprint: &ModelBlueprint,
    weights: &Path,
    device: &B::Device,
) -> Result<Backbone<B>> {
    let file = record_file(weights);
    if !file.is_file() {
        return Err(ClassifierError::WeightsUnavailable {
            path: file,
            reason: "file not found".to_string(),
        });
    }

    Backbone::new(&blueprint.backbone_config(), device)
        .load_file(file.clone(), &WeightsRecorder::new(), device)
        .map_err(|e| ClassifierError::WeightsUnavailable {
            path: file,
            reason: format!("{:?}", e),
        })
}

/// Save a backbone so it can serve as pretrained weights for a later run
pub fn save_backbone<B: Backend>(backbone: &Backbone<B>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    backbone
        .clone()
        .save_file(record_file(path), &WeightsRecorder::new())
        .map_err(|e| ClassifierError::Checkpoint(format!("cannot save backbone: {:?}", e)))
}

/// Build the classifier for a run: pretrained frozen backbone + fresh head
pub fn assemble<B: Backend>(
    config: &TrainingConfig,
    num_classes: usize,
    device: &B::Device,
) -> Result<ThumbnailClassifier<B>> {
    let blueprint = ModelBlueprint::from_config(config, num_classes);
    let backbone = load_backbone::<B>(&blueprint, &config.backbone_weights, device)?;
    let model = blueprint.with_backbone(backbone, device);

    let summary = model.trainable_summary();
    info!(
        "Assembled classifier: {} backbone layers (all frozen), {} trainable / {} frozen parameters",
        summary.backbone_layers, summary.trainable_params, summary.frozen_params
    );

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_config(dir: &Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![16, 8];
        config.backbone_weights = dir.join("backbone.mpk");
        config
    }

    #[test]
    fn test_missing_weights_is_weights_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let device = Default::default();

        let err = assemble::<TestBackend>(&config, 2, &device).unwrap_err();
        assert!(matches!(err, ClassifierError::WeightsUnavailable { .. }));
    }

    #[test]
    fn test_corrupt_weights_is_weights_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        std::fs::write(&config.backbone_weights, b"garbage").unwrap();
        let device = Default::default();

        let err = assemble::<TestBackend>(&config, 2, &device).unwrap_err();
        assert!(matches!(err, ClassifierError::WeightsUnavailable { .. }));
    }

    #[test]
    fn test_assemble_loads_saved_backbone() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let device = Default::default();
        let blueprint = ModelBlueprint::from_config(&config, 2);

        let pretrained = Backbone::<TestBackend>::new(&blueprint.backbone_config(), &device);
        save_backbone(&pretrained, &config.backbone_weights).unwrap();

        let model = assemble::<TestBackend>(&config, 2, &device).unwrap();
        assert_eq!(model.num_classes(), 2);
        assert_eq!(model.trainable_from(), model.backbone.num_layers());

        let expected = pretrained.stem.conv.weight.val();
        let loaded = model.backbone.stem.conv.weight.val();
        let diff = (expected - loaded).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
