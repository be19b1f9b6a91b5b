//! Run Configuration Module
//!
//! A single immutable [`TrainingConfig`] value describes a whole run: where the
//! data and weights live, how the feed augments, how the two phases are
//! scheduled and how exported models turn probabilities into verdicts.
//! It is serialized verbatim into every export sidecar.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::augmentation::AugmentationConfig;
use crate::dataset::feed::FeedConfig;
use crate::inference::DEFAULT_VERDICT_THRESHOLD;
use crate::utils::error::{ClassifierError, Result};

/// Backbone construction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneSettings {
    /// Channel width multiplier applied to every inverted-residual stage
    pub width_multiplier: f64,
    /// Channels produced by the final 1x1 convolution
    pub last_channels: usize,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            width_multiplier: 1.0,
            last_channels: 1280,
        }
    }
}

/// Classification head settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadSettings {
    /// Units of each dense block, in order
    pub hidden_units: Vec<usize>,
    /// Dropout applied after each dense block (same length as `hidden_units`)
    pub dropout: Vec<f64>,
}

impl Default for HeadSettings {
    fn default() -> Self {
        Self {
            hidden_units: vec![256, 128],
            dropout: vec![0.5, 0.3],
        }
    }
}

/// Configuration for a full two-phase training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Root of the labeled thumbnail tree
    pub dataset_dir: PathBuf,
    /// Directory receiving model.json, weights.bin and class_info.json
    pub export_dir: PathBuf,
    /// Best checkpoint written during phase 2 (Burn record, extension added by the recorder)
    pub checkpoint_path: PathBuf,
    /// Directory receiving the run history and its chart
    pub report_dir: PathBuf,
    /// Pretrained backbone record
    pub backbone_weights: PathBuf,

    /// Square input resolution
    pub image_size: usize,
    pub batch_size: usize,
    pub validation_split: f64,
    pub seed: u64,
    /// Batches decoded ahead of the trainer
    pub prefetch_batches: usize,

    pub epochs_phase1: usize,
    pub epochs_phase2: usize,
    pub learning_rate_phase1: f64,
    pub learning_rate_phase2: f64,
    /// Backbone layers made trainable in phase 2, counted from the output end
    pub unfreeze_layer_count: usize,

    pub early_stop_patience: usize,
    pub lr_reduce_patience_phase1: usize,
    pub lr_reduce_patience_phase2: usize,
    pub lr_reduce_factor: f64,
    pub lr_floor_phase1: f64,
    pub lr_floor_phase2: f64,
    /// Minimum validation-loss decrease that counts as an improvement
    pub lr_min_delta: f64,

    /// Probability a class must exceed for a confident verdict
    pub verdict_threshold: f64,

    pub augmentation: AugmentationConfig,
    pub backbone: BackboneSettings,
    pub head: HeadSettings,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset"),
            export_dir: PathBuf::from("web_model"),
            checkpoint_path: PathBuf::from("best_model"),
            report_dir: PathBuf::from("reports"),
            backbone_weights: PathBuf::from("weights/mobilenet_v2_backbone.mpk"),
            image_size: 224,
            batch_size: 32,
            validation_split: 0.2,
            seed: 42,
            prefetch_batches: 4,
            epochs_phase1: 20,
            epochs_phase2: 10,
            learning_rate_phase1: 1e-3,
            learning_rate_phase2: 1e-4,
            unfreeze_layer_count: 30,
            early_stop_patience: 5,
            lr_reduce_patience_phase1: 3,
            lr_reduce_patience_phase2: 2,
            lr_reduce_factor: 0.5,
            lr_floor_phase1: 1e-5,
            lr_floor_phase2: 1e-6,
            lr_min_delta: 1e-4,
            verdict_threshold: DEFAULT_VERDICT_THRESHOLD,
            augmentation: AugmentationConfig::default(),
            backbone: BackboneSettings::default(),
            head: HeadSettings::default(),
        }
    }
}

/// A verdict threshold below 0.5 could name two classes at once
pub fn check_verdict_threshold(threshold: f64) -> Result<()> {
    if (0.5..1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ClassifierError::Config(format!(
            "verdict_threshold must be in [0.5, 1), got {}",
            threshold
        )))
    }
}

impl TrainingConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ClassifierError::Config(msg.to_string()));

        if self.image_size < 32 {
            return fail("image_size must be at least 32 (the backbone downsamples by 32)");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be greater than 0");
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return fail("validation_split must be in (0, 1)");
        }
        if self.epochs_phase1 == 0 {
            return fail("epochs_phase1 must be greater than 0");
        }
        if self.learning_rate_phase1 <= 0.0 || self.learning_rate_phase2 <= 0.0 {
            return fail("learning rates must be positive");
        }
        if self.learning_rate_phase2 >= self.learning_rate_phase1 {
            return fail("learning_rate_phase2 must be strictly lower than learning_rate_phase1");
        }
        if self.early_stop_patience == 0
            || self.lr_reduce_patience_phase1 == 0
            || self.lr_reduce_patience_phase2 == 0
        {
            return fail("patience values must be at least 1");
        }
        if !(self.lr_reduce_factor > 0.0 && self.lr_reduce_factor < 1.0) {
            return fail("lr_reduce_factor must be in (0, 1)");
        }
        if self.lr_floor_phase1 <= 0.0 || self.lr_floor_phase2 <= 0.0 || self.lr_min_delta < 0.0 {
            return fail("lr floors must be positive and lr_min_delta non-negative");
        }
        check_verdict_threshold(self.verdict_threshold)?;
        if self.backbone.width_multiplier <= 0.0 || self.backbone.last_channels == 0 {
            return fail("backbone width_multiplier and last_channels must be positive");
        }
        if self.head.hidden_units.len() != self.head.dropout.len() {
            return fail("head.hidden_units and head.dropout must have the same length");
        }
        if self.head.hidden_units.iter().any(|&u| u == 0) {
            return fail("head.hidden_units entries must be positive");
        }
        if self.head.dropout.iter().any(|d| !(0.0..1.0).contains(d)) {
            return fail("head.dropout entries must be in [0, 1)");
        }

        self.augmentation
            .validate()
            .map_err(ClassifierError::Config)?;

        Ok(())
    }

    /// Feed settings derived from this configuration
    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            image_size: self.image_size,
            batch_size: self.batch_size,
            prefetch_batches: self.prefetch_batches,
            seed: self.seed,
            augmentation: self.augmentation.clone(),
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::Config(format!("cannot read config {:?}: {}", path, e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}
