//! Inference Predictor Module
//!
//! Loads an exported model directory (sidecar + portable weights) and
//! classifies thumbnails. A prediction only names a class when that class's
//! probability exceeds the configured threshold; otherwise it is uncertain.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use colored::Colorize;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::check_verdict_threshold;
use crate::dataset::augmentation::Augmenter;
use crate::dataset::loader::has_image_extension;
use crate::export::{read_weights, ClassInfo, PortableModel, CLASS_INFO_FILE, MODEL_FILE};
use crate::model::{apply_named_tensors, ModelBlueprint, ThumbnailClassifier};
use crate::utils::error::{ClassifierError, Result};

/// Outcome of thresholding a probability vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Class { index: usize, name: String },
    Uncertain,
}

impl Verdict {
    /// Class `i` if `p_i > threshold`, else uncertain
    pub fn from_probabilities(probabilities: &[f32], classes: &[String], threshold: f64) -> Self {
        probabilities
            .iter()
            .enumerate()
            .find(|(_, p)| f64::from(**p) > threshold)
            .map(|(index, _)| Verdict::Class {
                index,
                name: classes.get(index).cloned().unwrap_or_else(|| index.to_string()),
            })
            .unwrap_or(Verdict::Uncertain)
    }

    pub fn label(&self) -> &str {
        match self {
            Verdict::Class { name, .. } => name,
            Verdict::Uncertain => "uncertain",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub image_path: Option<PathBuf>,
    /// Probabilities in sidecar class order
    pub probabilities: Vec<f32>,
    pub verdict: Verdict,
    pub inference_time_ms: f64,
}

impl Prediction {
    /// Probability of the most likely class
    pub fn confidence(&self) -> f32 {
        self.probabilities.iter().copied().fold(0.0, f32::max)
    }
}

/// Predictions for every image of a directory
#[derive(Debug, Clone, Default)]
pub struct FolderSummary {
    pub predictions: Vec<Prediction>,
    pub skipped: Vec<PathBuf>,
}

impl FolderSummary {
    /// Number of predictions per verdict label
    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for prediction in &self.predictions {
            *counts.entry(prediction.verdict.label().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn print(&self) {
        println!("\n{}", "Prediction Summary".cyan().bold());
        println!("  Images predicted: {}", self.predictions.len());
        if !self.skipped.is_empty() {
            println!("  Unreadable skipped: {}", self.skipped.len().to_string().yellow());
        }
        for (label, count) in self.counts() {
            println!("    {:16} {:6}", label, count);
        }
    }
}

/// Classifier loaded from an export directory
pub struct Predictor<B: Backend> {
    model: ThumbnailClassifier<B>,
    classes: Vec<String>,
    augmenter: Augmenter,
    threshold: f64,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// Load `class_info.json`, `model.json` and `weights.bin` from `dir`
    pub fn load(dir: &Path, device: &B::Device) -> Result<Self> {
        let info = ClassInfo::load(&dir.join(CLASS_INFO_FILE))?;
        let portable = PortableModel::load(&dir.join(MODEL_FILE))?;

        if portable.num_classes != info.classes.len() {
            return Err(ClassifierError::Inference(format!(
                "model has {} outputs but sidecar lists {} classes",
                portable.num_classes,
                info.classes.len()
            )));
        }

        let tensors = read_weights(&dir.join(&portable.weights_file), &portable.weights)?;
        let model = ModelBlueprint::from_config(&info.config, info.classes.len()).init::<B>(device);
        let model = apply_named_tensors(model, &tensors, device)?;

        info!(
            "Loaded exported model from {:?}: {} classes, input {:?}",
            dir, info.classes.len(), info.input_shape
        );

        Ok(Self {
            model,
            classes: info.classes,
            augmenter: Augmenter::no_augmentation(info.input_shape[0] as u32),
            threshold: info.config.verdict_threshold,
            device: device.clone(),
        })
    }

    /// Override the verdict threshold stored in the sidecar; must lie in [0.5, 1)
    pub fn with_threshold(mut self, threshold: f64) -> Result<Self> {
        check_verdict_threshold(threshold)?;
        self.threshold = threshold;
        Ok(self)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Predict a decoded image
    pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction> {
        let start = Instant::now();
        let size = self.augmenter.image_size() as usize;
        let data = self.augmenter.preprocess(image, None);

        let input = Tensor::<B, 4>::from_floats(TensorData::new(data, [1, 3, size, size]), &self.device);
        let probabilities = self
            .model
            .forward_softmax(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("cannot read output: {:?}", e)))?;

        let verdict = Verdict::from_probabilities(&probabilities, &self.classes, self.threshold);
        Ok(Prediction {
            image_path: None,
            probabilities,
            verdict,
            inference_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Predict an image file
    pub fn predict_path(&self, path: &Path) -> Result<Prediction> {
        let image = image::open(path)
            .map_err(|e| ClassifierError::Image(path.to_path_buf(), e.to_string()))?;
        let mut prediction = self.predict_image(&image)?;
        prediction.image_path = Some(path.to_path_buf());
        Ok(prediction)
    }

    /// Predict every image under `dir`, skipping unreadable files
    pub fn predict_dir(&self, dir: &Path) -> Result<FolderSummary> {
        if !dir.is_dir() {
            return Err(ClassifierError::Inference(format!("{:?} is not a directory", dir)));
        }

        let mut paths: Vec<PathBuf> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| has_image_extension(p))
            .collect();
        paths.sort();

        let mut summary = FolderSummary::default();
        for path in paths {
            match self.predict_path(&path) {
                Ok(prediction) => summary.predictions.push(prediction),
                Err(e) => {
                    warn!("Skipping {:?}: {}", path, e);
                    summary.skipped.push(path);
                }
            }
        }
        Ok(summary)
    }
}
