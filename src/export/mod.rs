//! Export Pipeline
//!
//! Turns the final model state into a deployment artifact:
//!
//! - `model.json`: topology and weight manifest
//! - `weights.bin`: raw little-endian f32 weights
//! - `class_info.json`: class names, input shape, timestamp and run config
//!
//! All three files are first written to a staging directory inside the target
//! and then moved into place, sidecar last. The old sidecar is removed before
//! the first move, so a `class_info.json` only ever sits next to the weights
//! of the export that wrote it.

pub mod portable;
pub mod sidecar;

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use tracing::info;

use crate::config::TrainingConfig;
use crate::model::{collect_named_tensors, NamedTensor, ThumbnailClassifier};
use crate::utils::error::{ClassifierError, Result};

pub use portable::{
    read_weights, topology, write_weights, ConvBnSpec, LayerSpec, PortableModel, WeightEntry,
    MODEL_FILE, WEIGHTS_FILE,
};
pub use sidecar::{ClassInfo, CLASS_INFO_FILE};

/// Files written by an export and their sizes
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub dir: PathBuf,
    pub files: Vec<(String, u64)>,
}

impl ExportReport {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, size)| size).sum()
    }

    pub fn total_mb(&self) -> f64 {
        self.total_bytes() as f64 / (1024.0 * 1024.0)
    }
}

/// Staging directory inside the export target
pub const STAGING_DIR: &str = ".partial";

fn export_error(action: &str, path: &Path, e: std::io::Error) -> ClassifierError {
    ClassifierError::Export(format!("cannot {} {:?}: {}", action, path, e))
}

fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ClassifierError::Export(format!("cannot stat {:?}: {}", path, e)))
}

fn write_artifact<B: Backend>(
    model: &ThumbnailClassifier<B>,
    tensors: &[NamedTensor],
    classes: &[String],
    config: &TrainingConfig,
    dir: &Path,
) -> Result<()> {
    let portable = PortableModel::describe(model, config.image_size, tensors);
    write_weights(&dir.join(WEIGHTS_FILE), tensors)?;

    let model_path = dir.join(MODEL_FILE);
    let json = serde_json::to_string_pretty(&portable)?;
    std::fs::write(&model_path, json).map_err(|e| export_error("write", &model_path, e))?;

    ClassInfo::new(classes, config).save(&dir.join(CLASS_INFO_FILE))
}

/// Export `model` with its class names into `dir`
pub fn export_model<B: Backend>(
    model: &ThumbnailClassifier<B>,
    classes: &[String],
    config: &TrainingConfig,
    dir: &Path,
) -> Result<ExportReport> {
    if classes.len() != model.num_classes() {
        return Err(ClassifierError::Export(format!(
            "{} class names for a model with {} outputs",
            classes.len(),
            model.num_classes()
        )));
    }

    let staging = dir.join(STAGING_DIR);
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| export_error("clear", &staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| export_error("create", &staging, e))?;

    let tensors = collect_named_tensors(model)?;
    let staged = write_artifact(model, &tensors, classes, config, &staging);
    if let Err(e) = staged {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let old_info = dir.join(CLASS_INFO_FILE);
    if old_info.exists() {
        std::fs::remove_file(&old_info).map_err(|e| export_error("remove", &old_info, e))?;
    }
    for name in [WEIGHTS_FILE, MODEL_FILE, CLASS_INFO_FILE] {
        let target = dir.join(name);
        std::fs::rename(staging.join(name), &target).map_err(|e| export_error("replace", &target, e))?;
    }
    std::fs::remove_dir_all(&staging).map_err(|e| export_error("remove", &staging, e))?;

    let mut files = Vec::with_capacity(3);
    for name in [MODEL_FILE, WEIGHTS_FILE, CLASS_INFO_FILE] {
        files.push((name.to_string(), file_size(&dir.join(name))?));
    }
    let report = ExportReport {
        dir: dir.to_path_buf(),
        files,
    };

    info!(
        "Exported {} tensors to {:?} ({:.2} MB)",
        tensors.len(),
        dir,
        report.total_mb()
    );
    Ok(report)
}
