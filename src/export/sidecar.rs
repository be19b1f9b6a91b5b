//! `class_info.json`: what a consumer needs to interpret the exported model

use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::utils::error::{ClassifierError, Result};

pub const CLASS_INFO_FILE: &str = "class_info.json";

/// Metadata sidecar written next to the portable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    /// Class names by output index
    pub classes: Vec<String>,
    /// Height, width, channels
    pub input_shape: [usize; 3],
    /// ISO-8601 creation time
    pub created: String,
    pub config: TrainingConfig,
}

impl ClassInfo {
    pub fn new(classes: &[String], config: &TrainingConfig) -> Self {
        Self {
            classes: classes.to_vec(),
            input_shape: [config.image_size, config.image_size, 3],
            created: Local::now().to_rfc3339(),
            config: config.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| ClassifierError::Export(format!("cannot write {:?}: {}", path, e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::Inference(format!("cannot read {:?}: {}", path, e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}
