//! Training run record
//!
//! One entry per completed epoch across both phases, so the two phases form a
//! single comparable time series. Saved as JSON next to the rendered chart.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::callbacks::EpochMetrics;
use super::phase::Phase;
use crate::utils::error::Result;

/// Metrics and actions of a single epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: Phase,
    /// 1-based epoch counter over the whole run
    pub global_epoch: usize,
    /// 1-based epoch counter within the phase
    pub phase_epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    /// Rate used for this epoch's optimization steps
    pub learning_rate: f64,
    /// Controller actions fired after this epoch
    pub events: Vec<String>,
}

impl EpochRecord {
    pub fn new(
        phase: Phase,
        global_epoch: usize,
        phase_epoch: usize,
        metrics: &EpochMetrics,
        learning_rate: f64,
    ) -> Self {
        Self {
            phase,
            global_epoch,
            phase_epoch,
            train_loss: metrics.train_loss,
            train_accuracy: metrics.train_accuracy,
            val_loss: metrics.val_loss,
            val_accuracy: metrics.val_accuracy,
            learning_rate,
            events: Vec::new(),
        }
    }
}

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// All configured epochs ran
    Exhausted,
    /// Early stopping fired
    EarlyStopped,
}

/// Summary of one completed phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    /// Phase-local epoch with the best validation accuracy
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub final_learning_rate: f64,
    /// Whether the model was rolled back to `best_epoch`
    pub restored_best: bool,
}

/// Complete history of a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub phases: Vec<PhaseOutcome>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut EpochRecord> {
        self.epochs.last_mut()
    }

    /// Records of a single phase
    pub fn phase_records(&self, phase: Phase) -> impl Iterator<Item = &EpochRecord> {
        self.epochs.iter().filter(move |r| r.phase == phase)
    }

    /// Global epoch after which phase 2 begins (`None` if it never started)
    pub fn phase_boundary(&self) -> Option<usize> {
        self.epochs
            .iter()
            .find(|r| r.phase == Phase::PartialUnfreeze)
            .map(|r| r.global_epoch - 1)
    }

    /// Record with the highest validation accuracy (earliest on ties)
    pub fn best(&self) -> Option<&EpochRecord> {
        self.epochs.iter().fold(None, |best: Option<&EpochRecord>, r| match best {
            Some(b) if b.val_accuracy >= r.val_accuracy => Some(b),
            _ => Some(r),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
