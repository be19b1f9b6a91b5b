//! Callback Controller
//!
//! Independent observers look at each epoch's validation metrics and answer
//! with an [`Action`]. They never touch the model; the phase scheduler applies
//! the actions in a fixed order. A fresh controller is built for every phase,
//! so patience counters and best values never leak across the boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::phase::PhasePlan;

/// Per-epoch results of a training pass followed by a validation pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// What an observer asks the scheduler to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Continue,
    /// Snapshot the current model as the phase's best state
    RememberBest,
    /// Use `new_rate` from the next epoch on
    ReduceRate { new_rate: f64 },
    /// End the phase after this epoch
    StopPhase { restore_best: bool },
    /// Persist the current model to the best-checkpoint location
    Checkpoint,
}

impl Action {
    /// Position in which the scheduler applies actions of the same epoch
    pub fn order(&self) -> u8 {
        match self {
            Action::RememberBest => 0,
            Action::Checkpoint => 1,
            Action::ReduceRate { .. } => 2,
            Action::StopPhase { .. } => 3,
            Action::Continue => 4,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Continue => write!(f, "continue"),
            Action::RememberBest => write!(f, "remember_best"),
            Action::ReduceRate { new_rate } => write!(f, "reduce_lr({:.2e})", new_rate),
            Action::StopPhase { .. } => write!(f, "early_stop"),
            Action::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

/// Observer of per-epoch metrics
pub trait EpochObserver: Send {
    fn name(&self) -> &'static str;

    /// Called once per completed epoch with the rate that epoch used
    fn observe(&mut self, metrics: &EpochMetrics, learning_rate: f64) -> Action;
}

/// Direction in which a monitored metric improves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    /// Metric should decrease (e.g., loss)
    Min,
    /// Metric should increase (e.g., accuracy)
    Max,
}

/// Best value of a monitored metric, with an improvement margin
#[derive(Debug, Clone)]
struct MonitoredBest {
    best: f64,
    min_delta: f64,
    mode: PlateauMode,
}

impl MonitoredBest {
    fn new(mode: PlateauMode, min_delta: f64) -> Self {
        let best = match mode {
            PlateauMode::Min => f64::INFINITY,
            PlateauMode::Max => f64::NEG_INFINITY,
        };
        Self {
            best,
            min_delta,
            mode,
        }
    }

    /// Record `value` and report whether it improved on the best so far
    fn update(&mut self, value: f64) -> bool {
        let improved = match self.mode {
            PlateauMode::Min => value < self.best - self.min_delta,
            PlateauMode::Max => value > self.best + self.min_delta,
        };
        if improved {
            self.best = value;
        }
        improved
    }
}

/// Stops the phase after `patience` consecutive epochs without a strict
/// validation-accuracy improvement and asks for the best state back
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: MonitoredBest,
    patience: usize,
    wait: usize,
    epoch: usize,
    best_epoch: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            monitor: MonitoredBest::new(PlateauMode::Max, 0.0),
            patience,
            wait: 0,
            epoch: 0,
            best_epoch: 0,
        }
    }

    /// Phase-local epoch (1-based) holding the best validation accuracy
    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_accuracy(&self) -> f64 {
        self.monitor.best
    }
}

impl EpochObserver for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn observe(&mut self, metrics: &EpochMetrics, _learning_rate: f64) -> Action {
        self.epoch += 1;

        if self.monitor.update(metrics.val_accuracy) {
            self.wait = 0;
            self.best_epoch = self.epoch;
            return Action::RememberBest;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            Action::StopPhase { restore_best: true }
        } else {
            Action::Continue
        }
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without a
/// validation-loss decrease larger than `min_delta`, never going below `floor`
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    monitor: MonitoredBest,
    factor: f64,
    patience: usize,
    floor: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, floor: f64, min_delta: f64) -> Self {
        Self {
            monitor: MonitoredBest::new(PlateauMode::Min, min_delta),
            factor,
            patience,
            floor,
            wait: 0,
        }
    }
}

impl EpochObserver for ReduceLrOnPlateau {
    fn name(&self) -> &'static str {
        "reduce_lr_on_plateau"
    }

    fn observe(&mut self, metrics: &EpochMetrics, learning_rate: f64) -> Action {
        if self.monitor.update(metrics.val_loss) {
            self.wait = 0;
            return Action::Continue;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return Action::Continue;
        }

        let new_rate = (learning_rate * self.factor).max(self.floor);
        if new_rate < learning_rate {
            self.wait = 0;
            Action::ReduceRate { new_rate }
        } else {
            Action::Continue
        }
    }
}

/// Requests a durable checkpoint on every strict validation-accuracy improvement
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    monitor: MonitoredBest,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        Self {
            monitor: MonitoredBest::new(PlateauMode::Max, 0.0),
        }
    }
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochObserver for BestCheckpoint {
    fn name(&self) -> &'static str {
        "best_checkpoint"
    }

    fn observe(&mut self, metrics: &EpochMetrics, _learning_rate: f64) -> Action {
        if self.monitor.update(metrics.val_accuracy) {
            Action::Checkpoint
        } else {
            Action::Continue
        }
    }
}

/// The set of observers active during one phase
pub struct CallbackController {
    observers: Vec<Box<dyn EpochObserver>>,
}

impl CallbackController {
    pub fn new(observers: Vec<Box<dyn EpochObserver>>) -> Self {
        Self { observers }
    }

    /// Early stopping and LR reduction always; durable checkpoints when the plan asks
    pub fn for_phase(plan: &PhasePlan) -> Self {
        let mut observers: Vec<Box<dyn EpochObserver>> = vec![
            Box::new(EarlyStopping::new(plan.early_stop_patience)),
            Box::new(ReduceLrOnPlateau::new(
                plan.lr_reduce_factor,
                plan.lr_reduce_patience,
                plan.lr_floor,
                plan.lr_min_delta,
            )),
        ];
        if plan.checkpoint_best {
            observers.push(Box::new(BestCheckpoint::new()));
        }
        Self::new(observers)
    }

    pub fn observer_names(&self) -> Vec<&'static str> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    /// Run every observer and return the non-trivial actions in application order
    pub fn observe(&mut self, metrics: &EpochMetrics, learning_rate: f64) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .observers
            .iter_mut()
            .map(|o| o.observe(metrics, learning_rate))
            .filter(|a| *a != Action::Continue)
            .collect();
        actions.sort_by_key(|a| a.order());
        actions
    }
}
