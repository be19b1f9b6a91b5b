//! Training module
//!
//! - `phase`: the two-phase state machine and the `EpochRunner` seam
//! - `callbacks`: early stopping, LR reduction and best-checkpoint observers
//! - `trainer`: the Burn implementation of `EpochRunner`
//! - `history`: per-epoch run record
//! - `checkpoint`: durable best-model persistence
//! - `listeners`: logging and progress display for phase events

pub mod callbacks;
pub mod checkpoint;
pub mod history;
pub mod listeners;
pub mod phase;
pub mod trainer;

pub use callbacks::{
    Action, BestCheckpoint, CallbackController, EarlyStopping, EpochMetrics, EpochObserver,
    PlateauMode, ReduceLrOnPlateau,
};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};
pub use history::{EpochRecord, PhaseOutcome, StopReason, TrainingHistory};
pub use listeners::{LoggingListener, ProgressListener};
pub use phase::{EpochRunner, Phase, PhaseEvent, PhaseListener, PhasePlan, PhaseScheduler};
pub use trainer::{BurnTrainer, CheckpointTarget};
