//! Phase listeners: structured logging and an epoch progress bar

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use super::history::StopReason;
use super::phase::{PhaseEvent, PhaseListener};

/// Logs every scheduler event through `tracing`
#[derive(Debug, Default)]
pub struct LoggingListener;

impl PhaseListener for LoggingListener {
    fn on_event(&mut self, event: &PhaseEvent<'_>) {
        match event {
            PhaseEvent::PhaseStarted { plan, trainable } => {
                info!(
                    "{}: up to {} epochs at lr {:.1e}, {}/{} backbone layers trainable, {} trainable / {} frozen parameters",
                    plan.phase,
                    plan.max_epochs,
                    plan.learning_rate,
                    trainable.trainable_backbone_layers,
                    trainable.backbone_layers,
                    trainable.trainable_params,
                    trainable.frozen_params
                );
            }
            PhaseEvent::EpochCompleted { plan, record } => {
                info!(
                    "Epoch {}/{} (global {}): loss={:.4}, acc={:.4}, val_loss={:.4}, val_acc={:.4}, lr={:.2e}",
                    record.phase_epoch,
                    plan.max_epochs,
                    record.global_epoch,
                    record.train_loss,
                    record.train_accuracy,
                    record.val_loss,
                    record.val_accuracy,
                    record.learning_rate
                );
            }
            PhaseEvent::LearningRateReduced { phase, from, to } => {
                info!("{}: reducing learning rate {:.2e} -> {:.2e}", phase, from, to);
            }
            PhaseEvent::CheckpointSaved {
                global_epoch,
                val_accuracy,
                ..
            } => {
                info!(
                    "New best validation accuracy {:.4} at epoch {}, checkpoint written",
                    val_accuracy, global_epoch
                );
            }
            PhaseEvent::EarlyStopped {
                phase,
                phase_epoch,
                best_epoch,
            } => {
                warn!(
                    "{}: early stop after epoch {}, restoring weights from epoch {}",
                    phase, phase_epoch, best_epoch
                );
            }
            PhaseEvent::PhaseFinished { outcome } => {
                let how = match outcome.stop_reason {
                    StopReason::Exhausted => "all epochs run",
                    StopReason::EarlyStopped => "stopped early",
                };
                info!(
                    "{} finished after {} epochs ({}), best val_acc {:.4} at epoch {}",
                    outcome.phase, outcome.epochs_run, how, outcome.best_val_accuracy, outcome.best_epoch
                );
            }
            PhaseEvent::RunFinished { history } => {
                if let Some(last) = history.last() {
                    info!(
                        "Training complete: final acc {:.4}, final val_acc {:.4}",
                        last.train_accuracy, last.val_accuracy
                    );
                }
            }
        }
    }
}

/// Epoch-level progress bar, one per phase
#[derive(Debug, Default)]
pub struct ProgressListener {
    bar: Option<ProgressBar>,
}

impl ProgressListener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhaseListener for ProgressListener {
    fn on_event(&mut self, event: &PhaseEvent<'_>) {
        match event {
            PhaseEvent::PhaseStarted { plan, .. } => {
                let bar = ProgressBar::new(plan.max_epochs as u64);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                bar.set_message(format!("Phase {}", plan.phase.number().unwrap_or(0)));
                self.bar = Some(bar);
            }
            PhaseEvent::EpochCompleted { record, .. } => {
                if let Some(bar) = &self.bar {
                    bar.set_position(record.phase_epoch as u64);
                }
            }
            PhaseEvent::PhaseFinished { .. } => {
                if let Some(bar) = self.bar.take() {
                    bar.finish();
                }
            }
            _ => {}
        }
    }
}
