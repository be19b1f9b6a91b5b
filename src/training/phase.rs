//! Phase Scheduler
//!
//! Two-phase fine-tuning as an explicit state machine:
//!
//! ```text
//! FrozenBackbone ──▶ PartialUnfreeze ──▶ Done
//! ```
//!
//! Each training state owns a [`PhasePlan`] (epoch budget, learning rate,
//! controller settings, trainable layers). The scheduler drives an
//! [`EpochRunner`] through the plan, applies the controller's actions and
//! reports boundaries to registered [`PhaseListener`]s. The transition to
//! phase 2 is unconditional: it happens whether phase 1 ran out of epochs or
//! stopped early.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::callbacks::{Action, CallbackController, EpochMetrics};
use super::history::{EpochRecord, PhaseOutcome, StopReason, TrainingHistory};
use crate::config::TrainingConfig;
use crate::model::TrainableSummary;
use crate::utils::error::Result;

/// State of the two-phase run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Head only, backbone fully frozen
    FrozenBackbone,
    /// Head plus the last layers of the backbone
    PartialUnfreeze,
    Done,
}

impl Phase {
    /// Transition function
    pub fn next(self) -> Self {
        match self {
            Phase::FrozenBackbone => Phase::PartialUnfreeze,
            Phase::PartialUnfreeze | Phase::Done => Phase::Done,
        }
    }

    /// 1 or 2 for the training phases
    pub fn number(self) -> Option<usize> {
        match self {
            Phase::FrozenBackbone => Some(1),
            Phase::PartialUnfreeze => Some(2),
            Phase::Done => None,
        }
    }

    pub fn is_done(self) -> bool {
        self == Phase::Done
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::FrozenBackbone => write!(f, "Phase 1 (frozen backbone)"),
            Phase::PartialUnfreeze => write!(f, "Phase 2 (partial unfreeze)"),
            Phase::Done => write!(f, "Done"),
        }
    }
}

/// Everything a training phase needs to know
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub phase: Phase,
    pub max_epochs: usize,
    pub learning_rate: f64,
    /// `None` keeps the backbone frozen, `Some(k)` trains its last `k` layers
    pub unfreeze_layer_count: Option<usize>,
    pub early_stop_patience: usize,
    pub lr_reduce_patience: usize,
    pub lr_reduce_factor: f64,
    pub lr_floor: f64,
    pub lr_min_delta: f64,
    /// Persist every strict validation-accuracy improvement
    pub checkpoint_best: bool,
}

impl PhasePlan {
    /// Plan for `phase`, or `None` once the run is done
    pub fn for_phase(phase: Phase, config: &TrainingConfig) -> Option<Self> {
        match phase {
            Phase::FrozenBackbone => Some(Self {
                phase,
                max_epochs: config.epochs_phase1,
                learning_rate: config.learning_rate_phase1,
                unfreeze_layer_count: None,
                early_stop_patience: config.early_stop_patience,
                lr_reduce_patience: config.lr_reduce_patience_phase1,
                lr_reduce_factor: config.lr_reduce_factor,
                lr_floor: config.lr_floor_phase1,
                lr_min_delta: config.lr_min_delta,
                checkpoint_best: false,
            }),
            Phase::PartialUnfreeze => Some(Self {
                phase,
                max_epochs: config.epochs_phase2,
                learning_rate: config.learning_rate_phase2,
                unfreeze_layer_count: Some(config.unfreeze_layer_count),
                early_stop_patience: config.early_stop_patience,
                lr_reduce_patience: config.lr_reduce_patience_phase2,
                lr_reduce_factor: config.lr_reduce_factor,
                lr_floor: config.lr_floor_phase2,
                lr_min_delta: config.lr_min_delta,
                checkpoint_best: true,
            }),
            Phase::Done => None,
        }
    }
}

/// Boundary and progress notifications
#[derive(Debug)]
pub enum PhaseEvent<'a> {
    PhaseStarted {
        plan: &'a PhasePlan,
        trainable: TrainableSummary,
    },
    EpochCompleted {
        plan: &'a PhasePlan,
        record: &'a EpochRecord,
    },
    LearningRateReduced {
        phase: Phase,
        from: f64,
        to: f64,
    },
    CheckpointSaved {
        phase: Phase,
        global_epoch: usize,
        val_accuracy: f64,
    },
    EarlyStopped {
        phase: Phase,
        phase_epoch: usize,
        best_epoch: usize,
    },
    PhaseFinished {
        outcome: &'a PhaseOutcome,
    },
    RunFinished {
        history: &'a TrainingHistory,
    },
}

/// Receives scheduler events (logging, progress display)
pub trait PhaseListener {
    fn on_event(&mut self, event: &PhaseEvent<'_>);
}

/// The seam between the scheduler and whatever actually trains the model
pub trait EpochRunner {
    /// Apply the plan's trainable subset and start a fresh optimizer
    fn prepare_phase(&mut self, plan: &PhasePlan) -> Result<TrainableSummary>;

    /// One full training pass followed by one full validation pass
    fn run_epoch(&mut self, learning_rate: f64) -> Result<EpochMetrics>;

    /// Snapshot the current model state as the phase's best
    fn remember_best(&mut self);

    /// Roll back to the last snapshot; `false` if there is none
    fn restore_best(&mut self) -> bool;

    /// Persist the current model state durably
    fn save_checkpoint(&mut self, record: &EpochRecord) -> Result<()>;
}

/// Drives an [`EpochRunner`] through both phases
pub struct PhaseScheduler {
    config: TrainingConfig,
    state: Phase,
    listeners: Vec<Box<dyn PhaseListener>>,
}

impl PhaseScheduler {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            state: Phase::FrozenBackbone,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn PhaseListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Box<dyn PhaseListener>) {
        self.listeners.push(listener);
    }

    pub fn state(&self) -> Phase {
        self.state
    }

    fn emit(&mut self, event: PhaseEvent<'_>) {
        for listener in self.listeners.iter_mut() {
            listener.on_event(&event);
        }
    }

    /// Run every remaining phase and return the combined history
    pub fn run<R: EpochRunner + ?Sized>(&mut self, runner: &mut R) -> Result<TrainingHistory> {
        let mut history = TrainingHistory::new();

        while let Some(plan) = PhasePlan::for_phase(self.state, &self.config) {
            let outcome = self.run_phase(&plan, runner, &mut history)?;
            self.emit(PhaseEvent::PhaseFinished { outcome: &outcome });
            history.phases.push(outcome);

            self.state = self.state.next();
            debug!("Scheduler state -> {}", self.state);
        }

        self.emit(PhaseEvent::RunFinished { history: &history });
        Ok(history)
    }

    fn run_phase<R: EpochRunner + ?Sized>(
        &mut self,
        plan: &PhasePlan,
        runner: &mut R,
        history: &mut TrainingHistory,
    ) -> Result<PhaseOutcome> {
        let trainable = runner.prepare_phase(plan)?;
        self.emit(PhaseEvent::PhaseStarted { plan, trainable });

        let mut controller = CallbackController::for_phase(plan);
        let mut learning_rate = plan.learning_rate;
        let mut best_epoch = 0;
        let mut best_val_accuracy = 0.0;
        let mut epochs_run = 0;
        let mut stop_reason = StopReason::Exhausted;
        let mut restored_best = false;

        for phase_epoch in 1..=plan.max_epochs {
            let metrics = runner.run_epoch(learning_rate)?;
            epochs_run = phase_epoch;

            let mut record = EpochRecord::new(
                plan.phase,
                history.len() + 1,
                phase_epoch,
                &metrics,
                learning_rate,
            );

            let actions = controller.observe(&metrics, learning_rate);
            record.events = actions.iter().map(|a| a.to_string()).collect();

            let mut stop = None;
            for action in actions {
                match action {
                    Action::RememberBest => {
                        runner.remember_best();
                        best_epoch = phase_epoch;
                        best_val_accuracy = metrics.val_accuracy;
                    }
                    Action::Checkpoint => {
                        runner.save_checkpoint(&record)?;
                        self.emit(PhaseEvent::CheckpointSaved {
                            phase: plan.phase,
                            global_epoch: record.global_epoch,
                            val_accuracy: metrics.val_accuracy,
                        });
                    }
                    Action::ReduceRate { new_rate } => {
                        self.emit(PhaseEvent::LearningRateReduced {
                            phase: plan.phase,
                            from: learning_rate,
                            to: new_rate,
                        });
                        learning_rate = new_rate;
                    }
                    Action::StopPhase { restore_best } => stop = Some(restore_best),
                    Action::Continue => {}
                }
            }

            history.push(record);
            if let Some(record) = history.last() {
                self.emit(PhaseEvent::EpochCompleted { plan, record });
            }

            if let Some(restore_best) = stop {
                if restore_best {
                    restored_best = runner.restore_best();
                }
                stop_reason = StopReason::EarlyStopped;
                self.emit(PhaseEvent::EarlyStopped {
                    phase: plan.phase,
                    phase_epoch,
                    best_epoch,
                });
                break;
            }
        }

        Ok(PhaseOutcome {
            phase: plan.phase,
            epochs_run,
            stop_reason,
            best_epoch,
            best_val_accuracy,
            final_learning_rate: learning_rate,
            restored_best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Replays fixed metric streams; the "model state" is the global epoch
    /// that produced it, so restores are easy to check.
    #[derive(Default)]
    struct ScriptedRunner {
        scripts: Vec<VecDeque<EpochMetrics>>,
        current: VecDeque<EpochMetrics>,
        prepared: Vec<PhasePlan>,
        rates: Vec<(Phase, f64)>,
        checkpoints: Vec<usize>,
        state: usize,
        best_state: Option<usize>,
        phase: Option<Phase>,
    }

    impl ScriptedRunner {
        fn new(phase1: Vec<(f64, f64)>, phase2: Vec<(f64, f64)>) -> Self {
            let to_metrics = |s: Vec<(f64, f64)>| {
                s.into_iter()
                    .map(|(val_loss, val_accuracy)| EpochMetrics {
                        train_loss: val_loss,
                        train_accuracy: val_accuracy,
                        val_loss,
                        val_accuracy,
                    })
                    .collect()
            };
            Self {
                scripts: vec![to_metrics(phase1), to_metrics(phase2)],
                ..Default::default()
            }
        }
    }

    impl EpochRunner for ScriptedRunner {
        fn prepare_phase(&mut self, plan: &PhasePlan) -> Result<TrainableSummary> {
            self.prepared.push(plan.clone());
            self.phase = Some(plan.phase);
            self.current = self.scripts.remove(0);
            self.best_state = None;
            Ok(TrainableSummary {
                backbone_layers: 52,
                trainable_backbone_layers: plan.unfreeze_layer_count.unwrap_or(0),
                trainable_params: 0,
                frozen_params: 0,
            })
        }

        fn run_epoch(&mut self, learning_rate: f64) -> Result<EpochMetrics> {
            self.state += 1;
            self.rates.push((self.phase.unwrap(), learning_rate));
            let metrics = self.current.pop_front().unwrap();
            if self.current.is_empty() {
                self.current.push_back(metrics);
            }
            Ok(metrics)
        }

        fn remember_best(&mut self) {
            self.best_state = Some(self.state);
        }

        fn restore_best(&mut self) -> bool {
            match self.best_state {
                Some(state) => {
                    self.state = state;
                    true
                }
                None => false,
            }
        }

        fn save_checkpoint(&mut self, record: &EpochRecord) -> Result<()> {
            self.checkpoints.push(record.global_epoch);
            Ok(())
        }
    }

    struct Recorder(Rc<RefCell<Vec<String>>>);

    impl PhaseListener for Recorder {
        fn on_event(&mut self, event: &PhaseEvent<'_>) {
            let name = match event {
                PhaseEvent::PhaseStarted { plan, .. } => format!("start:{:?}", plan.phase),
                PhaseEvent::EpochCompleted { .. } => "epoch".to_string(),
                PhaseEvent::LearningRateReduced { .. } => "lr".to_string(),
                PhaseEvent::CheckpointSaved { .. } => "checkpoint".to_string(),
                PhaseEvent::EarlyStopped { .. } => "early_stop".to_string(),
                PhaseEvent::PhaseFinished { outcome } => format!("finish:{:?}", outcome.phase),
                PhaseEvent::RunFinished { .. } => "done".to_string(),
            };
            self.0.borrow_mut().push(name);
        }
    }

    fn config(epochs_phase1: usize, epochs_phase2: usize) -> TrainingConfig {
        TrainingConfig {
            epochs_phase1,
            epochs_phase2,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_transition_function() {
        assert_eq!(Phase::FrozenBackbone.next(), Phase::PartialUnfreeze);
        assert_eq!(Phase::PartialUnfreeze.next(), Phase::Done);
        assert_eq!(Phase::Done.next(), Phase::Done);
        assert!(PhasePlan::for_phase(Phase::Done, &TrainingConfig::default()).is_none());
    }

    #[test]
    fn test_early_stop_at_patience_restores_best() {
        // Best at phase epoch 2, then five flat epochs with patience 5.
        let mut phase1 = vec![(1.0, 0.5), (0.9, 0.8)];
        phase1.extend(std::iter::repeat((0.9, 0.7)).take(10));
        let mut runner = ScriptedRunner::new(phase1, vec![(0.5, 0.9)]);
        let mut scheduler = PhaseScheduler::new(config(20, 1));

        let history = scheduler.run(&mut runner).unwrap();

        let outcome = &history.phases[0];
        assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
        assert_eq!(outcome.epochs_run, 7);
        assert_eq!(outcome.best_epoch, 2);
        assert!(outcome.restored_best);
        assert_eq!(history.phase_records(Phase::FrozenBackbone).count(), 7);
        assert_eq!(history.epochs[6].events, vec!["early_stop".to_string()]);

        // Phase 2 starts from the restored state (epoch 2), then runs one epoch.
        assert_eq!(runner.state, 3);
        assert_eq!(scheduler.state(), Phase::Done);
    }

    #[test]
    fn test_lr_reduction_is_floored() {
        let phase1: Vec<(f64, f64)> = (0..8).map(|i| (1.0, 0.5 + 0.01 * i as f64)).collect();
        let mut runner = ScriptedRunner::new(phase1, vec![(0.5, 0.9)]);
        let mut cfg = config(8, 1);
        cfg.lr_floor_phase1 = 4e-4;
        let mut scheduler = PhaseScheduler::new(cfg);

        let history = scheduler.run(&mut runner).unwrap();

        let rates: Vec<f64> = history
            .phase_records(Phase::FrozenBackbone)
            .map(|r| r.learning_rate)
            .collect();
        assert_eq!(rates, vec![1e-3, 1e-3, 1e-3, 1e-3, 5e-4, 5e-4, 5e-4, 4e-4]);
        assert_eq!(history.phases[0].stop_reason, StopReason::Exhausted);
        assert_eq!(history.phases[0].final_learning_rate, 4e-4);
    }

    #[test]
    fn test_phase_two_unfreezes_and_checkpoints() {
        let phase2 = vec![(0.5, 0.8), (0.4, 0.85), (0.45, 0.85), (0.3, 0.9)];
        let mut runner = ScriptedRunner::new(vec![(1.0, 0.6)], phase2);
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut scheduler = PhaseScheduler::new(config(2, 4))
            .with_listener(Box::new(Recorder(Rc::clone(&events))));

        let history = scheduler.run(&mut runner).unwrap();

        assert_eq!(runner.prepared.len(), 2);
        assert_eq!(runner.prepared[0].unfreeze_layer_count, None);
        assert_eq!(runner.prepared[1].unfreeze_layer_count, Some(30));
        assert_eq!(runner.rates[2], (Phase::PartialUnfreeze, 1e-4));

        // Phase 1 never checkpoints; phase 2 on epochs 3, 4 and 6.
        assert_eq!(runner.checkpoints, vec![3, 4, 6]);
        assert_eq!(history.phase_boundary(), Some(2));
        assert_eq!(history.len(), 6);

        let events = events.borrow();
        assert_eq!(events.first().unwrap(), "start:FrozenBackbone");
        assert!(events.contains(&"start:PartialUnfreeze".to_string()));
        assert_eq!(events.iter().filter(|e| *e == "checkpoint").count(), 3);
        assert_eq!(events.last().unwrap(), "done");
    }

    #[test]
    fn test_patience_counters_are_phase_local() {
        // Phase 1 ends flat with three stalled epochs; phase 2 must not inherit them.
        let phase1 = vec![(1.0, 0.8), (1.0, 0.7), (1.0, 0.7), (1.0, 0.7)];
        let phase2 = vec![(1.0, 0.6), (1.0, 0.6), (1.0, 0.6)];
        let mut runner = ScriptedRunner::new(phase1, phase2);
        let mut scheduler = PhaseScheduler::new(config(4, 3));

        let history = scheduler.run(&mut runner).unwrap();

        assert_eq!(history.phases[1].epochs_run, 3);
        assert_eq!(history.phases[1].stop_reason, StopReason::Exhausted);
        assert_eq!(history.phases[1].best_epoch, 1);
    }
}
