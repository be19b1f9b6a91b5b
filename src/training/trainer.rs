//! Burn epoch runner
//!
//! Custom training loop over the data feed: one training pass with
//! cross-entropy and Adam, then one validation pass on the inner (non-autodiff)
//! backend. Only the head and the backbone layers at or after the
//! classifier's `trainable_from` index receive optimizer steps; frozen layers
//! keep their weights and batch-norm statistics untouched.

use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use super::callbacks::EpochMetrics;
use super::checkpoint::{save_checkpoint, CheckpointMetadata};
use super::history::EpochRecord;
use super::phase::{EpochRunner, PhasePlan};
use crate::config::TrainingConfig;
use crate::dataset::{BatchStream, DataFeed, ThumbnailBatcher};
use crate::model::{ClassifierHead, ConvBnAct, ThumbnailClassifier, TrainableSummary};
use crate::utils::error::{ClassifierError, Result};

/// Where phase-2 improvements are persisted
#[derive(Debug, Clone)]
pub struct CheckpointTarget {
    pub path: PathBuf,
    pub classes: Vec<String>,
    pub config: TrainingConfig,
}

fn adam<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerAdaptor<Adam, M, B> {
    AdamConfig::new().with_epsilon(1e-7).init()
}

/// Number of rows whose argmax matches the target
fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = output.dims();
    let predictions = output.argmax(1).reshape([batch_size]);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Running sums for one pass
#[derive(Debug, Default)]
struct PassTotals {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl PassTotals {
    fn add(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    fn finish(self, pass: &str) -> Result<(f64, f64)> {
        if self.seen == 0 {
            return Err(ClassifierError::Dataset(format!(
                "{} pass yielded no decodable samples",
                pass
            )));
        }
        let n = self.seen as f64;
        Ok((self.loss_sum / n, self.correct as f64 / n))
    }
}

/// Trains a [`ThumbnailClassifier`] epoch by epoch for the phase scheduler
pub struct BurnTrainer<B: AutodiffBackend> {
    model: ThumbnailClassifier<B>,
    feed: DataFeed,
    batcher: ThumbnailBatcher<B>,
    valid_batcher: ThumbnailBatcher<B::InnerBackend>,
    device: B::Device,
    head_optimizer: OptimizerAdaptor<Adam, ClassifierHead<B>, B>,
    layer_optimizer: OptimizerAdaptor<Adam, ConvBnAct<B>, B>,
    best: Option<<ThumbnailClassifier<B> as Module<B>>::Record>,
    checkpoint: Option<CheckpointTarget>,
    show_progress: bool,
}

impl<B: AutodiffBackend> BurnTrainer<B> {
    pub fn new(model: ThumbnailClassifier<B>, feed: DataFeed, device: B::Device) -> Self {
        let image_size = feed.image_size();
        Self {
            model,
            feed,
            batcher: ThumbnailBatcher::new(image_size),
            valid_batcher: ThumbnailBatcher::new(image_size),
            device,
            head_optimizer: adam(),
            layer_optimizer: adam(),
            best: None,
            checkpoint: None,
            show_progress: false,
        }
    }

    pub fn with_checkpoint(mut self, target: CheckpointTarget) -> Self {
        self.checkpoint = Some(target);
        self
    }

    /// Show a per-batch progress bar on stderr
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn model(&self) -> &ThumbnailClassifier<B> {
        &self.model
    }

    pub fn feed(&self) -> &DataFeed {
        &self.feed
    }

    pub fn into_model(self) -> ThumbnailClassifier<B> {
        self.model
    }

    fn progress_bar(&self, stream: &BatchStream, pass: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(stream.num_batches() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {msg:>10} [{bar:30.cyan/blue}] {pos}/{len} batches ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_message(pass.to_string());
        bar
    }

    /// Step the head and every trainable backbone layer from one backward pass
    fn optimize(&mut self, loss: Tensor<B, 1>, learning_rate: f64) {
        let mut grads = loss.backward();
        let trainable_from = self.model.trainable_from();

        let head_grads = GradientsParams::from_module(&mut grads, &self.model.head);
        self.model.head = self
            .head_optimizer
            .step(learning_rate, self.model.head.clone(), head_grads);

        for (index, layer) in self.model.backbone.layers_mut().into_iter().enumerate() {
            if index < trainable_from {
                continue;
            }
            let layer_grads = GradientsParams::from_module(&mut grads, &*layer);
            *layer = self
                .layer_optimizer
                .step(learning_rate, layer.clone(), layer_grads);
        }
    }

    fn train_pass(&mut self, learning_rate: f64) -> Result<(f64, f64)> {
        let stream = self.feed.train_epoch();
        let bar = self.progress_bar(&stream, "train");
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut totals = PassTotals::default();

        for loaded in stream {
            bar.inc(1);
            if loaded.items.is_empty() {
                continue;
            }
            let batch_size = loaded.items.len();
            let batch = self.batcher.batch(loaded.items, &self.device);

            let output = self.model.forward(batch.images);
            let loss = loss_fn.forward(output.clone(), batch.targets.clone());
            let batch_loss: f64 = loss.clone().into_scalar().elem();
            let correct = count_correct(output.detach(), batch.targets);

            totals.add(batch_loss, correct, batch_size);
            self.optimize(loss, learning_rate);
        }

        bar.finish_and_clear();
        totals.finish("training")
    }

    fn validation_pass(&self) -> Result<(f64, f64)> {
        let model = self.model.valid();
        let device = model.devices().into_iter().next().unwrap_or_default();
        let stream = self.feed.validation_epoch();
        let bar = self.progress_bar(&stream, "validate");
        let loss_fn = CrossEntropyLossConfig::new().init(&device);
        let mut totals = PassTotals::default();

        for loaded in stream {
            bar.inc(1);
            if loaded.items.is_empty() {
                continue;
            }
            let batch_size = loaded.items.len();
            let batch = self.valid_batcher.batch(loaded.items, &device);

            let output = model.forward(batch.images);
            let loss = loss_fn.forward(output.clone(), batch.targets.clone());
            let batch_loss: f64 = loss.into_scalar().elem();
            let correct = count_correct(output, batch.targets);

            totals.add(batch_loss, correct, batch_size);
        }

        bar.finish_and_clear();
        totals.finish("validation")
    }
}

impl<B: AutodiffBackend> EpochRunner for BurnTrainer<B> {
    fn prepare_phase(&mut self, plan: &PhasePlan) -> Result<TrainableSummary> {
        match plan.unfreeze_layer_count {
            None => self.model.freeze_backbone(),
            Some(count) => self.model.freeze_all_but_last(count),
        }
        self.head_optimizer = adam();
        self.layer_optimizer = adam();
        self.best = None;

        Ok(self.model.trainable_summary())
    }

    fn run_epoch(&mut self, learning_rate: f64) -> Result<EpochMetrics> {
        let (train_loss, train_accuracy) = self.train_pass(learning_rate)?;
        let (val_loss, val_accuracy) = self.validation_pass()?;
        debug!(
            "epoch done: loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} decode_failures={}",
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
            self.feed.decode_failures()
        );

        Ok(EpochMetrics {
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
        })
    }

    fn remember_best(&mut self) {
        self.best = Some(self.model.clone().into_record());
    }

    fn restore_best(&mut self) -> bool {
        match self.best.take() {
            Some(record) => {
                self.model = self.model.clone().load_record(record);
                true
            }
            None => false,
        }
    }

    fn save_checkpoint(&mut self, record: &EpochRecord) -> Result<()> {
        let Some(target) = &self.checkpoint else {
            return Ok(());
        };
        let metadata = CheckpointMetadata::new(record, &target.classes, &target.config);
        save_checkpoint(&self.model, &target.path, &metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_dataset;
    use crate::dataset::{DatasetSplit, ThumbnailDataset};
    use crate::model::ModelBlueprint;
    use crate::training::phase::{Phase, PhaseScheduler};
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config(dir: &std::path::Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.dataset_dir = dir.join("dataset");
        config.checkpoint_path = dir.join("best_model");
        config.image_size = 32;
        config.batch_size = 4;
        config.prefetch_batches = 2;
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![8];
        config.head.dropout = vec![0.0];
        config
    }

    fn trainer(config: &TrainingConfig) -> BurnTrainer<TestBackend> {
        write_dataset(
            &config.dataset_dir,
            &[("ai_generated", 6), ("human_created", 6)],
            40,
        );
        let dataset = ThumbnailDataset::discover(&config.dataset_dir).unwrap();
        let split = DatasetSplit::partition(&dataset, config.validation_split, config.seed).unwrap();
        let feed = DataFeed::new(&split, config.feed_config());

        let device = Default::default();
        let model = ModelBlueprint::from_config(config, 2).init::<TestBackend>(&device);
        BurnTrainer::new(model, feed, device)
    }

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_epoch_updates_only_trainable_layers() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = trainer(&config);

        let mut plan = PhasePlan::for_phase(Phase::PartialUnfreeze, &config).unwrap();
        plan.unfreeze_layer_count = Some(2);
        let summary = trainer.prepare_phase(&plan).unwrap();
        assert_eq!(summary.trainable_backbone_layers, 2);

        let frozen_before = trainer.model().backbone.stem.conv.weight.val();
        let frozen_mean_before = trainer.model().backbone.stem.bn.running_mean.value();
        let trainable_before = trainer.model().backbone.last.conv.weight.val();
        let head_before = trainer.model().head.output.weight.val();

        let metrics = trainer.run_epoch(1e-2).unwrap();
        assert!(metrics.train_loss.is_finite() && metrics.val_loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.train_accuracy));
        assert!((0.0..=1.0).contains(&metrics.val_accuracy));

        let model = trainer.model();
        assert_eq!(
            max_abs_diff(frozen_before, model.backbone.stem.conv.weight.val()),
            0.0
        );
        let mean_diff: f32 = (frozen_mean_before - model.backbone.stem.bn.running_mean.value())
            .abs()
            .max()
            .into_scalar();
        assert_eq!(mean_diff, 0.0);
        assert!(max_abs_diff(trainable_before, model.backbone.last.conv.weight.val()) > 0.0);
        let head_diff: f32 = (head_before - model.head.output.weight.val())
            .abs()
            .max()
            .into_scalar();
        assert!(head_diff > 0.0);
    }

    #[test]
    fn test_restore_best_rolls_back_weights() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        let mut trainer = trainer(&config);
        let plan = PhasePlan::for_phase(Phase::FrozenBackbone, &config).unwrap();
        trainer.prepare_phase(&plan).unwrap();

        assert!(!trainer.restore_best());
        trainer.remember_best();
        let remembered = trainer.model().head.output.weight.val();

        trainer.run_epoch(1e-2).unwrap();
        assert!(trainer.restore_best());

        let diff: f32 = (remembered - trainer.model().head.output.weight.val())
            .abs()
            .max()
            .into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_scheduler_runs_both_phases_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.epochs_phase1 = 1;
        config.epochs_phase2 = 1;
        config.unfreeze_layer_count = 3;

        let target = CheckpointTarget {
            path: config.checkpoint_path.clone(),
            classes: vec!["ai_generated".to_string(), "human_created".to_string()],
            config: config.clone(),
        };
        let mut trainer = trainer(&config).with_checkpoint(target);
        let history = PhaseScheduler::new(config.clone()).run(&mut trainer).unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.phase_boundary(), Some(1));
        assert_eq!(trainer.model().trainable_from(), 52 - 3);
        // The first phase-2 epoch always improves on an empty best.
        assert!(config.checkpoint_path.with_extension("mpk").is_file());
        assert!(config.checkpoint_path.with_extension("json").is_file());
    }
}
