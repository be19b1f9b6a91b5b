//! End-to-end training run
//!
//! Validates the configuration, discovers and splits the dataset, builds the
//! feed and the model, runs both phases, exports the final model and then
//! writes the run report. Precondition failures (dataset, pretrained weights)
//! surface before any epoch runs. A report that cannot be written only warns.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::{error, info, warn};

use crate::config::TrainingConfig;
use crate::dataset::{DataFeed, DatasetSplit, DatasetStats, ThumbnailDataset};
use crate::export::{export_model, ExportReport};
use crate::model::{assemble, record_file};
use crate::training::{
    load_checkpoint, BurnTrainer, CheckpointTarget, LoggingListener, PhaseScheduler,
    ProgressListener, TrainingHistory,
};
use crate::utils::charts::write_history_chart;
use crate::utils::error::Result;

/// Training partitions smaller than this produce a warning
pub const LOW_SAMPLE_WARNING: usize = 100;

pub const HISTORY_JSON: &str = "training_history.json";
pub const HISTORY_SVG: &str = "training_history.svg";

/// Presentation options that do not affect the trained model
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub show_progress: bool,
}

/// Everything a completed run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub classes: Vec<String>,
    pub dataset: DatasetStats,
    pub train_samples: usize,
    pub validation_samples: usize,
    pub history: TrainingHistory,
    /// `None` when the report could not be written
    pub history_json: Option<PathBuf>,
    pub history_svg: Option<PathBuf>,
    pub export: ExportReport,
    pub duration_secs: f64,
}

/// Run both phases and export the result
pub fn run_training<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
    options: RunOptions,
) -> Result<RunSummary> {
    let start = Instant::now();
    config.validate()?;

    let dataset = ThumbnailDataset::discover(&config.dataset_dir)?;
    let stats = dataset.stats();
    info!(
        "Dataset: {} usable images in {:?} ({} unreadable skipped)",
        stats.total_samples, dataset.classes, stats.unreadable
    );

    let split = DatasetSplit::partition(&dataset, config.validation_split, config.seed)?;
    info!(
        "Split: {} training / {} validation samples",
        split.train.len(),
        split.validation.len()
    );
    if split.train.len() < LOW_SAMPLE_WARNING {
        warn!(
            "Only {} training samples; at least {} are recommended for a useful model",
            split.train.len(),
            LOW_SAMPLE_WARNING
        );
    }

    let feed = DataFeed::new(&split, config.feed_config());
    let model = assemble::<B>(config, dataset.num_classes(), device)?;

    let target = CheckpointTarget {
        path: config.checkpoint_path.clone(),
        classes: dataset.classes.clone(),
        config: config.clone(),
    };
    let mut trainer = BurnTrainer::new(model, feed, device.clone())
        .with_checkpoint(target)
        .with_progress(options.show_progress);

    let mut scheduler = PhaseScheduler::new(config.clone()).with_listener(Box::new(LoggingListener));
    if options.show_progress {
        scheduler.add_listener(Box::new(ProgressListener::new()));
    }
    let history = scheduler.run(&mut trainer)?;
    if let Some(last) = history.last() {
        info!(
            "Final train accuracy: {:.2}%, validation accuracy: {:.2}%",
            last.train_accuracy * 100.0,
            last.val_accuracy * 100.0
        );
    }

    if trainer.feed().decode_failures() > 0 {
        warn!(
            "{} samples failed to decode during training and were skipped",
            trainer.feed().decode_failures()
        );
    }

    let model = trainer.into_model();
    let export = export_model(&model, &dataset.classes, config, &config.export_dir).map_err(|e| {
        error!(
            "Export failed; the best checkpoint {:?} is still available for `export --checkpoint`",
            record_file(&config.checkpoint_path)
        );
        e
    })?;

    let (history_json, history_svg) = write_reports(&history, &config.report_dir);

    Ok(RunSummary {
        classes: dataset.classes,
        dataset: stats,
        train_samples: split.train.len(),
        validation_samples: split.validation.len(),
        history,
        history_json,
        history_svg,
        export,
        duration_secs: start.elapsed().as_secs_f64(),
    })
}

/// Write the history JSON and chart, warning instead of failing the run
fn write_reports(history: &TrainingHistory, report_dir: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
    let json = report_dir.join(HISTORY_JSON);
    let json = match history.save(&json) {
        Ok(()) => Some(json),
        Err(e) => {
            warn!("Could not write training history {:?}: {}", json, e);
            None
        }
    };

    let svg = report_dir.join(HISTORY_SVG);
    let svg = match write_history_chart(history, &svg) {
        Ok(()) => Some(svg),
        Err(e) => {
            warn!("Could not write training chart {:?}: {}", svg, e);
            None
        }
    };

    if json.is_some() || svg.is_some() {
        info!("Training history written to {:?}", report_dir);
    }
    (json, svg)
}

/// Re-export a saved best checkpoint into `output_dir`
pub fn export_checkpoint<B: Backend>(
    checkpoint: &Path,
    output_dir: &Path,
    device: &B::Device,
) -> Result<ExportReport> {
    let (model, metadata) = load_checkpoint::<B>(checkpoint, device)?;
    export_model(&model, &metadata.classes, &metadata.config, output_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::write_dataset;
    use crate::export::{ClassInfo, CLASS_INFO_FILE, MODEL_FILE, WEIGHTS_FILE};
    use crate::model::{save_backbone, Backbone, ModelBlueprint};
    use crate::training::Phase;
    use crate::utils::error::ClassifierError;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn tiny_config(root: &Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.dataset_dir = root.join("dataset");
        config.export_dir = root.join("web_model");
        config.checkpoint_path = root.join("best_model");
        config.report_dir = root.join("reports");
        config.backbone_weights = root.join("weights").join("backbone.mpk");
        config.image_size = 32;
        config.batch_size = 4;
        config.epochs_phase1 = 2;
        config.epochs_phase2 = 1;
        config.unfreeze_layer_count = 4;
        config.backbone.width_multiplier = 0.25;
        config.backbone.last_channels = 32;
        config.head.hidden_units = vec![8];
        config.head.dropout = vec![0.2];
        config
    }

    fn write_pretrained(config: &TrainingConfig) {
        let blueprint = ModelBlueprint::from_config(config, 2);
        let backbone = Backbone::<NdArray>::new(&blueprint.backbone_config(), &Default::default());
        save_backbone(&backbone, &config.backbone_weights).unwrap();
    }

    #[test]
    fn test_full_run_exports_two_class_model() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        write_dataset(
            &config.dataset_dir,
            &[("ai_generated", 8), ("human_created", 7)],
            40,
        );
        write_pretrained(&config);

        let summary =
            run_training::<TestBackend>(&config, &Default::default(), RunOptions::default())
                .unwrap();

        assert_eq!(summary.classes, vec!["ai_generated", "human_created"]);
        assert_eq!(summary.train_samples + summary.validation_samples, 15);
        assert_eq!(summary.history.phase_records(Phase::PartialUnfreeze).count(), 1);
        assert_eq!(summary.history.phases.len(), 2);
        assert!(summary.history_json.as_deref().is_some_and(Path::is_file));
        assert!(summary.history_svg.as_deref().is_some_and(Path::is_file));

        for name in [MODEL_FILE, WEIGHTS_FILE, CLASS_INFO_FILE] {
            assert!(config.export_dir.join(name).is_file());
        }
        let info = ClassInfo::load(&config.export_dir.join(CLASS_INFO_FILE)).unwrap();
        assert_eq!(info.classes.len(), 2);
        assert_eq!(info.input_shape, [32, 32, 3]);

        // Phase 2 always checkpoints its first epoch, so recovery works.
        let recovered = dir.path().join("recovered");
        let report =
            export_checkpoint::<NdArray>(&config.checkpoint_path, &recovered, &Default::default())
                .unwrap();
        assert_eq!(report.files.len(), 3);
    }

    #[test]
    fn test_unwritable_report_dir_still_exports() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.epochs_phase1 = 1;
        config.report_dir = dir.path().join("reports_is_a_file");
        std::fs::write(&config.report_dir, b"x").unwrap();
        write_dataset(
            &config.dataset_dir,
            &[("ai_generated", 6), ("human_created", 6)],
            40,
        );
        write_pretrained(&config);

        let summary =
            run_training::<TestBackend>(&config, &Default::default(), RunOptions::default())
                .unwrap();

        assert!(summary.history_json.is_none());
        assert!(summary.history_svg.is_none());
        assert_eq!(summary.export.files.len(), 3);
        let info = ClassInfo::load(&config.export_dir.join(CLASS_INFO_FILE)).unwrap();
        assert_eq!(info.classes, summary.classes);
    }

    #[test]
    fn test_missing_dataset_fails_before_weights() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());

        let err = run_training::<TestBackend>(&config, &Default::default(), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Dataset(_)));
    }

    #[test]
    fn test_missing_weights_fails_before_training() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config(dir.path());
        write_dataset(&config.dataset_dir, &[("ai_generated", 3), ("human_created", 3)], 20);

        let err = run_training::<TestBackend>(&config, &Default::default(), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::WeightsUnavailable { .. }));
        assert!(!config.report_dir.join(HISTORY_JSON).exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = tiny_config(dir.path());
        config.learning_rate_phase2 = config.learning_rate_phase1;

        let err = run_training::<TestBackend>(&config, &Default::default(), RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Config(_)));
    }
}
