//! Thumbnail Detector CLI
//!
//! Trains the AI-generated vs human-created thumbnail classifier, exports it
//! for the browser and runs predictions against an export.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use thumbnail_detector::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use thumbnail_detector::dataset::{AugmentationConfig, DatasetSplit, ThumbnailDataset};
use thumbnail_detector::inference::Predictor;
use thumbnail_detector::model::{import_pretrained, PretrainedSource, DEFAULT_HUB_FILE, DEFAULT_HUB_REPO};
use thumbnail_detector::pipeline::{export_checkpoint, run_training, RunOptions, RunSummary};
use thumbnail_detector::utils::logging::{init_logging, LogConfig, LogLevel};
use thumbnail_detector::utils::{format_bytes, format_duration, format_number};
use thumbnail_detector::{ClassifierError, ExportReport, TrainingConfig};

/// AI-generated vs human-created 3D thumbnail classifier
///
/// Two-phase transfer learning on a pretrained MobileNetV2-style backbone
/// using the Burn framework, with export to a portable web format.
#[derive(Parser, Debug)]
#[command(name = "thumbnail_detector")]
#[command(version)]
#[command(about = "Detect AI-generated 3D model thumbnails with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false", global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log level (error, warn, info, debug, trace); overrides -v/-q. RUST_LOG wins over both
    #[arg(long, global = true, value_parser = LogLevel::parse)]
    log_level: Option<LogLevel>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run both training phases and export the model
    Train(TrainArgs),

    /// Predict a single image or every image in a directory
    Predict {
        /// Image file or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Export directory (model.json, weights.bin, class_info.json)
        #[arg(short, long, default_value = "web_model")]
        model: PathBuf,

        /// Override the verdict threshold stored in the export
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Export a saved best checkpoint to the portable format
    Export {
        /// Checkpoint path (with or without the .mpk extension)
        #[arg(short, long, default_value = "best_model")]
        checkpoint: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "web_model")]
        output_dir: PathBuf,
    },

    /// Import ImageNet MobileNetV2 weights (timm safetensors) as the backbone record
    FetchWeights {
        /// Local safetensors file; downloads from the Hugging Face Hub when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        /// Hub repository
        #[arg(long, default_value = DEFAULT_HUB_REPO)]
        repo: String,

        /// File inside the hub repository
        #[arg(long, default_value = DEFAULT_HUB_FILE)]
        hub_file: String,

        /// JSON configuration whose backbone settings and weights path are used
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output record path (overrides the configured backbone_weights)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show dataset statistics and the train/validation split
    Stats {
        /// Path to the dataset directory
        #[arg(short, long, default_value = "dataset")]
        data_dir: PathBuf,

        /// Validation fraction used for the split preview
        #[arg(long, default_value = "0.2")]
        validation_split: f64,

        /// Random seed for the split preview
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Write the default configuration to a JSON file
    InitConfig {
        /// Output file
        #[arg(short, long, default_value = "training_config.json")]
        output: PathBuf,
    },
}

/// Training flags; each one overrides the matching field of `--config`
#[derive(Args, Debug)]
struct TrainArgs {
    /// JSON configuration file (see `init-config`)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the dataset directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Pretrained backbone record
    #[arg(long)]
    backbone_weights: Option<PathBuf>,

    /// Export directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Best checkpoint path
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Directory for the training history and chart
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Square input resolution
    #[arg(long)]
    image_size: Option<usize>,

    /// Batch size for training
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Fraction of images held out for validation
    #[arg(long)]
    validation_split: Option<f64>,

    /// Maximum epochs with the backbone frozen
    #[arg(long)]
    epochs_phase1: Option<usize>,

    /// Maximum fine-tuning epochs
    #[arg(long)]
    epochs_phase2: Option<usize>,

    /// Initial learning rate of phase 1
    #[arg(long)]
    lr_phase1: Option<f64>,

    /// Initial learning rate of phase 2
    #[arg(long)]
    lr_phase2: Option<f64>,

    /// Backbone layers unfrozen in phase 2
    #[arg(long)]
    unfreeze_layers: Option<usize>,

    /// Epochs without validation-accuracy improvement before stopping a phase
    #[arg(long)]
    early_stop_patience: Option<usize>,

    /// Verdict threshold written into the export
    #[arg(long)]
    threshold: Option<f64>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Disable data augmentation
    #[arg(long, default_value = "false")]
    no_augmentation: bool,

    /// Hide progress bars
    #[arg(long, default_value = "false")]
    no_progress: bool,
}

impl TrainArgs {
    fn resolve(&self) -> thumbnail_detector::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };

        if let Some(v) = &self.data_dir {
            config.dataset_dir = v.clone();
        }
        if let Some(v) = &self.backbone_weights {
            config.backbone_weights = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.export_dir = v.clone();
        }
        if let Some(v) = &self.checkpoint {
            config.checkpoint_path = v.clone();
        }
        if let Some(v) = &self.report_dir {
            config.report_dir = v.clone();
        }
        if let Some(v) = self.image_size {
            config.image_size = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.validation_split {
            config.validation_split = v;
        }
        if let Some(v) = self.epochs_phase1 {
            config.epochs_phase1 = v;
        }
        if let Some(v) = self.epochs_phase2 {
            config.epochs_phase2 = v;
        }
        if let Some(v) = self.lr_phase1 {
            config.learning_rate_phase1 = v;
        }
        if let Some(v) = self.lr_phase2 {
            config.learning_rate_phase2 = v;
        }
        if let Some(v) = self.unfreeze_layers {
            config.unfreeze_layer_count = v;
        }
        if let Some(v) = self.early_stop_patience {
            config.early_stop_patience = v;
        }
        if let Some(v) = self.threshold {
            config.verdict_threshold = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if self.no_augmentation {
            config.augmentation = AugmentationConfig::none();
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let _ = init_logging(&LogConfig::from_flags(cli.verbose, cli.quiet, cli.log_level));

    print_banner();

    let outcome = match cli.command {
        Commands::Train(args) => cmd_train(&args),
        Commands::Predict {
            input,
            model,
            threshold,
        } => cmd_predict(&input, &model, threshold),
        Commands::Export {
            checkpoint,
            output_dir,
        } => cmd_export(&checkpoint, &output_dir),
        Commands::FetchWeights {
            file,
            repo,
            hub_file,
            config,
            output,
        } => {
            let source = match file {
                Some(path) => PretrainedSource::File(path),
                None => PretrainedSource::Hub {
                    repo,
                    file: hub_file,
                },
            };
            cmd_fetch_weights(&source, config.as_deref(), output)
        }
        Commands::Stats {
            data_dir,
            validation_split,
            seed,
        } => cmd_stats(&data_dir, validation_split, seed),
        Commands::InitConfig { output } => cmd_init_config(&output),
    };

    if let Err(err) = outcome {
        eprintln!("\n{} {}", "Error:".red().bold(), err);
        if let Some(hint) = err.hint() {
            eprintln!("{} {}", "Hint:".yellow(), hint);
        }
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +------------------------------------------------------------+
 |   Thumbnail Detector                                       |
 |   AI-generated vs human-created 3D thumbnails (Burn + Rust) |
 +------------------------------------------------------------+
  "#
        .green()
    );
}

fn cmd_train(args: &TrainArgs) -> thumbnail_detector::Result<()> {
    let config = args.resolve()?;

    println!("{}", "Training configuration".cyan().bold());
    println!("  Backend:          {}", backend_name());
    println!("  Dataset:          {:?}", config.dataset_dir);
    println!("  Backbone weights: {:?}", config.backbone_weights);
    println!("  Image size:       {}", config.image_size);
    println!("  Batch size:       {}", config.batch_size);
    println!(
        "  Phase 1:          {} epochs @ lr {:.0e}",
        config.epochs_phase1, config.learning_rate_phase1
    );
    println!(
        "  Phase 2:          {} epochs @ lr {:.0e}, last {} layers unfrozen",
        config.epochs_phase2, config.learning_rate_phase2, config.unfreeze_layer_count
    );
    println!();

    let options = RunOptions {
        show_progress: !args.no_progress,
    };
    let summary = run_training::<TrainingBackend>(&config, &default_device(), options)?;
    print_run_summary(&summary);
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    println!("\n{}", "Training complete".green().bold());
    println!("  Classes:    {}", summary.classes.join(", "));
    println!(
        "  Samples:    {} training / {} validation",
        format_number(summary.train_samples),
        format_number(summary.validation_samples)
    );
    println!("  Epochs:     {}", summary.history.len());
    if let Some(best) = summary.history.best() {
        println!(
            "  Best epoch: {} ({}) with {:.2}% validation accuracy",
            best.global_epoch,
            best.phase,
            best.val_accuracy * 100.0
        );
    }
    println!("  Duration:   {}", format_duration(summary.duration_secs));
    match (&summary.history_json, &summary.history_svg) {
        (Some(json), Some(svg)) => {
            println!("  History:    {:?}", json);
            println!("  Chart:      {:?}", svg);
        }
        _ => println!("  History:    {}", "not written (see warnings)".yellow()),
    }
    print_export_report(&summary.export);
}

fn print_export_report(report: &ExportReport) {
    println!("\n{} {:?}", "Exported model to".green().bold(), report.dir);
    for (name, bytes) in &report.files {
        println!("    {:18} {:>12}", name, format_bytes(*bytes));
    }
    println!("  Total size: {:.2} MB", report.total_mb());
}

fn cmd_predict(
    input: &Path,
    model_dir: &Path,
    threshold: Option<f64>,
) -> thumbnail_detector::Result<()> {
    let device = default_device();
    let mut predictor = Predictor::<DefaultBackend>::load(model_dir, &device)?;
    if let Some(t) = threshold {
        predictor = predictor.with_threshold(t)?;
    }
    info!(
        "Predicting with classes {:?} at threshold {}",
        predictor.classes(),
        predictor.threshold()
    );

    if input.is_dir() {
        let summary = predictor.predict_dir(input)?;
        for prediction in &summary.predictions {
            let path = prediction
                .image_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            println!(
                "  {:50} {:14} {:.2}%",
                path,
                prediction.verdict.to_string(),
                prediction.confidence() * 100.0
            );
        }
        summary.print();
        return Ok(());
    }

    let prediction = predictor.predict_path(input)?;
    println!("\n{} {:?}", "Prediction for".cyan().bold(), input);
    for (name, p) in predictor.classes().iter().zip(&prediction.probabilities) {
        println!("    {:16} {:6.2}%", name, p * 100.0);
    }
    let verdict = prediction.verdict.to_string();
    let verdict = if prediction.verdict == thumbnail_detector::Verdict::Uncertain {
        verdict.yellow()
    } else {
        verdict.green()
    };
    println!("  Verdict: {}", verdict.bold());
    println!("  Inference time: {:.1} ms", prediction.inference_time_ms);
    Ok(())
}

fn cmd_export(checkpoint: &Path, output_dir: &Path) -> thumbnail_detector::Result<()> {
    info!("Exporting checkpoint {:?} to {:?}", checkpoint, output_dir);
    let report = export_checkpoint::<DefaultBackend>(checkpoint, output_dir, &default_device())?;
    print_export_report(&report);
    Ok(())
}

fn cmd_fetch_weights(
    source: &PretrainedSource,
    config_path: Option<&Path>,
    output: Option<PathBuf>,
) -> thumbnail_detector::Result<()> {
    let mut config = match config_path {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(path) = output {
        config.backbone_weights = path;
    }
    config.validate()?;

    let written = import_pretrained::<DefaultBackend>(source, &config, &default_device())?;
    println!(
        "{} {:?}",
        "Backbone record written to".green().bold(),
        thumbnail_detector::model::record_file(&written)
    );
    Ok(())
}

fn cmd_stats(data_dir: &Path, validation_split: f64, seed: u64) -> thumbnail_detector::Result<()> {
    info!("Computing dataset statistics for: {:?}", data_dir);

    let dataset = ThumbnailDataset::discover(data_dir)?;
    dataset.stats().print();

    let split = DatasetSplit::partition(&dataset, validation_split, seed)?;
    let counts = split.class_counts(dataset.num_classes());

    println!("\n{}", "Split preview".cyan().bold());
    println!(
        "  {} training / {} validation (fraction {}, seed {})",
        split.train.len(),
        split.validation.len(),
        validation_split,
        seed
    );
    for (name, (train, validation)) in dataset.classes.iter().zip(counts) {
        println!(
            "    {:20} {:6} train {:6} validation",
            name, train, validation
        );
    }
    Ok(())
}

fn cmd_init_config(output: &Path) -> thumbnail_detector::Result<()> {
    if output.exists() {
        return Err(ClassifierError::Config(format!(
            "{:?} already exists; refusing to overwrite",
            output
        )));
    }
    TrainingConfig::default().save(output)?;
    println!("{} {:?}", "Wrote default configuration to".green(), output);
    Ok(())
}
