//! segrun CLI: runs one segmentation experiment from a YAML document.

use clap::Parser;
use segrun_ml::data::JsonDatasetLoader;
use segrun_ml::model::PixelSoftmaxFactory;
use segrun_ml::{ExperimentConfig, ExperimentPipeline, MlError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Train and evaluate a segmentation model from an experiment document.
#[derive(Parser, Debug)]
#[command(name = "segrun", version, about, long_about = None)]
struct Cli {
    /// Experiment configuration file (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for the JSON run log (defaults to the platform data directory)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = cli.log_dir.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("dev", "segrun", "segrun")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "segrun.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            let strategy_error = e
                .downcast_ref::<MlError>()
                .is_some_and(MlError::is_configuration);
            if strategy_error {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = ExperimentConfig::load(&cli.config)?;
    let loader = JsonDatasetLoader::new(config.dataset.clone());
    let pipeline = ExperimentPipeline::new(config, loader, PixelSoftmaxFactory);

    let outcome = pipeline.run()?;
    tracing::info!(
        dir = %outcome.dir.display(),
        outcome = ?outcome.run.outcome,
        epochs = outcome.run.history.epochs_completed(),
        val_jaccard = outcome.report.val_jaccard,
        train_jaccard = outcome.report.train_jaccard,
        "Experiment finished"
    );
    Ok(())
}
