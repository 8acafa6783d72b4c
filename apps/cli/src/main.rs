//! Torchline CLI - Command-line interface for supervised Torch training
//!
//! This CLI provides a `torchline` command for running the `th` trainer on a
//! job directory, classifying images with its snapshots and listing them.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use torchline_training::TrainerConfig;
use tracing_subscriber::EnvFilter;

/// Torchline CLI - Supervised Torch training
#[derive(Parser, Debug)]
#[command(
    name = "torchline",
    author,
    version,
    about = "Torchline - Supervised Torch training",
    long_about = "Torchline runs the Torch `th` trainer for image classification jobs.\nIt tracks progress, metrics and weight snapshots, and classifies images with trained snapshots."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Trainer configuration file (defaults to ~/.torchline/config.toml and ./.torchlinerc)
    #[arg(short = 'c', long = "trainer-config", global = true)]
    trainer_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a network
    ///
    /// Creates a task from a training config (JSON), persists it in the job
    /// directory and runs the trainer until it finishes, fails or is
    /// interrupted with Ctrl-C.
    Train {
        /// Path to the training config JSON
        #[arg(long)]
        config: PathBuf,

        /// Output progress events and the final task as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Classify one image with a trained snapshot
    Infer {
        /// Job directory of a persisted task
        #[arg(long)]
        job: PathBuf,

        /// Image file to classify
        #[arg(long)]
        image: PathBuf,

        /// Snapshot epoch to use (defaults to the latest snapshot)
        #[arg(long)]
        epoch: Option<f64>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the weight snapshots of a job
    Snapshots {
        /// Job directory of a persisted task
        #[arg(long)]
        job: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `--json` output stays machine readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    let trainer = match args.trainer_config {
        Some(path) => TrainerConfig::load_from_file(&path)?,
        None => TrainerConfig::discover_and_load(),
    };

    match args.command {
        Command::Train { config, json } => commands::train::execute(&config, trainer, json).await,
        Command::Infer { job, image, epoch, json } => {
            commands::infer::execute(&job, &image, epoch, trainer, json).await
        }
        Command::Snapshots { job, json } => commands::snapshots::execute(&job, trainer, json),
    }
}
