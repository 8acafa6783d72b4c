//! Training command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use torchline_training::{
    ChannelProgressSink, RunOutcome, StdoutProgressSink, TorchTrainTask, TrainTaskConfig, Trainer,
    TrainerConfig, TrainerStatus,
};

pub async fn execute(config_path: &Path, trainer: TrainerConfig, json_output: bool) -> Result<()> {
    let bytes = std::fs::read(config_path)
        .with_context(|| format!("Failed to read training config: {}", config_path.display()))?;
    let config: TrainTaskConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse training config: {}", config_path.display()))?;

    let mut task = TorchTrainTask::new(config, trainer).context("Invalid training config")?;
    task.prepare().await.context("Failed to prepare training task")?;
    task.save_state().context("Failed to save task state")?;

    super::cancel_on_ctrl_c(task.abort_handle());

    let outcome = if json_output {
        let (sink, mut rx) = ChannelProgressSink::new();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        });
        let outcome = task.run(&sink).await;
        drop(sink);
        printer.await.context("Progress printer failed")?;
        outcome?
    } else {
        println!();
        println!("{}", task.name().bold().cyan());
        println!("  Job dir: {}", task.job_dir().display().to_string().dimmed());
        println!();
        task.run(&StdoutProgressSink).await?
    };

    let record = task.record();
    if json_output {
        println!("{}", serde_json::to_string(record)?);
    } else {
        println!();
        match &record.status {
            TrainerStatus::Finished => println!("{}", "Training complete".bold().green()),
            TrainerStatus::Cancelled => println!("{}", "Training aborted".bold().yellow()),
            status => println!("{}", format!("Training {status}").bold().red()),
        }
        println!("  Epoch: {}", record.current_epoch);
        println!("  Snapshots: {}", task.snapshots().len());
        if let Some(traceback) = &record.traceback {
            println!();
            for line in traceback.lines() {
                println!("  {}", line.dimmed());
            }
        }
        println!();
    }

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Aborted => anyhow::bail!("Training aborted"),
        RunOutcome::Failed { .. } => anyhow::bail!(
            "Training failed: {}",
            record.exception.as_deref().unwrap_or("unknown error")
        ),
    }
}
