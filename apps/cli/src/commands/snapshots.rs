//! Snapshot listing command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use torchline_training::{TorchTrainTask, TrainerConfig};

pub fn execute(job_dir: &Path, trainer: TrainerConfig, json_output: bool) -> Result<()> {
    let task = TorchTrainTask::load_state(job_dir, trainer)
        .with_context(|| format!("Failed to load task from {}", job_dir.display()))?;
    let snapshots = task.snapshots();

    if json_output {
        let out = json!({
            "job_id": task.job_id(),
            "status": task.record().status,
            "snapshots": snapshots,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Snapshots ({})", snapshots.len()).bold().cyan());
    println!("  Task: {} ({})", task.job_id().to_string().cyan(), task.record().status);
    println!();

    if snapshots.is_empty() {
        println!("  {}", "No snapshots found for this job.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<10} {}", "Epoch", "Path");
    println!("{}", "─".repeat(70));
    for snapshot in snapshots {
        println!("{:<10} {}", snapshot.epoch.to_string().cyan(), snapshot.path.display().to_string().dimmed());
    }
    println!();
    Ok(())
}
