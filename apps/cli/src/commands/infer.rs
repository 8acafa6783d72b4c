//! Inference command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use torchline_training::{TorchTrainTask, TrainerConfig};

pub async fn execute(
    job_dir: &Path,
    image_path: &Path,
    epoch: Option<f64>,
    trainer: TrainerConfig,
    json_output: bool,
) -> Result<()> {
    let task = TorchTrainTask::load_state(job_dir, trainer)
        .with_context(|| format!("Failed to load task from {}", job_dir.display()))?;
    let image = std::fs::read(image_path)
        .with_context(|| format!("Failed to read image: {}", image_path.display()))?;

    let abort = CancellationToken::new();
    super::cancel_on_ctrl_c(abort.clone());

    let report = task.infer_one(&image, epoch, abort).await;
    let Some(predictions) = report.predictions else {
        if let Some(traceback) = &report.traceback {
            for line in traceback.lines() {
                eprintln!("  {}", line.dimmed());
            }
        }
        if report.aborted {
            anyhow::bail!("Inference aborted");
        }
        anyhow::bail!(
            "Inference failed: {}",
            report.exception.as_deref().unwrap_or("no predictions")
        );
    };

    if json_output {
        let out: Vec<_> = predictions
            .iter()
            .map(|p| {
                json!({
                    "label": p.label,
                    "name": task.label_for(p.label),
                    "confidence": p.confidence,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Predictions ({})", predictions.len()).bold().cyan());
    println!();

    if predictions.is_empty() {
        println!("  {}", "The trainer reported no predictions.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<8} {:<24} {}", "Label", "Name", "Confidence");
    println!("{}", "─".repeat(48));
    for p in &predictions {
        println!(
            "{:<8} {:<24} {}",
            p.label.to_string().cyan(),
            task.label_for(p.label).unwrap_or("-"),
            format!("{:.4}", p.confidence).dimmed()
        );
    }
    println!();
    Ok(())
}
