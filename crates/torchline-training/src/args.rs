//! Argument vectors for the `th` training and inference entry points.

use crate::config::TrainerConfig;
use crate::error::TrainingResult;
use crate::job::TrainTaskConfig;
use crate::supervisor::TrainerCommand;
use std::path::Path;

/// Command line for `main.lua` training the task's network.
///
/// The validation pair is only passed when the validation database exists
/// and `val_interval` is positive.
pub fn training_command(trainer: &TrainerConfig, task: &TrainTaskConfig) -> TrainingResult<TrainerCommand> {
    let dataset = task.dataset.image_classification()?;
    let job_dir = task.job_dir.display();

    let mut args = vec![
        trainer.train_script().display().to_string(),
        format!("--network={}", task.network_name()),
        format!("--epoch={}", task.train_epochs),
        format!("--train={}", dataset.train_path().display()),
        format!("--networkDirectory={job_dir}"),
        format!("--save={job_dir}"),
        format!("--snapshotPrefix={}", task.snapshot_prefix),
        format!("--snapshotInterval={:.6}", task.snapshot_interval),
        "--useMeanPixel=yes".to_string(),
        format!("--mean={}", dataset.mean_path().display()),
        format!("--labels={}", dataset.labels_path().display()),
        format!("--batchSize={}", task.batch_size()),
        format!("--learningRate={:.6}", task.learning_rate),
        format!("--policy={}", task.lr_policy.name()),
    ];
    args.extend(task.lr_policy.arguments());
    push_image_flags(&mut args, task);

    let val_path = dataset.val_path();
    if val_path.exists() && task.val_interval > 0.0 {
        args.push(format!("--validation={}", val_path.display()));
        args.push(format!("--interval={:.6}", task.val_interval));
    }

    if let Some(gpu_id) = trainer.gpu_id {
        args.push(format!("--devid={}", gpu_id + 1));
    }

    Ok(TrainerCommand { program: trainer.th_binary(), args, cwd: task.job_dir.clone() })
}

/// Command line for `test.lua` classifying `image` with the snapshot taken
/// at `snapshot_epoch`.
pub fn inference_command(
    trainer: &TrainerConfig,
    task: &TrainTaskConfig,
    image: &Path,
    snapshot_epoch: f64,
) -> TrainingResult<TrainerCommand> {
    let dataset = task.dataset.image_classification()?;
    let job_dir = task.job_dir.display();

    // The trainer loads snapshots by whole epoch.
    let epoch = snapshot_epoch.trunc() as i64;

    let mut args = vec![
        trainer.test_script().display().to_string(),
        format!("--image={}", image.display()),
        format!("--network={}", task.network_name()),
        format!("--epoch={epoch}"),
        format!("--networkDirectory={job_dir}"),
        format!("--load={job_dir}"),
        format!("--snapshotPrefix={}", task.snapshot_prefix),
        format!("--mean={}", dataset.mean_path().display()),
        format!("--labels={}", dataset.labels_path().display()),
        "--useMeanPixel=yes".to_string(),
    ];
    push_image_flags(&mut args, task);

    Ok(TrainerCommand { program: trainer.th_binary(), args, cwd: task.job_dir.clone() })
}

fn push_image_flags(args: &mut Vec<String>, task: &TrainTaskConfig) {
    if let Some(crop_size) = task.crop_size.filter(|size| *size > 0) {
        args.push("--crop=yes".to_string());
        args.push(format!("--croplen={crop_size}"));
    }
    let subtract_mean = if task.use_mean { "yes" } else { "no" };
    args.push(format!("--subtractMean={subtract_mean}"));
}
