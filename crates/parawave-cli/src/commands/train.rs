//! `parawave train` — distil the pretrained teacher into a parallel student.
//!
//! ```text
//! parawave train --config ljspeech.toml
//! parawave train --gpus 0 1 --process 4 --prefetch 16
//! parawave train --resume runs/2024_01_01_00_00_00/snapshot_iter_10000.safetensors
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use parawave_core::{select_devices, DeviceSpec, Preprocess};
use parawave_distill::{
    dataset::split_dataset, ControllerOptions, Dataset, DeviceDispatcher, DistillationObjective, FrozenTeacher,
    LoaderConfig, PretrainedConfig, Reporter, RunDirectory, TrainingController, WavDataset, WaveNetReplicaFactory,
};

use crate::config::{expand, expand_path, AppConfig};

#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub gpus: Vec<i64>,
    pub process: usize,
    pub prefetch: usize,
    pub resume: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
}

// ── Main entry point ──────────────────────────────────────────────────────────

pub async fn run(args: TrainArgs, config: AppConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    // Teacher loading and dataset discovery touch the disk; keep them off
    // the async workers.
    let mut controller = tokio::task::spawn_blocking(move || prepare(&args, &config))
        .await
        .context("Setup task panicked")??;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after the current step");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let (summary, controller) = tokio::task::spawn_blocking(move || {
        let summary = controller.run()?;
        Ok::<_, anyhow::Error>((summary, controller))
    })
    .await
    .context("Training task panicked")??;

    info!(
        iterations = summary.iterations,
        epochs = summary.epochs,
        elapsed = format!("{:.1}s", summary.elapsed_secs),
        interrupted = summary.interrupted,
        "Distillation finished"
    );

    let run_dir = controller
        .reporter()
        .map(|r| r.dir().path().display().to_string())
        .unwrap_or_default();
    match summary.final_loss {
        Some(loss) => println!(
            "\nDistillation {}.\n\
             Iterations: {}\n\
             Final loss: {:.4} (kl {:.4}, regularization {:.4}, spectrogram {:.4})\n\
             Elapsed: {:.1} s\n\
             Run directory: {}",
            if summary.interrupted { "interrupted" } else { "complete" },
            summary.iterations,
            loss.loss,
            loss.kl_divergence,
            loss.regularization,
            loss.spectrogram_frame_loss,
            summary.elapsed_secs,
            run_dir,
        ),
        None => println!("\nNo training step was run. Run directory: {run_dir}"),
    }
    Ok(())
}

/// Devices, frozen teacher, replicas, data, run directory: everything the
/// controller needs, built in that order so the cheapest failures come first.
fn prepare(args: &TrainArgs, config: &AppConfig) -> Result<TrainingController> {
    // ── Devices ───────────────────────────────────────────────────────────────
    let specs = DeviceSpec::parse_ids(&args.gpus)?;
    let devices = select_devices(&specs)?;

    // ── Frozen teacher ────────────────────────────────────────────────────────
    let pretrained = PretrainedConfig { path: expand(&config.pretrained.path), ..config.pretrained.clone() };
    let teacher = FrozenTeacher::load(&pretrained, &config.teacher)
        .with_context(|| format!("Failed to load pretrained weights from {}", pretrained.path.display()))?;

    // ── Replicas ──────────────────────────────────────────────────────────────
    let factory = WaveNetReplicaFactory::new(teacher, config.student.clone());
    let objective = DistillationObjective::new(&config.distill.loss)?;
    let dispatcher = DeviceDispatcher::build(&factory, &devices, objective, config.distill.seed)?;

    // ── Data ──────────────────────────────────────────────────────────────────
    let root = expand_path(&config.data.root);
    info!(path = %root.display(), "Loading dataset");
    let preprocess = Preprocess::new(config.audio.clone())?;
    let corpus: Arc<dyn Dataset> = Arc::new(
        WavDataset::from_root(&root, preprocess)
            .with_context(|| format!("Failed to load dataset from {}", root.display()))?,
    );
    let (train, valid) = split_dataset(corpus, config.data.train_fraction, config.data.split_seed)?;

    // ── Run directory ─────────────────────────────────────────────────────────
    let run_dir = RunDirectory::create(&expand_path(&config.run.out_dir))?;
    run_dir.write_config(config)?;
    if let Some(path) = args.config_file.as_deref() {
        run_dir.copy_user_config(path)?;
    }

    let options = ControllerOptions {
        loader: LoaderConfig { process: args.process.max(1), prefetch: args.prefetch.max(1) },
        progress: config.run.progress,
    };
    let mut controller = TrainingController::new(
        &config.distill,
        dispatcher,
        Arc::new(train),
        Arc::new(valid),
        options,
        Some(Reporter::new(run_dir)),
    )?;

    if let Some(path) = args.resume.as_deref() {
        controller
            .resume(path)
            .with_context(|| format!("Failed to resume from {}", path.display()))?;
    }
    Ok(controller)
}
