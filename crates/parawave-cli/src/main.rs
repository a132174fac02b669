use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use config::load_config;

/// parawave — parallel waveform distillation
#[derive(Debug, Parser)]
#[command(name = "parawave", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Distil the pretrained teacher WaveNet into a parallel student flow.
    ///
    /// Output lands in a fresh timestamped directory under `run.out_dir`.
    /// Ctrl-C stops after the current step and writes a final snapshot.
    Train {
        /// Device ids. `-1` (default) trains on the CPU; several ids shard
        /// each batch across those GPUs, the first one owning the optimizer.
        #[arg(long, num_args = 1.., default_values_t = [-1], allow_negative_numbers = true)]
        gpus: Vec<i64>,

        /// Worker threads loading examples; 1 loads on the training thread.
        #[arg(long, default_value_t = 1)]
        process: usize,

        /// Batches queued ahead of the training thread.
        #[arg(long, default_value_t = 64)]
        prefetch: usize,

        /// Snapshot to continue from.
        #[arg(long, value_name = "PATH")]
        resume: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Train { gpus, process, prefetch, resume } => {
            let args = commands::train::TrainArgs {
                gpus,
                process,
                prefetch,
                resume,
                config_file: cli.config,
            };
            commands::train::run(args, cfg).await?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
