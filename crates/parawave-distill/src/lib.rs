//! # parawave-distill
//!
//! Probability-density distillation of a frozen, autoregressive Gaussian
//! WaveNet *teacher* into a parallel Gaussian IAF *student*.
//!
//! Each step draws noise, lets the student generate a waveform together with
//! its exact log-density, scores that waveform under the teacher in one
//! parallel pass, and minimises
//!
//! ```text
//! kl_weight · mean(log q − log p)
//!   + regularization_weight · ((E[x] − μ_T)² + (Var[x] − σ²_T)²)
//!   + spectral_weight · mean |STFT(x) − STFT(x_ref)|
//! ```
//!
//! The [`TrainingController`] sequences updates with annealing, evaluation,
//! logging and snapshots; the [`DeviceDispatcher`] shards each batch across
//! devices when more than one is configured.
//!
//! ## Usage
//!
//! ```text
//! parawave train --gpus 0 1 --process 4 --prefetch 16 --config distill.toml
//! parawave train --resume runs/2024_01_01_00_00_00/snapshot_iter_10000.safetensors
//! ```

pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod noise;
pub mod objective;
pub mod plot;
pub mod policy;
pub mod report;
pub mod state;
pub mod student;
pub mod teacher;
pub mod trigger;

#[cfg(test)]
mod tests;

pub use checkpoint::Checkpoint;
pub use config::{AnnealConfig, DistillConfig, LossConfig, OptimConfig, ScheduleConfig};
pub use controller::{ControllerOptions, RunSummary, TrainingController};
pub use dataset::{Dataset, LoaderConfig, WavDataset};
pub use dispatcher::{DeviceDispatcher, Replica, ReplicaFactory, WaveNetReplicaFactory};
pub use error::DistillError;
pub use objective::{DistillationObjective, LossValues};
pub use policy::ParameterUpdatePolicy;
pub use report::{Reporter, RunDirectory};
pub use state::{ControllerState, TrainingState};
pub use teacher::{FrozenTeacher, PretrainedConfig};
pub use trigger::{Action, Trigger, TriggerUnit};
