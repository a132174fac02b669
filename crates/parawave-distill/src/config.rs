//! Orchestrator configuration. Built once, then passed around by reference.

use serde::{Deserialize, Serialize};

use crate::error::DistillError;
use crate::trigger::Trigger;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub kl_weight: f64,
    pub regularization_weight: f64,
    pub spectral_weight: f64,
    /// STFT window of the spectral term; must be a multiple of `hop_length`.
    pub n_fft: usize,
    pub hop_length: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { kl_weight: 1.0, regularization_weight: 1.0, spectral_weight: 1.0, n_fft: 1024, hop_length: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    /// Base learning rate; the effective Adam alpha is `lr / device_count`.
    pub lr: f64,
    /// Global gradient-norm threshold.
    pub grad_clip: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self { lr: 2e-4, grad_clip: 10.0, beta1: 0.9, beta2: 0.999, eps: 1e-8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealConfig {
    pub trigger: Trigger,
    /// Optimizer hyper-parameter to scale.
    pub hyperparameter: String,
    pub rate: f64,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self { trigger: Trigger::iterations(50_000), hyperparameter: "alpha".into(), rate: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub stop: Trigger,
    pub anneal: AnnealConfig,
    pub evaluate: Trigger,
    pub snapshot: Trigger,
    pub report: Trigger,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            stop: Trigger::iterations(200_000),
            anneal: AnnealConfig::default(),
            evaluate: Trigger::iterations(1_000),
            snapshot: Trigger::iterations(10_000),
            report: Trigger::iterations(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Global batch size, split across devices.
    pub batch_size: usize,
    /// Seeds parameter init, shuffling, crops and noise.
    pub seed: u64,
    pub loss: LossConfig,
    pub optim: OptimConfig,
    pub schedule: ScheduleConfig,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            seed: 0,
            loss: LossConfig::default(),
            optim: OptimConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl DistillConfig {
    pub fn validate(&self) -> Result<(), DistillError> {
        if self.batch_size == 0 {
            return Err(DistillError::config("distill.batch_size", "must be positive"));
        }
        let loss = &self.loss;
        if loss.hop_length == 0 || loss.n_fft == 0 || loss.n_fft % loss.hop_length != 0 {
            return Err(DistillError::config(
                "distill.loss.n_fft",
                format!("{} must be a positive multiple of hop_length {}", loss.n_fft, loss.hop_length),
            ));
        }
        for (field, w) in [
            ("distill.loss.kl_weight", loss.kl_weight),
            ("distill.loss.regularization_weight", loss.regularization_weight),
            ("distill.loss.spectral_weight", loss.spectral_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(DistillError::config(field, "must be a finite, non-negative number"));
            }
        }
        let o = &self.optim;
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(o.lr) || !positive(o.grad_clip) || !positive(o.eps) {
            return Err(DistillError::config("distill.optim", "lr, grad_clip and eps must be positive"));
        }
        if !(0.0..1.0).contains(&o.beta1) || !(0.0..1.0).contains(&o.beta2) {
            return Err(DistillError::config("distill.optim", "beta1 and beta2 must lie in [0, 1)"));
        }
        if self.schedule.stop.every == 0 {
            return Err(DistillError::config("distill.schedule.stop", "must be positive"));
        }
        Ok(())
    }
}
