use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// `0.5 * ln(2π)`.
pub const HALF_LOG_2PI: f64 = 0.918_938_533_204_672_8;

/// Shape of one dilated convolution stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveNetConfig {
    /// Number of times the dilation cycle is repeated.
    pub n_loop: usize,
    /// Layers per cycle; layer `i` uses dilation `2^i`.
    pub n_layer: usize,
    pub filter_size: usize,
    pub residual_channels: usize,
    /// Channels of each half of the gated activation.
    pub dilated_channels: usize,
    pub skip_channels: usize,
    /// Channels of the waveform-rate conditioning input.
    pub condition_dim: usize,
}

/// Frozen teacher: conditioning upsampler plus a Gaussian-output WaveNet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeacherConfig {
    /// Product must equal the acoustic-feature hop length.
    pub upsample_factors: Vec<usize>,
    pub wavenet: WaveNetConfig,
    pub log_scale_min: f64,
}

impl Default for TeacherConfig {
    fn default() -> Self {
        Self {
            upsample_factors: vec![16, 16],
            wavenet: WaveNetConfig {
                n_loop: 2,
                n_layer: 10,
                filter_size: 2,
                residual_channels: 64,
                dilated_channels: 128,
                skip_channels: 256,
                condition_dim: 80,
            },
            log_scale_min: -7.0,
        }
    }
}

impl TeacherConfig {
    pub fn upsample_factor(&self) -> usize {
        self.upsample_factors.iter().product()
    }
}

/// Trainable student: one WaveNet per inverse-autoregressive flow stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentConfig {
    /// Dilation cycles per flow stage.
    pub n_loops: Vec<usize>,
    /// Layers per cycle, per flow stage.
    pub n_layers: Vec<usize>,
    pub filter_size: usize,
    pub residual_channels: usize,
    pub dilated_channels: usize,
    pub skip_channels: usize,
    pub condition_dim: usize,
    pub log_scale_min: f64,
}

impl Default for StudentConfig {
    fn default() -> Self {
        Self {
            n_loops: vec![1, 1, 1, 1],
            n_layers: vec![10, 10, 10, 10],
            filter_size: 3,
            residual_channels: 64,
            dilated_channels: 128,
            skip_channels: 64,
            condition_dim: 80,
            log_scale_min: -7.0,
        }
    }
}

impl StudentConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.n_loops.is_empty() {
            return Err(CoreError::config("student.n_loops", "at least one flow stage is required"));
        }
        if self.n_loops.len() != self.n_layers.len() {
            return Err(CoreError::config(
                "student.n_layers",
                format!(
                    "expected {} entries (one per flow stage), got {}",
                    self.n_loops.len(),
                    self.n_layers.len()
                ),
            ));
        }
        Ok(())
    }

    pub fn n_flows(&self) -> usize {
        self.n_loops.len()
    }

    /// WaveNet shape of flow stage `k`.
    pub fn flow_wavenet(&self, k: usize) -> WaveNetConfig {
        WaveNetConfig {
            n_loop: self.n_loops[k],
            n_layer: self.n_layers[k],
            filter_size: self.filter_size,
            residual_channels: self.residual_channels,
            dilated_channels: self.dilated_channels,
            skip_channels: self.skip_channels,
            condition_dim: self.condition_dim,
        }
    }
}

// ── Capability contracts ──────────────────────────────────────────────────────

/// Maps frame-rate acoustic features `[batch, n_mels, frames]` to
/// waveform-rate conditioning `[batch, condition_dim, frames * factor]`.
pub trait ConditioningEncoder: Send + Sync {
    fn encode(&self, features: &Tensor) -> CoreResult<Tensor>;

    /// Number of waveform samples per feature frame.
    fn upsample_factor(&self) -> usize;
}

/// Teacher output for a fully known waveform.
#[derive(Debug, Clone)]
pub struct TeacherDensity {
    /// Per-sample log-likelihood, `[batch, T]`.
    pub log_prob: Tensor,
    /// Predicted mean per sample, `[batch, T]`.
    pub mean: Tensor,
    /// Predicted log standard deviation per sample, `[batch, T]`.
    pub log_scale: Tensor,
}

/// Likelihood oracle over a known waveform.
///
/// Evaluated in one parallel pass: the distribution at position `t` depends
/// only on conditioning and the supplied samples `< t`. Gradient flows into
/// `waveform`, never into the oracle's own weights.
pub trait TeacherOracle: Send + Sync {
    fn log_likelihood(&self, waveform: &Tensor, condition: &Tensor) -> CoreResult<TeacherDensity>;
}

/// Student output.
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// Generated waveform, `[batch, T]`.
    pub waveform: Tensor,
    /// Exact per-sample log-density of `waveform` under the student, `[batch, T]`.
    pub log_density: Tensor,
}

/// Non-autoregressive generator: noise `[batch, T]` + conditioning → waveform.
pub trait StudentFlow: Send + Sync {
    fn generate(&self, noise: &Tensor, condition: &Tensor) -> CoreResult<FlowOutput>;
}

// ── Gaussian helpers ──────────────────────────────────────────────────────────

/// Element-wise `log N(x; mean, exp(log_scale)^2)`.
pub fn gaussian_log_prob(x: &Tensor, mean: &Tensor, log_scale: &Tensor) -> CoreResult<Tensor> {
    let z = ((x - mean)? * log_scale.neg()?.exp()?)?;
    let lp = ((z.sqr()? * -0.5)? - log_scale)?;
    Ok((lp - HALF_LOG_2PI)?)
}

/// Element-wise `log N(z; 0, 1)`.
pub fn standard_normal_log_prob(z: &Tensor) -> CoreResult<Tensor> {
    Ok(((z.sqr()? * -0.5)? - HALF_LOG_2PI)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_standard_normal_at_zero() {
        let z = Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu).unwrap();
        let lp = standard_normal_log_prob(&z).unwrap().to_vec1::<f32>().unwrap();
        for v in lp {
            assert!((v as f64 + HALF_LOG_2PI).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gaussian_matches_standard_when_unit() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[0.3f32, -1.2, 2.0], &dev).unwrap();
        let zeros = x.zeros_like().unwrap();
        let a = gaussian_log_prob(&x, &zeros, &zeros).unwrap().to_vec1::<f32>().unwrap();
        let b = standard_normal_log_prob(&x).unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in a.iter().zip(b.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_student_config_validation() {
        let mut cfg = StudentConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.n_flows(), 4);
        cfg.n_layers.pop();
        assert!(cfg.validate().is_err());
        cfg.n_loops.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_teacher_upsample_matches_hop() {
        assert_eq!(TeacherConfig::default().upsample_factor(), 256);
    }
}
