//! Frozen teacher artifact: encoder + Gaussian WaveNet weights read from one
//! safetensors file under two prefixes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use parawave_core::{FrozenParameterSet, GaussianWaveNet, TeacherConfig, UpsampleNet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainedConfig {
    /// Safetensors file holding the trained encoder and teacher.
    pub path: PathBuf,
    pub encoder_prefix: String,
    pub teacher_prefix: String,
}

impl Default for PretrainedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("teacher.safetensors"),
            encoder_prefix: "encoder".into(),
            teacher_prefix: "teacher".into(),
        }
    }
}

/// Host copy of the frozen weights; replicated to each device on demand.
pub struct FrozenTeacher {
    encoder: FrozenParameterSet,
    teacher: FrozenParameterSet,
    config: TeacherConfig,
}

impl FrozenTeacher {
    pub fn load(pretrained: &PretrainedConfig, config: &TeacherConfig) -> Result<Self> {
        let encoder = FrozenParameterSet::load(&pretrained.path, &pretrained.encoder_prefix, &Device::Cpu)
            .context("Failed to load frozen encoder")?;
        let teacher = FrozenParameterSet::load(&pretrained.path, &pretrained.teacher_prefix, &Device::Cpu)
            .context("Failed to load frozen teacher")?;
        let this = Self::from_parts(encoder, teacher, config.clone());
        // Fail at startup, not at the first step, if names or shapes disagree.
        this.build(&Device::Cpu).context("Pretrained weights do not match the teacher config")?;
        info!(
            path = %pretrained.path.display(),
            encoder_tensors = this.encoder.len(),
            teacher_tensors = this.teacher.len(),
            "Teacher loaded"
        );
        Ok(this)
    }

    pub fn from_parts(encoder: FrozenParameterSet, teacher: FrozenParameterSet, config: TeacherConfig) -> Self {
        Self { encoder, teacher, config }
    }

    pub fn config(&self) -> &TeacherConfig {
        &self.config
    }

    pub fn encoder_weights(&self) -> &FrozenParameterSet {
        &self.encoder
    }

    pub fn teacher_weights(&self) -> &FrozenParameterSet {
        &self.teacher
    }

    /// Instantiate encoder and teacher on `device`.
    pub fn build(&self, device: &Device) -> Result<(UpsampleNet, GaussianWaveNet)> {
        let enc = self.encoder.to_device(device)?;
        let tea = self.teacher.to_device(device)?;
        let encoder = UpsampleNet::new(
            &self.config.upsample_factors,
            self.config.wavenet.condition_dim,
            enc.var_builder(device),
        )?;
        let teacher = GaussianWaveNet::new(&self.config, tea.var_builder(device))?;
        Ok((encoder, teacher))
    }
}
