//! # parawave-core
//!
//! Waveform-model collaborators for probability density distillation:
//! the frozen conditioning encoder and teacher oracle, the trainable student
//! flow, their parameter sets, audio preprocessing and device selection.
//!
//! | Role | Struct | Contract |
//! |------|--------|----------|
//! | Encoder | [`UpsampleNet`] | [`ConditioningEncoder`] |
//! | Teacher | [`GaussianWaveNet`] | [`TeacherOracle`] |
//! | Student | [`GaussianIaf`] | [`StudentFlow`] |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod audio;
pub mod device;
pub mod error;
pub mod flow;
pub mod loader;
pub mod model;
pub mod params;
pub mod upsample;
pub mod wavenet;

pub use audio::{AudioConfig, Example, MelSpectrogram, Preprocess};
pub use device::{device_name, select_devices, DeviceSpec};
pub use error::{CoreError, CoreResult};
pub use flow::GaussianIaf;
pub use loader::FrozenParameterSet;
pub use model::{
    ConditioningEncoder, FlowOutput, StudentConfig, StudentFlow, TeacherConfig, TeacherDensity,
    TeacherOracle, WaveNetConfig,
};
pub use params::TrainableParameterSet;
pub use upsample::UpsampleNet;
pub use wavenet::{GaussianWaveNet, WaveNet};
