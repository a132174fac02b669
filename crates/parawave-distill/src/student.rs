//! Trainable student: a Gaussian IAF whose variables live in a
//! [`TrainableParameterSet`].

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use tracing::info;

use parawave_core::{device_name, GaussianIaf, StudentConfig, TrainableParameterSet};

pub struct TrainableStudent {
    pub params: TrainableParameterSet,
    pub flow: Arc<GaussianIaf>,
}

impl TrainableStudent {
    /// Build the flow on `device`. Weights are left at their builder
    /// defaults; call [`TrainableParameterSet::initialize`] or copy from
    /// another replica before training.
    pub fn build(config: &StudentConfig, device: &Device) -> Result<Self> {
        let params = TrainableParameterSet::new(device);
        let flow = GaussianIaf::new(config, params.var_builder()).context("Failed to build student flow")?;
        info!(
            device = device_name(device),
            flows = flow.n_flows(),
            variables = params.len(),
            parameters = params.element_count()?,
            "Student built"
        );
        Ok(Self { params, flow: Arc::new(flow) })
    }
}
