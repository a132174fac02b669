use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::CoreResult;
use crate::model::{standard_normal_log_prob, FlowOutput, StudentConfig, StudentFlow};
use crate::wavenet::{shift_right, WaveNet, GAUSSIAN_OUTPUTS};

/// Student: a stack of Gaussian inverse-autoregressive flow stages.
///
/// Stage `k` maps `x_{k-1}` to `x_k = x_{k-1} · s_k + m_k`, where `(m_k, log s_k)`
/// at position `t` come from a WaveNet over `x_{k-1, <t}`. The Jacobian of each
/// stage is triangular, so
/// `log q(x_K) = log N(z) − Σ_k log s_k` per sample.
pub struct GaussianIaf {
    flows: Vec<WaveNet>,
    log_scale_min: f64,
}

impl GaussianIaf {
    pub fn new(cfg: &StudentConfig, vb: VarBuilder) -> CoreResult<Self> {
        cfg.validate()?;
        let flows = (0..cfg.n_flows())
            .map(|k| WaveNet::new(&cfg.flow_wavenet(k), GAUSSIAN_OUTPUTS, vb.pp(format!("flows.{k}"))))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { flows, log_scale_min: cfg.log_scale_min })
    }

    pub fn n_flows(&self) -> usize {
        self.flows.len()
    }
}

impl StudentFlow for GaussianIaf {
    fn generate(&self, noise: &Tensor, condition: &Tensor) -> CoreResult<FlowOutput> {
        let mut x = noise.unsqueeze(1)?;
        let mut log_scale_sum: Option<Tensor> = None;

        for flow in &self.flows {
            let out = flow.forward(&shift_right(&x)?, condition)?;
            let shift = out.narrow(1, 0, 1)?;
            let log_scale = out.narrow(1, 1, 1)?.maximum(self.log_scale_min)?;
            x = ((x * log_scale.exp()?)? + shift)?;
            log_scale_sum = Some(match log_scale_sum {
                Some(acc) => (acc + log_scale)?,
                None => log_scale,
            });
        }

        let base = standard_normal_log_prob(noise)?;
        let log_density = match log_scale_sum {
            Some(sum) => (base - sum.squeeze(1)?)?,
            None => base,
        };
        Ok(FlowOutput { waveform: x.squeeze(1)?, log_density })
    }
}
