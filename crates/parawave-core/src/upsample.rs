use candle_core::{Module, Tensor};
use candle_nn::{conv_transpose1d, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder};

use crate::error::{CoreError, CoreResult};
use crate::model::ConditioningEncoder;

const LEAKY_SLOPE: f64 = 0.4;

/// Frame-rate → sample-rate conditioning upsampler.
///
/// One transposed convolution per factor (kernel `2f`, stride `f`), leaky ReLU
/// between layers. Outputs are detached: the encoder is always frozen.
pub struct UpsampleNet {
    layers: Vec<ConvTranspose1d>,
    factors: Vec<usize>,
}

impl UpsampleNet {
    pub fn new(factors: &[usize], channels: usize, vb: VarBuilder) -> CoreResult<Self> {
        if factors.is_empty() || factors.contains(&0) {
            return Err(CoreError::config(
                "teacher.upsample_factors",
                "factors must be a non-empty list of positive integers",
            ));
        }
        let layers = factors
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let cfg = ConvTranspose1dConfig { padding: f / 2, stride: f, ..Default::default() };
                conv_transpose1d(channels, channels, 2 * f, cfg, vb.pp(format!("layers.{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { layers, factors: factors.to_vec() })
    }
}

impl ConditioningEncoder for UpsampleNet {
    fn encode(&self, features: &Tensor) -> CoreResult<Tensor> {
        let mut h = features.clone();
        let last = self.layers.len() - 1;
        for (i, (layer, &f)) in self.layers.iter().zip(&self.factors).enumerate() {
            let len = h.dim(2)? * f;
            h = layer.forward(&h)?.narrow(2, 0, len)?;
            if i != last {
                h = h.maximum(&(&h * LEAKY_SLOPE)?)?;
            }
        }
        Ok(h.detach())
    }

    fn upsample_factor(&self) -> usize {
        self.factors.iter().product()
    }
}
