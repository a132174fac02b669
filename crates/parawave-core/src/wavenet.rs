//! Causal dilated convolution stack shared by the teacher and every student
//! flow stage, plus the Gaussian-output teacher built on it.

use candle_core::{Module, Tensor};
use candle_nn::{conv1d, init, Conv1d, Conv1dConfig, VarBuilder};

use crate::error::CoreResult;
use crate::model::{gaussian_log_prob, TeacherConfig, TeacherDensity, TeacherOracle, WaveNetConfig};

/// Output channels of a Gaussian head: mean and log-scale.
pub(crate) const GAUSSIAN_OUTPUTS: usize = 2;

/// Shift `[batch, C, T]` one step to the right along time, inserting a zero at
/// `t = 0`, so position `t` only sees samples `< t`.
pub fn shift_right(x: &Tensor) -> CoreResult<Tensor> {
    let t = x.dim(2)?;
    Ok(x.pad_with_zeros(2, 1, 0)?.narrow(2, 0, t)?)
}

/// Element-wise `1 / (1 + e^-x)`.
fn sigmoid(x: &Tensor) -> CoreResult<Tensor> {
    Ok((x.neg()?.exp()? + 1.0)?.recip()?)
}

/// Left-padded dilated convolution, expressed as one matmul per tap.
struct CausalConv1d {
    weight: Tensor,
    bias: Tensor,
    kernel: usize,
    dilation: usize,
}

impl CausalConv1d {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        dilation: usize,
        vb: VarBuilder,
    ) -> CoreResult<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels, kernel),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", init::ZERO)?;
        Ok(Self { weight, bias, kernel, dilation })
    }

    fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let t = x.dim(2)?;
        let mut acc: Option<Tensor> = None;
        for tap in 0..self.kernel {
            let shift = (self.kernel - 1 - tap) * self.dilation;
            if shift >= t {
                continue;
            }
            let w = self.weight.narrow(2, tap, 1)?.squeeze(2)?.contiguous()?;
            let xs = if shift == 0 {
                x.clone()
            } else {
                x.pad_with_zeros(2, shift, 0)?.narrow(2, 0, t)?.contiguous()?
            };
            let y = w.broadcast_matmul(&xs)?;
            acc = Some(match acc {
                Some(a) => (a + y)?,
                None => y,
            });
        }
        let out = match acc {
            Some(a) => a,
            None => {
                let (b, _, _) = x.dims3()?;
                Tensor::zeros((b, self.weight.dim(0)?, t), x.dtype(), x.device())?
            }
        };
        Ok(out.broadcast_add(&self.bias.reshape((1, (), 1))?)?)
    }
}

struct ResidualBlock {
    dilated: CausalConv1d,
    condition: Conv1d,
    residual: Conv1d,
    skip: Conv1d,
    gate_channels: usize,
}

impl ResidualBlock {
    fn new(cfg: &WaveNetConfig, dilation: usize, vb: VarBuilder) -> CoreResult<Self> {
        let g = cfg.dilated_channels;
        let pointwise = Conv1dConfig::default();
        Ok(Self {
            dilated: CausalConv1d::new(
                cfg.residual_channels,
                2 * g,
                cfg.filter_size,
                dilation,
                vb.pp("dilated"),
            )?,
            condition: conv1d(cfg.condition_dim, 2 * g, 1, pointwise, vb.pp("condition"))?,
            residual: conv1d(g, cfg.residual_channels, 1, pointwise, vb.pp("residual"))?,
            skip: conv1d(g, cfg.skip_channels, 1, pointwise, vb.pp("skip"))?,
            gate_channels: g,
        })
    }

    /// Returns `(residual_out, skip_out)`.
    fn forward(&self, x: &Tensor, condition: &Tensor) -> CoreResult<(Tensor, Tensor)> {
        let g = self.gate_channels;
        let h = (self.dilated.forward(x)? + self.condition.forward(condition)?)?;
        let filter = h.narrow(1, 0, g)?.tanh()?;
        let gate = sigmoid(&h.narrow(1, g, g)?)?;
        let z = (filter * gate)?;
        let skip = self.skip.forward(&z)?;
        let residual = (self.residual.forward(&z)? + x)?;
        Ok((residual, skip))
    }
}

/// Gated, conditioned, causal dilated convolution stack.
pub struct WaveNet {
    input: Conv1d,
    blocks: Vec<ResidualBlock>,
    head_hidden: Conv1d,
    head_out: Conv1d,
}

impl WaveNet {
    pub fn new(cfg: &WaveNetConfig, output_dim: usize, vb: VarBuilder) -> CoreResult<Self> {
        let pointwise = Conv1dConfig::default();
        let input = conv1d(1, cfg.residual_channels, 1, pointwise, vb.pp("input"))?;

        let mut blocks = Vec::with_capacity(cfg.n_loop * cfg.n_layer);
        for i in 0..cfg.n_loop * cfg.n_layer {
            let dilation = 1usize << (i % cfg.n_layer);
            blocks.push(ResidualBlock::new(cfg, dilation, vb.pp(format!("blocks.{i}")))?);
        }

        let head_hidden = conv1d(cfg.skip_channels, cfg.skip_channels, 1, pointwise, vb.pp("head.0"))?;
        let head_out = conv1d(cfg.skip_channels, output_dim, 1, pointwise, vb.pp("head.1"))?;
        Ok(Self { input, blocks, head_hidden, head_out })
    }

    /// `x`: `[batch, 1, T]` (already shifted by the caller),
    /// `condition`: `[batch, condition_dim, T]` → `[batch, output_dim, T]`.
    pub fn forward(&self, x: &Tensor, condition: &Tensor) -> CoreResult<Tensor> {
        let mut h = self.input.forward(x)?;
        let mut skips: Option<Tensor> = None;
        for block in &self.blocks {
            let (next, skip) = block.forward(&h, condition)?;
            h = next;
            skips = Some(match skips {
                Some(s) => (s + skip)?,
                None => skip,
            });
        }
        let skips = match skips {
            Some(s) => s,
            None => h,
        };
        let hidden = self.head_hidden.forward(&skips.relu()?)?.relu()?;
        Ok(self.head_out.forward(&hidden)?)
    }
}

/// Teacher: autoregressive WaveNet with a single-Gaussian output per sample.
pub struct GaussianWaveNet {
    net: WaveNet,
    log_scale_min: f64,
}

impl GaussianWaveNet {
    pub fn new(cfg: &TeacherConfig, vb: VarBuilder) -> CoreResult<Self> {
        Ok(Self {
            net: WaveNet::new(&cfg.wavenet, GAUSSIAN_OUTPUTS, vb)?,
            log_scale_min: cfg.log_scale_min,
        })
    }
}

impl TeacherOracle for GaussianWaveNet {
    fn log_likelihood(&self, waveform: &Tensor, condition: &Tensor) -> CoreResult<TeacherDensity> {
        let x = shift_right(&waveform.unsqueeze(1)?)?;
        let out = self.net.forward(&x, condition)?;
        let mean = out.narrow(1, 0, 1)?.squeeze(1)?;
        let log_scale = out.narrow(1, 1, 1)?.squeeze(1)?.maximum(self.log_scale_min)?;
        let log_prob = gaussian_log_prob(waveform, &mean, &log_scale)?;
        Ok(TeacherDensity { log_prob, mean, log_scale })
    }
}
