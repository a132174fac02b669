//! Gradient clipping plus Adam over the student's variables only.
//!
//! The policy never sees the frozen encoder/teacher tensors: it is handed a
//! [`TrainableParameterSet`] and nothing else.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parawave_core::TrainableParameterSet;

use crate::config::OptimConfig;
use crate::error::DistillError;

/// Per-variable gradients in the parameter set's (sorted) order.
#[derive(Debug, Clone)]
pub struct Gradients {
    tensors: Vec<Tensor>,
}

impl Gradients {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// Pull gradients for `vars` out of a backward pass. Variables the loss
    /// does not depend on get zeros.
    pub fn from_store(store: &GradStore, vars: &[(String, Var)]) -> Result<Self> {
        let tensors = vars
            .iter()
            .map(|(_, var)| match store.get(var.as_tensor()) {
                Some(g) => Ok(g.clone()),
                None => Ok(var.as_tensor().zeros_like()?),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tensors })
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Global L2 norm over every element.
    pub fn global_norm(&self) -> Result<f64> {
        let mut sq = 0f64;
        for g in &self.tensors {
            sq += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
        Ok(sq.sqrt())
    }

    pub fn scale(&self, factor: f64) -> Result<Self> {
        let tensors = self.tensors.iter().map(|g| g.affine(factor, 0.0)).collect::<candle_core::Result<_>>()?;
        Ok(Self { tensors })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let tensors = self.tensors.iter().map(|g| g.to_device(device)).collect::<candle_core::Result<_>>()?;
        Ok(Self { tensors })
    }

    /// `Σ w_i · g_i` on `device`. Weights are used as given.
    pub fn weighted_sum(parts: &[(Gradients, f64)], device: &Device) -> Result<Self> {
        let (first, rest) = parts.split_first().context("no gradients to combine")?;
        let mut acc = first.0.to_device(device)?.scale(first.1)?;
        for (g, w) in rest {
            anyhow::ensure!(g.len() == acc.len(), "gradient sets differ in length");
            let g = g.to_device(device)?;
            for (a, b) in acc.tensors.iter_mut().zip(&g.tensors) {
                *a = (&*a + b.affine(*w, 0.0)?)?;
            }
        }
        Ok(acc)
    }
}

/// Rescale `grads` so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f64) -> Result<f64> {
    let norm = grads.global_norm()?;
    let rate = max_norm / (norm + 1e-6);
    if rate < 1.0 {
        *grads = grads.scale(rate)?;
    }
    Ok(norm)
}

/// Named, annealable Adam hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub alpha: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Hyperparameters {
    pub const NAMES: [&'static str; 4] = ["alpha", "beta1", "beta2", "eps"];

    pub fn get(&self, name: &str) -> Result<f64, DistillError> {
        match name {
            "alpha" => Ok(self.alpha),
            "beta1" => Ok(self.beta1),
            "beta2" => Ok(self.beta2),
            "eps" => Ok(self.eps),
            other => Err(DistillError::UnknownHyperparameter(other.to_string())),
        }
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<(), DistillError> {
        let slot = match name {
            "alpha" => &mut self.alpha,
            "beta1" => &mut self.beta1,
            "beta2" => &mut self.beta2,
            "eps" => &mut self.eps,
            other => return Err(DistillError::UnknownHyperparameter(other.to_string())),
        };
        *slot = value;
        Ok(())
    }
}

/// Moments, step count and hyper-parameters: everything needed to resume.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: u64,
    pub hyper: Hyperparameters,
    /// `(name, first moment, second moment)` in parameter order.
    pub moments: Vec<(String, Tensor, Tensor)>,
}

struct Slots {
    params: TrainableParameterSet,
    vars: Vec<(String, Var)>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

pub struct ParameterUpdatePolicy {
    hyper: Hyperparameters,
    grad_clip: f64,
    step: u64,
    slots: Option<Slots>,
}

impl ParameterUpdatePolicy {
    /// `alpha = lr / device_count`.
    pub fn new(cfg: &OptimConfig, device_count: usize) -> Self {
        Self {
            hyper: Hyperparameters {
                alpha: cfg.lr / device_count.max(1) as f64,
                beta1: cfg.beta1,
                beta2: cfg.beta2,
                eps: cfg.eps,
            },
            grad_clip: cfg.grad_clip,
            step: 0,
            slots: None,
        }
    }

    /// Attach to the variables this policy is allowed to update.
    pub fn setup(&mut self, params: &TrainableParameterSet) -> Result<()> {
        let vars = params.named_vars()?;
        let m = vars.iter().map(|(_, v)| v.as_tensor().zeros_like()).collect::<candle_core::Result<Vec<_>>>()?;
        let v = m.clone();
        debug!(vars = vars.len(), alpha = self.hyper.alpha, "Update policy set up");
        self.slots = Some(Slots { params: params.clone(), vars, m, v });
        Ok(())
    }

    pub fn is_setup(&self) -> bool {
        self.slots.is_some()
    }

    /// Backward through `loss`, then [`apply`](Self::apply).
    pub fn step(&mut self, loss: &Tensor) -> Result<f64> {
        let slots = self.slots.as_ref().ok_or(DistillError::PolicyNotSetup)?;
        let store = loss.backward()?;
        let grads = Gradients::from_store(&store, &slots.vars)?;
        self.apply(grads)
    }

    /// Clip, then one Adam update. Returns the pre-clip gradient norm.
    pub fn apply(&mut self, mut grads: Gradients) -> Result<f64> {
        let slots = self.slots.as_mut().ok_or(DistillError::PolicyNotSetup)?;
        anyhow::ensure!(
            grads.len() == slots.vars.len(),
            "expected {} gradients, got {}",
            slots.vars.len(),
            grads.len()
        );
        let norm = clip_grad_norm(&mut grads, self.grad_clip)?;

        self.step += 1;
        let Hyperparameters { alpha, beta1, beta2, eps } = self.hyper;
        let t = self.step as i32;
        let lr = alpha * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));

        for (i, g) in grads.tensors.iter().enumerate() {
            let (_, var) = &slots.vars[i];
            let g = g.to_device(var.device())?.to_dtype(var.dtype())?;
            let m = (&slots.m[i] + (&g - &slots.m[i])?.affine(1.0 - beta1, 0.0)?)?;
            let v = (&slots.v[i] + (g.sqr()? - &slots.v[i])?.affine(1.0 - beta2, 0.0)?)?;
            let update = (&m / (v.sqrt()? + eps)?)?.affine(lr, 0.0)?;
            var.set(&(var.as_tensor() - update)?)?;
            slots.m[i] = m;
            slots.v[i] = v;
        }
        Ok(norm)
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        self.hyper
    }

    pub fn hyperparameter(&self, name: &str) -> Result<f64, DistillError> {
        self.hyper.get(name)
    }

    /// Multiply a named hyper-parameter by `rate`; returns the new value.
    pub fn anneal(&mut self, name: &str, rate: f64) -> Result<f64, DistillError> {
        let value = self.hyper.get(name)? * rate;
        self.hyper.set(name, value)?;
        Ok(value)
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn params(&self) -> Option<&TrainableParameterSet> {
        self.slots.as_ref().map(|s| &s.params)
    }

    pub fn state(&self) -> Result<OptimizerState> {
        let slots = self.slots.as_ref().ok_or(DistillError::PolicyNotSetup)?;
        let moments = slots
            .vars
            .iter()
            .zip(slots.m.iter().zip(&slots.v))
            .map(|((name, _), (m, v))| (name.clone(), m.clone(), v.clone()))
            .collect();
        Ok(OptimizerState { step: self.step, hyper: self.hyper, moments })
    }

    /// Restore moments by name; every variable must be present.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let slots = self.slots.as_mut().ok_or(DistillError::PolicyNotSetup)?;
        let mut by_name: std::collections::HashMap<String, (Tensor, Tensor)> =
            state.moments.into_iter().map(|(n, m, v)| (n, (m, v))).collect();
        for (i, (name, var)) in slots.vars.iter().enumerate() {
            let (m, v) = by_name
                .remove(name)
                .with_context(|| format!("optimizer state has no moments for '{name}'"))?;
            anyhow::ensure!(m.dims() == var.dims(), "moment shape mismatch for '{name}'");
            slots.m[i] = m.to_device(var.device())?;
            slots.v[i] = v.to_device(var.device())?;
        }
        self.step = state.step;
        self.hyper = state.hyper;
        Ok(())
    }
}
