//! One training step on one device, or sharded across several.
//!
//! Each device holds a full [`Replica`]: its own student variables plus
//! read-only copies of the frozen encoder and teacher. The main replica
//! (index 0) owns the optimizer; the others are overwritten from it after
//! every update.

use std::ops::Range;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use tracing::{debug, trace};

use parawave_core::{
    device_name, ConditioningEncoder, StudentConfig, StudentFlow, TeacherOracle, TrainableParameterSet,
};

use crate::dataset::Batch;
use crate::error::DistillError;
use crate::objective::{DistillationObjective, LossTerms, LossValues, MomentTotals};
use crate::policy::{Gradients, ParameterUpdatePolicy};
use crate::student::TrainableStudent;
use crate::teacher::FrozenTeacher;

pub struct Replica {
    device: Device,
    params: TrainableParameterSet,
    encoder: Arc<dyn ConditioningEncoder>,
    teacher: Arc<dyn TeacherOracle>,
    student: Arc<dyn StudentFlow>,
}

impl Replica {
    pub fn new(
        params: TrainableParameterSet,
        encoder: Arc<dyn ConditioningEncoder>,
        teacher: Arc<dyn TeacherOracle>,
        student: Arc<dyn StudentFlow>,
    ) -> Self {
        Self { device: params.device().clone(), params, encoder, teacher, student }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn params(&self) -> &TrainableParameterSet {
        &self.params
    }

    /// features → conditioning → student → teacher → loss.
    pub fn forward(&self, objective: &DistillationObjective, batch: &Batch, noise: &Tensor) -> Result<LossTerms> {
        let features = batch.features.to_device(&self.device)?;
        let reference = batch.waveform.to_device(&self.device)?;
        let noise = noise.to_device(&self.device)?;

        let condition = self.encoder.encode(&features)?;
        let t = noise.dim(1)?;
        anyhow::ensure!(
            condition.dim(2)? >= t,
            "conditioning covers {} samples, waveform has {t}",
            condition.dim(2)?
        );
        let condition = condition.narrow(2, 0, t)?;

        let generated = self.student.generate(&noise, &condition)?;
        let density = self.teacher.log_likelihood(&generated.waveform, &condition)?;
        objective.compute(&generated, &density, &reference)
    }

    /// Backward through this replica's shard of a sharded step; gradients
    /// stay on this replica's device.
    pub fn shard_gradients(
        &self,
        objective: &DistillationObjective,
        terms: &LossTerms,
        pooled: &MomentTotals,
    ) -> Result<Gradients> {
        let store = objective.shard_total(terms, pooled)?.backward()?;
        Gradients::from_store(&store, &self.params.named_vars()?)
    }
}

/// Builds a complete replica on a given device.
pub trait ReplicaFactory {
    fn build(&self, device: &Device) -> Result<Replica>;
}

/// Frozen [`FrozenTeacher`] weights + a fresh Gaussian IAF student.
pub struct WaveNetReplicaFactory {
    teacher: FrozenTeacher,
    student: StudentConfig,
}

impl WaveNetReplicaFactory {
    pub fn new(teacher: FrozenTeacher, student: StudentConfig) -> Self {
        Self { teacher, student }
    }

    pub fn teacher(&self) -> &FrozenTeacher {
        &self.teacher
    }
}

impl ReplicaFactory for WaveNetReplicaFactory {
    fn build(&self, device: &Device) -> Result<Replica> {
        let (encoder, teacher) = self.teacher.build(device)?;
        let student = TrainableStudent::build(&self.student, device)?;
        Ok(Replica::new(student.params, Arc::new(encoder), Arc::new(teacher), student.flow))
    }
}

/// Contiguous shards of `0..batch` for `n` devices; the first `batch % n`
/// shards get one extra item. Trailing shards are empty when `batch < n`.
pub fn shard_ranges(batch: usize, n: usize) -> Vec<Range<usize>> {
    let n = n.max(1);
    let (base, extra) = (batch / n, batch % n);
    let mut start = 0;
    (0..n)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let r = start..start + len;
            start += len;
            r
        })
        .collect()
}

pub struct DeviceDispatcher {
    replicas: Vec<Replica>,
    objective: DistillationObjective,
}

impl DeviceDispatcher {
    /// Takes ownership of already-built replicas; replica 0 is the main one.
    pub fn new(replicas: Vec<Replica>, objective: DistillationObjective) -> Result<Self> {
        anyhow::ensure!(!replicas.is_empty(), "at least one device is required");
        let this = Self { replicas, objective };
        this.broadcast()?;
        Ok(this)
    }

    /// Build one replica per device and seed the main replica's variables.
    pub fn build(
        factory: &dyn ReplicaFactory,
        devices: &[Device],
        objective: DistillationObjective,
        seed: u64,
    ) -> Result<Self> {
        let replicas = devices
            .iter()
            .map(|d| factory.build(d).with_context(|| format!("Failed to build replica on {}", device_name(d))))
            .collect::<Result<Vec<_>>>()?;
        if let Some(main) = replicas.first() {
            main.params.initialize(seed)?;
        }
        Self::new(replicas, objective)
    }

    pub fn device_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn main(&self) -> &Replica {
        &self.replicas[0]
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn objective(&self) -> &DistillationObjective {
        &self.objective
    }

    /// Copy the main replica's variables to every other replica.
    pub fn broadcast(&self) -> Result<()> {
        let (main, rest) = self.replicas.split_first().context("no replicas")?;
        for replica in rest {
            replica.params.copy_from(&main.params)?;
        }
        Ok(())
    }

    /// One synchronous update. Nothing is modified unless the loss is finite.
    pub fn train_step(
        &self,
        batch: &Batch,
        noise: &Tensor,
        policy: &mut ParameterUpdatePolicy,
        iteration: u64,
    ) -> Result<LossValues> {
        if self.replicas.len() == 1 {
            let terms = self.main().forward(&self.objective, batch, noise)?;
            let values = terms.values()?;
            if !values.is_finite() {
                return Err(DistillError::NonFiniteLoss { iteration, value: values.loss }.into());
            }
            let norm = policy.step(&terms.total)?;
            trace!(iteration, grad_norm = norm, "Update applied");
            return Ok(values);
        }

        let total = batch.len();
        let shards: Vec<Range<usize>> =
            shard_ranges(total, self.replicas.len()).into_iter().filter(|r| !r.is_empty()).collect();
        let active = &self.replicas[..shards.len()];

        // Forward on every shard; the moment penalty needs the pooled batch
        // sums before any backward pass.
        let forwards: Vec<Result<LossTerms>> = thread::scope(|s| {
            let handles: Vec<_> = active
                .iter()
                .zip(&shards)
                .map(|(replica, range)| {
                    s.spawn(move || {
                        let shard = batch.narrow(range.clone())?;
                        let shard_noise = noise.narrow(0, range.start, range.len())?;
                        replica.forward(&self.objective, &shard, &shard_noise)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow::anyhow!("replica thread panicked"))?)
                .collect()
        });
        let terms = forwards.into_iter().collect::<Result<Vec<_>>>()?;

        let weights: Vec<f64> = shards.iter().map(|r| r.len() as f64 / total as f64).collect();
        let mut losses = Vec::with_capacity(terms.len());
        let mut totals = Vec::with_capacity(terms.len());
        for (t, &w) in terms.iter().zip(&weights) {
            losses.push((t.values()?, w));
            totals.push(t.moments.totals()?);
        }
        let pooled = MomentTotals::merge(totals);
        let values = self.objective.pooled_values(&losses, &pooled);
        if !values.is_finite() {
            return Err(DistillError::NonFiniteLoss { iteration, value: values.loss }.into());
        }

        let backwards: Vec<Result<Gradients>> = thread::scope(|s| {
            let handles: Vec<_> = active
                .iter()
                .zip(&terms)
                .map(|(replica, t)| s.spawn(move || replica.shard_gradients(&self.objective, t, &pooled)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| anyhow::anyhow!("replica thread panicked"))?)
                .collect()
        });
        let grads = backwards
            .into_iter()
            .zip(weights)
            .map(|(g, w)| Ok((g?, w)))
            .collect::<Result<Vec<_>>>()?;

        let combined = Gradients::weighted_sum(&grads, self.main().device())?;
        let norm = policy.apply(combined)?;
        self.broadcast()?;
        debug!(iteration, shards = grads.len(), grad_norm = norm, "Sharded update applied");
        Ok(values)
    }

    /// Loss on the main replica only; no backward, no update.
    pub fn evaluate_batch(&self, batch: &Batch, noise: &Tensor) -> Result<LossValues> {
        self.main().forward(&self.objective, batch, noise)?.values()
    }
}
