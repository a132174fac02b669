//! Distillation loss: KL(student ‖ teacher) + moment regularization +
//! STFT-magnitude distance to the reference waveform.

use std::f64::consts::PI;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use parawave_core::{FlowOutput, TeacherDensity};

use crate::config::LossConfig;
use crate::error::DistillError;

const MAGNITUDE_EPS: f64 = 1e-10;

/// Metric names as they appear in the log, without the `main/` prefix.
pub const METRIC_NAMES: [&str; 4] = ["loss", "kl_divergence", "regularization", "spectrogram_frame_loss"];

/// Differentiable scalar terms of one forward pass.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub total: Tensor,
    pub kl_divergence: Tensor,
    pub regularization: Tensor,
    pub spectrogram_frame_loss: Tensor,
    pub moments: MomentSums,
}

impl LossTerms {
    pub fn values(&self) -> Result<LossValues> {
        let read = |t: &Tensor| -> Result<f64> { Ok(t.to_scalar::<f32>()? as f64) };
        Ok(LossValues {
            loss: read(&self.total)?,
            kl_divergence: read(&self.kl_divergence)?,
            regularization: read(&self.regularization)?,
            spectrogram_frame_loss: read(&self.spectrogram_frame_loss)?,
        })
    }
}

/// Sums behind the moment penalty over one batch or shard. `x` and `x_sq`
/// keep their graph; the teacher sums are detached.
#[derive(Debug, Clone)]
pub struct MomentSums {
    pub x: Tensor,
    pub x_sq: Tensor,
    pub mean: Tensor,
    pub second: Tensor,
    pub count: usize,
}

impl MomentSums {
    pub fn new(x: &Tensor, teacher: &TeacherDensity) -> Result<Self> {
        let mu = teacher.mean.detach();
        let second = (teacher.log_scale.detach().affine(2.0, 0.0)?.exp()? + mu.sqr()?)?;
        Ok(Self {
            x: x.sum_all()?,
            x_sq: x.sqr()?.sum_all()?,
            mean: mu.sum_all()?,
            second: second.sum_all()?,
            count: x.elem_count(),
        })
    }

    pub fn totals(&self) -> Result<MomentTotals> {
        let read = |t: &Tensor| -> Result<f64> { Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?) };
        Ok(MomentTotals {
            x: read(&self.x)?,
            x_sq: read(&self.x_sq)?,
            mean: read(&self.mean)?,
            second: read(&self.second)?,
            count: self.count as f64,
        })
    }
}

/// Host-side [`MomentSums`]; shard totals add up to the batch totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MomentTotals {
    pub x: f64,
    pub x_sq: f64,
    pub mean: f64,
    pub second: f64,
    pub count: f64,
}

impl MomentTotals {
    pub fn merge(parts: impl IntoIterator<Item = MomentTotals>) -> Self {
        parts.into_iter().fold(Self::default(), |acc, p| Self {
            x: acc.x + p.x,
            x_sq: acc.x_sq + p.x_sq,
            mean: acc.mean + p.mean,
            second: acc.second + p.second,
            count: acc.count + p.count,
        })
    }

    /// `(mean, variance, target mean, target variance)`.
    fn moments(&self) -> (f64, f64, f64, f64) {
        let n = self.count.max(1.0);
        let m = self.x / n;
        let tm = self.mean / n;
        (m, self.x_sq / n - m * m, tm, self.second / n - tm * tm)
    }

    /// Same value as [`regularization`] over the pooled samples.
    pub fn penalty(&self) -> f64 {
        let (m, v, tm, tv) = self.moments();
        (m - tm).powi(2) + (v - tv).powi(2)
    }

    /// `(a, b)` such that `∂penalty/∂x_i = (a + 2b·x_i) / count`.
    pub fn gradient_coefficients(&self) -> (f64, f64) {
        let (m, v, tm, tv) = self.moments();
        let b = 2.0 * (v - tv);
        (2.0 * (m - tm) - 2.0 * b * m, b)
    }
}

/// Host-side copy of the loss terms, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub loss: f64,
    pub kl_divergence: f64,
    pub regularization: f64,
    pub spectrogram_frame_loss: f64,
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }

    /// `(prefix/name, value)` pairs, e.g. `("main/loss", 1.2)`.
    pub fn named(&self, prefix: &str) -> [(String, f64); 4] {
        let v = [self.loss, self.kl_divergence, self.regularization, self.spectrogram_frame_loss];
        let mut out: [(String, f64); 4] = Default::default();
        for (slot, (name, value)) in out.iter_mut().zip(METRIC_NAMES.iter().zip(v)) {
            *slot = (format!("{prefix}/{name}"), value);
        }
        out
    }

    /// Weighted average; weights need not be normalised.
    pub fn weighted_mean(parts: &[(LossValues, f64)]) -> LossValues {
        let total: f64 = parts.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return LossValues::default();
        }
        parts.iter().fold(LossValues::default(), |acc, (v, w)| {
            let f = w / total;
            LossValues {
                loss: acc.loss + v.loss * f,
                kl_divergence: acc.kl_divergence + v.kl_divergence * f,
                regularization: acc.regularization + v.regularization * f,
                spectrogram_frame_loss: acc.spectrogram_frame_loss + v.spectrogram_frame_loss * f,
            }
        })
    }
}

pub struct DistillationObjective {
    cfg: LossConfig,
    n_bins: usize,
    /// Hann-windowed DFT basis, `[n_fft, n_bins]` row-major.
    cos_basis: Vec<f32>,
    sin_basis: Vec<f32>,
}

impl DistillationObjective {
    pub fn new(cfg: &LossConfig) -> Result<Self, DistillError> {
        if cfg.hop_length == 0 || cfg.n_fft % cfg.hop_length != 0 {
            return Err(DistillError::config(
                "distill.loss.n_fft",
                format!("{} must be a positive multiple of hop_length {}", cfg.n_fft, cfg.hop_length),
            ));
        }
        let n = cfg.n_fft;
        let n_bins = n / 2 + 1;
        let mut cos_basis = Vec::with_capacity(n * n_bins);
        let mut sin_basis = Vec::with_capacity(n * n_bins);
        for t in 0..n {
            let w = 0.5 * (1.0 - (2.0 * PI * t as f64 / n as f64).cos());
            for k in 0..n_bins {
                let phase = 2.0 * PI * (t * k % n) as f64 / n as f64;
                cos_basis.push((w * phase.cos()) as f32);
                sin_basis.push((-w * phase.sin()) as f32);
            }
        }
        Ok(Self { cfg: cfg.clone(), n_bins, cos_basis, sin_basis })
    }

    pub fn config(&self) -> &LossConfig {
        &self.cfg
    }

    /// Combine one forward pass into the weighted total.
    pub fn compute(
        &self,
        student: &FlowOutput,
        teacher: &TeacherDensity,
        reference: &Tensor,
    ) -> Result<LossTerms> {
        let kl = kl_divergence(&student.log_density, &teacher.log_prob)?;
        let reg = regularization(&student.waveform, teacher)?;
        let spec = self.spectral(&student.waveform, reference)?;
        let moments = MomentSums::new(&student.waveform, teacher)?;

        let total = self.weighted(&kl, &reg, &spec)?;
        Ok(LossTerms { total, kl_divergence: kl, regularization: reg, spectrogram_frame_loss: spec, moments })
    }

    fn weighted(&self, kl: &Tensor, reg: &Tensor, spec: &Tensor) -> Result<Tensor> {
        Ok(((kl.affine(self.cfg.kl_weight, 0.0)? + reg.affine(self.cfg.regularization_weight, 0.0)?)?
            + spec.affine(self.cfg.spectral_weight, 0.0)?)?)
    }

    /// Differentiable total for one shard of a sharded batch.
    ///
    /// KL and spectral terms are per-sample means, so shard gradients averaged
    /// by shard size already give the full-batch gradient. The moment penalty
    /// is not: it is replaced by a term linear in the shard's own sums, with
    /// coefficients taken from the `pooled` batch moments, whose size-weighted
    /// gradient is exactly the full-batch penalty's gradient.
    pub fn shard_total(&self, terms: &LossTerms, pooled: &MomentTotals) -> Result<Tensor> {
        let n = terms.moments.count.max(1) as f64;
        let (a, b) = pooled.gradient_coefficients();
        let reg = (terms.moments.x.affine(a / n, 0.0)? + terms.moments.x_sq.affine(b / n, 0.0)?)?;
        self.weighted(&terms.kl_divergence, &reg, &terms.spectrogram_frame_loss)
    }

    /// Reported values of a sharded step: size-weighted means of the
    /// per-sample terms, the moment penalty of the pooled batch.
    pub fn pooled_values(&self, parts: &[(LossValues, f64)], pooled: &MomentTotals) -> LossValues {
        let mut v = LossValues::weighted_mean(parts);
        v.regularization = pooled.penalty();
        v.loss = self.cfg.kl_weight * v.kl_divergence
            + self.cfg.regularization_weight * v.regularization
            + self.cfg.spectral_weight * v.spectrogram_frame_loss;
        v
    }

    /// Mean absolute difference of STFT magnitudes.
    pub fn spectral(&self, x: &Tensor, reference: &Tensor) -> Result<Tensor> {
        let a = self.magnitude(x)?;
        let b = self.magnitude(&reference.detach())?;
        Ok((a - b)?.abs()?.mean_all()?)
    }

    /// `[batch, T]` → `[batch, frames, n_fft/2 + 1]`, frames without padding.
    pub fn magnitude(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t) = x.dims2()?;
        let hop = self.cfg.hop_length;
        let per_frame = self.cfg.n_fft / hop;
        let n_chunks = t / hop;
        if n_chunks < per_frame {
            return Err(DistillError::config(
                "distill.loss.n_fft",
                format!("waveform of {t} samples is shorter than one {}-sample frame", self.cfg.n_fft),
            )
            .into());
        }
        let n_frames = n_chunks - per_frame + 1;
        let chunks = x.narrow(1, 0, n_chunks * hop)?.reshape((b, n_chunks, hop))?;
        let parts = (0..per_frame)
            .map(|j| chunks.narrow(1, j, n_frames))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let frames = Tensor::cat(&parts, 2)?;

        let (cos, sin) = self.basis(x.device())?;
        let re = frames.broadcast_matmul(&cos)?;
        let im = frames.broadcast_matmul(&sin)?;
        Ok(((re.sqr()? + im.sqr()?)? + MAGNITUDE_EPS)?.sqrt()?)
    }

    fn basis(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.cfg.n_fft, self.n_bins);
        Ok((
            Tensor::from_slice(&self.cos_basis, shape, device)?,
            Tensor::from_slice(&self.sin_basis, shape, device)?,
        ))
    }
}

/// Monte-Carlo KL estimate: mean of `log q(x) − log p(x)` over all samples.
pub fn kl_divergence(log_q: &Tensor, log_p: &Tensor) -> Result<Tensor> {
    Ok((log_q - log_p)?.mean_all()?)
}

/// Squared gap between the batch's mean/variance and the teacher's expected
/// mean/variance. Teacher moments are targets and carry no gradient.
pub fn regularization(x: &Tensor, teacher: &TeacherDensity) -> Result<Tensor> {
    let mean_x = x.mean_all()?;
    let var_x = x.broadcast_sub(&mean_x)?.sqr()?.mean_all()?;

    let mu = teacher.mean.detach();
    let second = (teacher.log_scale.detach().affine(2.0, 0.0)?.exp()? + mu.sqr()?)?;
    let target_mean = mu.mean_all()?;
    let target_var = (second.mean_all()? - target_mean.sqr()?)?;

    Ok(((mean_x - target_mean)?.sqr()? + (var_x - target_var)?.sqr()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Var};
    use parawave_core::model::{gaussian_log_prob, standard_normal_log_prob};

    fn small_loss() -> LossConfig {
        LossConfig { n_fft: 16, hop_length: 4, ..Default::default() }
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * (1.0 + b.abs())
    }

    #[test]
    fn test_identity_student_matches_standard_teacher() {
        // Student x = z with log q = log N(z); teacher N(0, 1): KL estimate is 0.
        let dev = Device::Cpu;
        let z = Tensor::randn(0f32, 1., (2, 64), &dev).unwrap();
        let student = FlowOutput { waveform: z.clone(), log_density: standard_normal_log_prob(&z).unwrap() };
        let zeros = z.zeros_like().unwrap();
        let teacher = TeacherDensity {
            log_prob: gaussian_log_prob(&z, &zeros, &zeros).unwrap(),
            mean: zeros.clone(),
            log_scale: zeros,
        };
        let kl = kl_divergence(&student.log_density, &teacher.log_prob).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_regularization_zero_when_moments_match() {
        let dev = Device::Cpu;
        // mean 0, variance 1 over the batch; teacher predicts N(0, 1) everywhere.
        let x = Tensor::new(&[[1f32, -1., 1., -1.]], &dev).unwrap();
        let zeros = x.zeros_like().unwrap();
        let teacher = TeacherDensity { log_prob: zeros.clone(), mean: zeros.clone(), log_scale: zeros };
        let r = regularization(&x, &teacher).unwrap().to_scalar::<f32>().unwrap();
        assert!(r.abs() < 1e-6);
    }

    #[test]
    fn test_regularization_uses_total_variance() {
        let dev = Device::Cpu;
        // Teacher means alternate ±1 with unit scale: expected variance is 2.
        let mean = Tensor::new(&[[1f32, -1., 1., -1.]], &dev).unwrap();
        let log_scale = mean.zeros_like().unwrap();
        let teacher = TeacherDensity { log_prob: log_scale.clone(), mean, log_scale };
        let x = Tensor::new(&[[0f32, 0., 0., 0.]], &dev).unwrap();
        let r = regularization(&x, &teacher).unwrap().to_scalar::<f32>().unwrap();
        assert!((r - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_teacher_moments_carry_no_gradient() {
        let dev = Device::Cpu;
        let mean = Var::from_tensor(&Tensor::new(&[[0.5f32, 0.2]], &dev).unwrap()).unwrap();
        let log_scale = Tensor::zeros((1, 2), DType::F32, &dev).unwrap();
        let teacher = TeacherDensity { log_prob: log_scale.clone(), mean: mean.as_tensor().clone(), log_scale };
        let x = Var::from_tensor(&Tensor::new(&[[1f32, -3.]], &dev).unwrap()).unwrap();
        let grads = regularization(x.as_tensor(), &teacher).unwrap().backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
        assert!(grads.get(mean.as_tensor()).is_none());
    }

    #[test]
    fn test_pooled_shard_moments_match_full_batch() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0.3f32, 1.5, (5, 12), &dev).unwrap();
        let mean = Tensor::randn(0f32, 0.5, (5, 12), &dev).unwrap();
        let log_scale = Tensor::randn(0f32, 0.2, (5, 12), &dev).unwrap();
        let teacher = |r: std::ops::Range<usize>| TeacherDensity {
            log_prob: mean.narrow(0, r.start, r.len()).unwrap(),
            mean: mean.narrow(0, r.start, r.len()).unwrap(),
            log_scale: log_scale.narrow(0, r.start, r.len()).unwrap(),
        };
        let full = regularization(&x, &teacher(0..5)).unwrap().to_scalar::<f32>().unwrap() as f64;
        let pooled = MomentTotals::merge([0..3, 3..5].map(|r| {
            MomentSums::new(&x.narrow(0, r.start, r.len()).unwrap(), &teacher(r)).unwrap().totals().unwrap()
        }));
        assert_eq!(pooled.count, 60.0);
        assert!(close(pooled.penalty(), full, 1e-4), "{} vs {full}", pooled.penalty());
    }

    #[test]
    fn test_shard_totals_reproduce_full_batch_gradient() {
        // Uneven shards 3 + 2, combined with weights 3/5 and 2/5.
        let cfg = LossConfig { kl_weight: 0.0, regularization_weight: 1.0, spectral_weight: 0.0, ..small_loss() };
        let obj = DistillationObjective::new(&cfg).unwrap();
        let dev = Device::Cpu;
        let data = Tensor::randn(0.2f32, 1.3, (5, 16), &dev).unwrap();
        let mean = Tensor::randn(0f32, 0.5, (5, 16), &dev).unwrap();
        let log_scale = Tensor::zeros((5, 16), DType::F32, &dev).unwrap();
        let reference = Tensor::zeros((5, 16), DType::F32, &dev).unwrap();
        let terms_for = |x: &Tensor, r: std::ops::Range<usize>| {
            let student = FlowOutput { waveform: x.clone(), log_density: x.zeros_like().unwrap() };
            let teacher = TeacherDensity {
                log_prob: x.zeros_like().unwrap(),
                mean: mean.narrow(0, r.start, r.len()).unwrap(),
                log_scale: log_scale.narrow(0, r.start, r.len()).unwrap(),
            };
            obj.compute(&student, &teacher, &reference.narrow(0, r.start, r.len()).unwrap()).unwrap()
        };

        let full = Var::from_tensor(&data).unwrap();
        let full_terms = terms_for(full.as_tensor(), 0..5);
        let full_grads = full_terms.total.backward().unwrap();
        let expected: Vec<f32> = full_grads.get(full.as_tensor()).unwrap().flatten_all().unwrap().to_vec1().unwrap();

        let shards: Vec<(Var, std::ops::Range<usize>)> = [0..3, 3..5]
            .into_iter()
            .map(|r| (Var::from_tensor(&data.narrow(0, r.start, r.len()).unwrap()).unwrap(), r))
            .collect();
        let terms: Vec<LossTerms> = shards.iter().map(|(v, r)| terms_for(v.as_tensor(), r.clone())).collect();
        let pooled = MomentTotals::merge(terms.iter().map(|t| t.moments.totals().unwrap()));
        assert!(close(pooled.penalty(), full_terms.values().unwrap().regularization, 1e-4));

        let mut got = Vec::new();
        for ((var, r), t) in shards.iter().zip(&terms) {
            let w = r.len() as f64 / 5.0;
            let g = obj.shard_total(t, &pooled).unwrap().backward().unwrap();
            let g: Vec<f32> = (g.get(var.as_tensor()).unwrap() * w).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            got.extend(g);
        }
        let scale = expected.iter().fold(0f32, |m, g| m.max(g.abs()));
        for (a, b) in got.iter().zip(&expected) {
            assert!((a - b).abs() <= 1e-4 * scale.max(1e-6), "{a} vs {b}");
        }
    }

    #[test]
    fn test_pooled_values_recompute_total() {
        let cfg = LossConfig { kl_weight: 1.0, regularization_weight: 2.0, spectral_weight: 0.5, ..small_loss() };
        let obj = DistillationObjective::new(&cfg).unwrap();
        let a = LossValues { loss: 0.0, kl_divergence: 1.0, regularization: 9.0, spectrogram_frame_loss: 2.0 };
        let b = LossValues { loss: 0.0, kl_divergence: 3.0, regularization: 9.0, spectrogram_frame_loss: 4.0 };
        // Pooled x = [1, -1], teacher N(0, 1): penalty 0.
        let pooled = MomentTotals { x: 0.0, x_sq: 2.0, mean: 0.0, second: 2.0, count: 2.0 };
        let v = obj.pooled_values(&[(a, 1.0), (b, 1.0)], &pooled);
        assert!(close(v.kl_divergence, 2.0, 1e-12));
        assert!(v.regularization.abs() < 1e-12);
        assert!(close(v.loss, 2.0 + 0.5 * 3.0, 1e-12));
    }

    #[test]
    fn test_spectral_zero_for_identical_and_positive_otherwise() {
        let obj = DistillationObjective::new(&small_loss()).unwrap();
        let dev = Device::Cpu;
        let a = Tensor::randn(0f32, 1., (2, 32), &dev).unwrap();
        let b = Tensor::randn(0f32, 1., (2, 32), &dev).unwrap();
        let same = obj.spectral(&a, &a).unwrap().to_scalar::<f32>().unwrap();
        let diff = obj.spectral(&a, &b).unwrap().to_scalar::<f32>().unwrap();
        assert!(same.abs() < 1e-6);
        assert!(diff > 0.0);
        assert_eq!(obj.magnitude(&a).unwrap().dims(), &[2, 5, 9]);
    }

    #[test]
    fn test_magnitude_of_constant_is_dc_only() {
        let obj = DistillationObjective::new(&small_loss()).unwrap();
        let x = Tensor::ones((1, 16), DType::F32, &Device::Cpu).unwrap();
        let mag: Vec<f32> = obj.magnitude(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // Sum of a periodic 16-point Hann window is 8.
        assert!((mag[0] - 8.0).abs() < 1e-4);
        assert!(mag[2..].iter().all(|m| m.abs() < 1e-3));
    }

    #[test]
    fn test_total_is_weighted_sum() {
        let cfg = LossConfig { kl_weight: 2.0, regularization_weight: 0.0, spectral_weight: 0.5, ..small_loss() };
        let obj = DistillationObjective::new(&cfg).unwrap();
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1., (2, 32), &dev).unwrap();
        let reference = Tensor::randn(0f32, 1., (2, 32), &dev).unwrap();
        let zeros = x.zeros_like().unwrap();
        let student = FlowOutput { waveform: x.clone(), log_density: standard_normal_log_prob(&x).unwrap() };
        let teacher = TeacherDensity {
            log_prob: gaussian_log_prob(&x, &zeros, &zeros.affine(1.0, 0.3).unwrap()).unwrap(),
            mean: zeros.clone(),
            log_scale: zeros.affine(1.0, 0.3).unwrap(),
        };
        let v = obj.compute(&student, &teacher, &reference).unwrap().values().unwrap();
        assert!(close(v.loss, 2.0 * v.kl_divergence + 0.5 * v.spectrogram_frame_loss, 1e-5));
    }

    #[test]
    fn test_short_waveform_rejected() {
        let obj = DistillationObjective::new(&small_loss()).unwrap();
        let x = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(obj.magnitude(&x).is_err());
    }

    #[test]
    fn test_weighted_mean_and_names() {
        let a = LossValues { loss: 1.0, ..Default::default() };
        let b = LossValues { loss: 4.0, ..Default::default() };
        let m = LossValues::weighted_mean(&[(a, 2.0), (b, 1.0)]);
        assert!(close(m.loss, 2.0, 1e-12));
        assert_eq!(m.named("validation/main")[0].0, "validation/main/loss");
    }
}
