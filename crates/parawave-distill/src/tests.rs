//! End-to-end properties of the orchestrator on tiny CPU models.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::Init;
use tempfile::TempDir;

use parawave_core::model::{gaussian_log_prob, standard_normal_log_prob};
use parawave_core::{
    ConditioningEncoder, CoreResult, FlowOutput, GaussianWaveNet, StudentConfig, StudentFlow, TeacherConfig,
    TeacherDensity, TeacherOracle, TrainableParameterSet, UpsampleNet, WaveNetConfig,
};

use crate::checkpoint::snapshot_path;
use crate::config::{DistillConfig, LossConfig, OptimConfig};
use crate::controller::{ControllerOptions, TrainingController};
use crate::dataset::tests::ToyDataset;
use crate::dataset::{Batch, Dataset, LoaderConfig};
use crate::dispatcher::{DeviceDispatcher, Replica, WaveNetReplicaFactory};
use crate::error::DistillError;
use crate::noise::{self, Stream};
use crate::objective::{DistillationObjective, LossValues};
use crate::policy::ParameterUpdatePolicy;
use crate::report::{LogRecord, Reporter, RunDirectory, LOG_FILE};
use crate::state::ControllerState;
use crate::teacher::{FrozenTeacher, PretrainedConfig};
use crate::trigger::Trigger;

const N_MELS: usize = 3;
const N_FRAMES: usize = 8;
const HOP: usize = 4;

fn tiny_teacher() -> TeacherConfig {
    TeacherConfig {
        upsample_factors: vec![2, 2],
        wavenet: WaveNetConfig {
            n_loop: 1,
            n_layer: 2,
            filter_size: 2,
            residual_channels: 4,
            dilated_channels: 4,
            skip_channels: 4,
            condition_dim: N_MELS,
        },
        log_scale_min: -7.0,
    }
}

fn tiny_student() -> StudentConfig {
    StudentConfig {
        n_loops: vec![1, 1],
        n_layers: vec![2, 2],
        filter_size: 2,
        residual_channels: 4,
        dilated_channels: 4,
        skip_channels: 4,
        condition_dim: N_MELS,
        log_scale_min: -7.0,
    }
}

fn tiny_config() -> DistillConfig {
    let mut cfg = DistillConfig {
        batch_size: 4,
        seed: 3,
        loss: LossConfig { n_fft: 8, hop_length: 4, ..Default::default() },
        optim: OptimConfig { lr: 1e-3, ..Default::default() },
        ..Default::default()
    };
    cfg.schedule.stop = Trigger::iterations(4);
    cfg.schedule.anneal.trigger = Trigger::iterations(3);
    cfg.schedule.evaluate = Trigger::iterations(2);
    cfg.schedule.report = Trigger::iterations(2);
    cfg.schedule.snapshot = Trigger::iterations(2);
    cfg
}

/// Write a pretrained artifact holding a randomly initialised encoder and teacher.
fn write_pretrained(dir: &Path) -> PretrainedConfig {
    let params = TrainableParameterSet::new(&Device::Cpu);
    let vb = params.var_builder();
    let cfg = tiny_teacher();
    UpsampleNet::new(&cfg.upsample_factors, N_MELS, vb.pp("encoder")).unwrap();
    GaussianWaveNet::new(&cfg, vb.pp("teacher")).unwrap();
    params.initialize(11).unwrap();
    let tensors: HashMap<String, Tensor> = params.snapshot().unwrap().into_iter().collect();
    let path = dir.join("teacher.safetensors");
    candle_core::safetensors::save(&tensors, &path).unwrap();
    PretrainedConfig { path, ..Default::default() }
}

fn factory(dir: &Path) -> WaveNetReplicaFactory {
    let pretrained = write_pretrained(dir);
    let teacher = FrozenTeacher::load(&pretrained, &tiny_teacher()).unwrap();
    WaveNetReplicaFactory::new(teacher, tiny_student())
}

fn dispatcher(factory: &WaveNetReplicaFactory, cfg: &DistillConfig, n_devices: usize) -> DeviceDispatcher {
    let devices = vec![Device::Cpu; n_devices];
    let objective = DistillationObjective::new(&cfg.loss).unwrap();
    DeviceDispatcher::build(factory, &devices, objective, cfg.seed).unwrap()
}

fn toy(len: usize) -> Arc<dyn Dataset> {
    Arc::new(ToyDataset { len, n_mels: N_MELS, n_frames: N_FRAMES, hop: HOP })
}

fn controller(
    factory: &WaveNetReplicaFactory,
    cfg: &DistillConfig,
    n_devices: usize,
    run_dir: Option<&Path>,
    loader: LoaderConfig,
) -> TrainingController {
    let reporter = run_dir.map(|p| Reporter::new(RunDirectory::at(p.to_path_buf()).unwrap()));
    TrainingController::new(
        cfg,
        dispatcher(factory, cfg, n_devices),
        toy(10),
        toy(3),
        ControllerOptions { loader, progress: false },
        reporter,
    )
    .unwrap()
}

fn serial() -> LoaderConfig {
    LoaderConfig { process: 1, prefetch: 1 }
}

fn student_values(ctl: &TrainingController) -> BTreeMap<String, Vec<f32>> {
    ctl.dispatcher()
        .main()
        .params()
        .snapshot()
        .unwrap()
        .into_iter()
        .map(|(k, t)| (k, t.flatten_all().unwrap().to_vec1().unwrap()))
        .collect()
}

fn max_abs_diff(a: &BTreeMap<String, Vec<f32>>, b: &BTreeMap<String, Vec<f32>>) -> f32 {
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    a.iter()
        .flat_map(|(k, va)| va.iter().zip(&b[k]).map(|(x, y)| (x - y).abs()))
        .fold(0.0, f32::max)
}

fn rel_close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * a.abs().max(b.abs()).max(1e-12)
}

fn frozen_values(factory: &WaveNetReplicaFactory) -> Vec<(String, Vec<f32>)> {
    let t = factory.teacher();
    let mut out: Vec<(String, Vec<f32>)> = t
        .encoder_weights()
        .tensors()
        .iter()
        .chain(t.teacher_weights().tensors())
        .map(|(k, v)| (k.clone(), v.flatten_all().unwrap().to_vec1().unwrap()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

// ── Stubs ─────────────────────────────────────────────────────────────────────

/// Zero conditioning at waveform rate.
struct ZeroEncoder;

impl ConditioningEncoder for ZeroEncoder {
    fn encode(&self, features: &Tensor) -> CoreResult<Tensor> {
        let (b, _, f) = features.dims3()?;
        Ok(Tensor::zeros((b, 1, f * HOP), DType::F32, features.device())?)
    }

    fn upsample_factor(&self) -> usize {
        HOP
    }
}

/// `x = z · w` with a single trainable scale `w`.
struct ScaleFlow {
    scale: Tensor,
}

impl StudentFlow for ScaleFlow {
    fn generate(&self, noise: &Tensor, _condition: &Tensor) -> CoreResult<FlowOutput> {
        let waveform = noise.broadcast_mul(&self.scale)?;
        let log_density = standard_normal_log_prob(noise)?.broadcast_sub(&self.scale.abs()?.log()?)?;
        Ok(FlowOutput { waveform, log_density })
    }
}

/// N(0, 1) everywhere, or NaN when `poisoned`.
struct StandardTeacher {
    poisoned: bool,
}

impl TeacherOracle for StandardTeacher {
    fn log_likelihood(&self, waveform: &Tensor, _condition: &Tensor) -> CoreResult<TeacherDensity> {
        let zeros = waveform.zeros_like()?;
        let mut log_prob = gaussian_log_prob(waveform, &zeros, &zeros)?;
        if self.poisoned {
            log_prob = (log_prob * f64::NAN)?;
        }
        Ok(TeacherDensity { log_prob, mean: zeros.clone(), log_scale: zeros })
    }
}

fn stub_dispatcher(poisoned: bool, loss: &LossConfig) -> DeviceDispatcher {
    let params = TrainableParameterSet::new(&Device::Cpu);
    let scale = params.var_builder().get_with_hints(1, "scale", Init::Const(1.0)).unwrap();
    let replica = Replica::new(
        params,
        Arc::new(ZeroEncoder),
        Arc::new(StandardTeacher { poisoned }),
        Arc::new(ScaleFlow { scale }),
    );
    DeviceDispatcher::new(vec![replica], DistillationObjective::new(loss).unwrap()).unwrap()
}

fn toy_batch(len: usize) -> (Batch, Tensor) {
    let ds = toy(len);
    let ex: Vec<_> = (0..len).map(|i| ds.get(i, 0).unwrap()).collect();
    let batch = Batch::collate(&ex).unwrap();
    let noise = noise::gaussian(0, Stream::TrainNoise, 0, batch.len(), batch.samples()).unwrap();
    (batch, noise)
}

// ── Properties ────────────────────────────────────────────────────────────────

#[test]
fn test_frozen_weights_are_bit_identical_after_training() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let before = frozen_values(&f);
    let mut cfg = tiny_config();
    cfg.schedule.stop = Trigger::iterations(3);
    let mut ctl = controller(&f, &cfg, 1, None, serial());
    ctl.run().unwrap();
    assert_eq!(before, frozen_values(&f));

    // The policy only tracks student variables.
    let state = ctl.policy().state().unwrap();
    assert!(state.moments.iter().all(|(name, _, _)| name.starts_with("flows.")));
    assert_eq!(state.moments.len(), ctl.dispatcher().main().params().len());
}

#[test]
fn test_iteration_counts_steps_regardless_of_device_count() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();
    for n in [1, 2, 3] {
        let mut ctl = controller(&f, &cfg, n, None, serial());
        for k in 1..=3u64 {
            ctl.step().unwrap();
            assert_eq!(ctl.training_state().iteration, k, "{n} devices");
        }
    }
}

/// One update from freshly seeded replicas on `n_devices` CPU devices.
fn first_step(
    f: &WaveNetReplicaFactory,
    cfg: &DistillConfig,
    batch_len: usize,
    n_devices: usize,
) -> (LossValues, BTreeMap<String, Vec<f32>>) {
    let ds = toy(batch_len);
    let ex: Vec<_> = (0..batch_len).map(|i| ds.get(i, 1).unwrap()).collect();
    let batch = Batch::collate(&ex).unwrap();
    let noise = noise::gaussian(cfg.seed, Stream::TrainNoise, 0, batch.len(), batch.samples()).unwrap();

    let d = dispatcher(f, cfg, n_devices);
    let mut policy = ParameterUpdatePolicy::new(&cfg.optim, 1);
    policy.setup(d.main().params()).unwrap();
    let values = d.train_step(&batch, &noise, &mut policy, 1).unwrap();
    let params = d
        .main()
        .params()
        .snapshot()
        .unwrap()
        .into_iter()
        .map(|(k, t)| (k, t.flatten_all().unwrap().to_vec1().unwrap()))
        .collect();
    (values, params)
}

fn assert_same_step(one: &(LossValues, BTreeMap<String, Vec<f32>>), many: &(LossValues, BTreeMap<String, Vec<f32>>)) {
    let ((a, pa), (b, pb)) = (one, many);
    assert!(rel_close(a.kl_divergence, b.kl_divergence, 1e-5), "{a:?} vs {b:?}");
    assert!(rel_close(a.spectrogram_frame_loss, b.spectrogram_frame_loss, 1e-5), "{a:?} vs {b:?}");
    assert!(rel_close(a.regularization, b.regularization, 1e-4), "{a:?} vs {b:?}");
    assert!(rel_close(a.loss, b.loss, 1e-5), "{a:?} vs {b:?}");
    assert!(max_abs_diff(pa, pb) < 1e-5);
}

#[test]
fn test_first_step_is_device_count_invariant() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();
    assert!(cfg.loss.regularization_weight > 0.0);
    let one = first_step(&f, &cfg, 4, 1);
    assert!(one.0.regularization > 0.0);
    assert_same_step(&one, &first_step(&f, &cfg, 4, 2));
}

#[test]
fn test_uneven_shards_match_single_device() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();
    // 5 items: shards 3 + 2, then 2 + 2 + 1.
    let one = first_step(&f, &cfg, 5, 1);
    assert_same_step(&one, &first_step(&f, &cfg, 5, 2));
    assert_same_step(&one, &first_step(&f, &cfg, 5, 3));
}

#[test]
fn test_devices_beyond_batch_size_are_skipped() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();
    // 2 items on 4 devices: the last two shards are empty.
    let one = first_step(&f, &cfg, 2, 1);
    assert_same_step(&one, &first_step(&f, &cfg, 2, 4));
}

#[test]
fn test_replicas_hold_identical_parameters_after_each_step() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let mut ctl = controller(&f, &tiny_config(), 2, None, serial());
    ctl.step().unwrap();
    let replicas = ctl.dispatcher().replicas();
    let a = replicas[0].params().snapshot().unwrap();
    let b = replicas[1].params().snapshot().unwrap();
    for (k, ta) in &a {
        let va: Vec<f32> = ta.flatten_all().unwrap().to_vec1().unwrap();
        let vb: Vec<f32> = b[k].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(va, vb, "{k}");
    }
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();

    let run_a = dir.path().join("a");
    let mut a = controller(&f, &cfg, 1, Some(&run_a), serial());
    a.run().unwrap();
    let snapshot = snapshot_path(&run_a, 2);
    assert!(snapshot.is_file());

    let mut b = controller(&f, &cfg, 1, Some(&dir.path().join("b")), LoaderConfig { process: 2, prefetch: 3 });
    b.resume(&snapshot).unwrap();
    assert_eq!(b.training_state().iteration, 2);
    b.run().unwrap();

    assert_eq!(a.training_state(), b.training_state());
    assert_eq!(a.iterator_state(), b.iterator_state());
    assert_eq!(a.policy().hyperparameters(), b.policy().hyperparameters());
    assert_eq!(a.policy().step_count(), b.policy().step_count());
    assert!(max_abs_diff(&student_values(&a), &student_values(&b)) < 1e-6);
}

#[test]
fn test_resumed_run_continues_metrics_log() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let mut cfg = tiny_config();
    cfg.schedule.stop = Trigger::iterations(8);
    cfg.schedule.report = Trigger::iterations(4);
    cfg.schedule.snapshot = Trigger::iterations(2);

    let run_a = dir.path().join("a");
    let mut a = controller(&f, &cfg, 1, Some(&run_a), serial());
    a.run().unwrap();

    // Steps 5 and 6 are observed but not yet logged at this snapshot.
    let run_b = dir.path().join("b");
    let mut b = controller(&f, &cfg, 1, Some(&run_b), serial());
    b.resume(&snapshot_path(&run_a, 6)).unwrap();
    b.run().unwrap();

    let read = |run: &Path| -> Vec<LogRecord> {
        let text = std::fs::read_to_string(run.join(LOG_FILE)).unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    };
    let (log_a, log_b) = (read(&run_a), read(&run_b));
    assert_eq!(log_b.iter().map(|r| r.iteration).collect::<Vec<_>>(), vec![4, 8]);
    for (ra, rb) in log_a.iter().zip(&log_b) {
        assert_eq!((ra.epoch, ra.iteration), (rb.epoch, rb.iteration));
        assert_eq!(ra.metrics.keys().collect::<Vec<_>>(), rb.metrics.keys().collect::<Vec<_>>());
        for (key, va) in &ra.metrics {
            let vb = rb.metrics[key];
            assert!(rel_close(*va, vb, 1e-9), "iteration {}, {key}: {va} vs {vb}", ra.iteration);
        }
    }
    assert!(log_b[1].elapsed_time >= log_b[0].elapsed_time);
    let history = b.reporter().unwrap().history();
    assert_eq!(history.iter().map(|r| r.iteration).collect::<Vec<_>>(), vec![4, 8]);
    assert_eq!(b.last_record().map(|r| r.iteration), Some(8));
}

#[test]
fn test_resume_after_first_step_is_rejected() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let run = dir.path().join("r");
    let mut ctl = controller(&f, &tiny_config(), 1, Some(&run), serial());
    ctl.step().unwrap();
    ctl.step().unwrap();
    let err = ctl.resume(&snapshot_path(&run, 2)).unwrap_err();
    assert!(matches!(err.downcast_ref::<DistillError>(), Some(DistillError::ResumeNotIdle(_))));
}

#[test]
fn test_identity_student_against_matching_teacher_has_zero_kl() {
    let loss = LossConfig { n_fft: 8, hop_length: 4, regularization_weight: 0.0, spectral_weight: 0.0, ..Default::default() };
    let d = stub_dispatcher(false, &loss);
    let (batch, noise) = toy_batch(3);
    let v = d.evaluate_batch(&batch, &noise).unwrap();
    assert!(v.kl_divergence.abs() < 1e-6);
    assert!(v.loss.abs() < 1e-6);
}

#[test]
fn test_non_finite_loss_aborts_before_update() {
    let loss = LossConfig { n_fft: 8, hop_length: 4, ..Default::default() };
    let d = stub_dispatcher(true, &loss);
    let mut policy = ParameterUpdatePolicy::new(&OptimConfig::default(), 1);
    policy.setup(d.main().params()).unwrap();
    let (batch, noise) = toy_batch(2);
    let err = d.train_step(&batch, &noise, &mut policy, 7).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DistillError>(),
        Some(DistillError::NonFiniteLoss { iteration: 7, .. })
    ));
    assert_eq!(policy.step_count(), 0);
    let scale: Vec<f32> = d.main().params().snapshot().unwrap()["scale"].to_vec1().unwrap();
    assert_eq!(scale, vec![1.0]);
}

#[test]
fn test_annealing_halves_alpha_per_trigger() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let mut cfg = tiny_config();
    cfg.schedule.anneal.trigger = Trigger::iterations(1);
    let mut ctl = controller(&f, &cfg, 1, None, serial());
    let alpha0 = ctl.policy().hyperparameters().alpha;
    ctl.step().unwrap();
    assert!(rel_close(ctl.policy().hyperparameters().alpha, alpha0 * 0.5, 1e-12));
    ctl.step().unwrap();
    assert!(rel_close(ctl.policy().hyperparameters().alpha, alpha0 * 0.25, 1e-12));
}

#[test]
fn test_alpha_is_split_across_devices() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let cfg = tiny_config();
    let ctl = controller(&f, &cfg, 2, None, serial());
    assert!(rel_close(ctl.policy().hyperparameters().alpha, cfg.optim.lr / 2.0, 1e-12));
}

#[test]
fn test_evaluation_does_not_change_training_state() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let mut ctl = controller(&f, &tiny_config(), 1, None, serial());
    ctl.step().unwrap();

    let params = student_values(&ctl);
    let training = ctl.training_state().clone();
    let iterator = ctl.iterator_state();
    let steps = ctl.policy().step_count();

    let first = ctl.evaluate().unwrap();
    let second = ctl.evaluate().unwrap();
    assert_eq!(first, second);
    assert_eq!(student_values(&ctl), params);
    assert_eq!(ctl.training_state(), &training);
    assert_eq!(ctl.iterator_state(), iterator);
    assert_eq!(ctl.policy().step_count(), steps);
}

#[test]
fn test_run_writes_log_plots_and_snapshots() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let run = dir.path().join("run");
    let mut ctl = controller(&f, &tiny_config(), 1, Some(&run), serial());
    let summary = ctl.run().unwrap();
    assert_eq!(summary.iterations, 4);
    assert!(!summary.interrupted);
    assert_eq!(ctl.state(), ControllerState::Stopped);

    let text = std::fs::read_to_string(run.join(LOG_FILE)).unwrap();
    let records: Vec<LogRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(records.iter().map(|r| r.iteration).collect::<Vec<_>>(), vec![2, 4]);
    for key in ["main/loss", "main/kl_divergence", "validation/main/loss", "validation/main/spectrogram_frame_loss", "lr"] {
        assert!(records[0].metrics.contains_key(key), "{key}");
    }
    // Alpha was annealed at iteration 3.
    assert!(records[1].metrics["lr"] < records[0].metrics["lr"]);
    assert!(snapshot_path(&run, 2).is_file());
    assert!(snapshot_path(&run, 4).is_file());
    assert!(run.join("loss.svg").is_file());
    assert_eq!(ctl.training_state().record(crate::trigger::Action::Snapshot).fires, 2);
}

#[test]
fn test_stop_request_writes_final_snapshot() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let run = dir.path().join("run");
    let mut cfg = tiny_config();
    cfg.schedule.snapshot = Trigger::iterations(100);
    let mut ctl = controller(&f, &cfg, 1, Some(&run), serial());
    ctl.step().unwrap();
    ctl.stop_handle().store(true, Ordering::SeqCst);
    let summary = ctl.run().unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.iterations, 1);
    assert!(snapshot_path(&run, 1).is_file());
}

#[test]
fn test_epoch_stop_trigger_ends_after_full_passes() {
    let dir = TempDir::new().unwrap();
    let f = factory(dir.path());
    let mut cfg = tiny_config();
    // 10 training examples, batch 4: epoch 1 completes on step 3.
    cfg.schedule.stop = Trigger::epochs(1);
    let mut ctl = controller(&f, &cfg, 1, None, serial());
    let summary = ctl.run().unwrap();
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.epochs, 1);
}
