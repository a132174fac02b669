//! The training loop: pull a batch, update, then run the scheduled actions
//! (anneal → evaluate → log → snapshot) whose triggers fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::checkpoint::{snapshot_path, Checkpoint};
use crate::config::DistillConfig;
use crate::dataset::{BatchLoader, Dataset, EpochIterator, EvalBatches, IteratorState, LoaderConfig};
use crate::dispatcher::DeviceDispatcher;
use crate::error::DistillError;
use crate::noise::{self, Stream};
use crate::objective::LossValues;
use crate::policy::ParameterUpdatePolicy;
use crate::report::{LogRecord, MetricAccumulator, ReportState, Reporter};
use crate::state::{ControllerState, TrainingState};
use crate::trigger::{Action, Trigger, TriggerUnit};

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub loader: LoaderConfig,
    pub progress: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { loader: LoaderConfig::default(), progress: true }
    }
}

/// Summary returned when the loop stops.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iterations: u64,
    pub epochs: u64,
    pub elapsed_secs: f64,
    pub final_loss: Option<LossValues>,
    pub interrupted: bool,
}

pub struct TrainingController {
    config: DistillConfig,
    dispatcher: DeviceDispatcher,
    policy: ParameterUpdatePolicy,
    train: Arc<dyn Dataset>,
    valid: Arc<dyn Dataset>,
    options: ControllerOptions,
    iterator: EpochIterator,
    iterator_state: IteratorState,
    loader: Option<BatchLoader>,
    schedule: Vec<(Trigger, Action)>,
    state: ControllerState,
    training: TrainingState,
    observations: MetricAccumulator,
    last_record: Option<LogRecord>,
    reporter: Option<Reporter>,
    progress: ProgressBar,
    stop: Arc<AtomicBool>,
    started: Instant,
    /// Training time carried over from a resumed snapshot.
    elapsed_before: f64,
}

impl TrainingController {
    pub fn new(
        config: &DistillConfig,
        dispatcher: DeviceDispatcher,
        train: Arc<dyn Dataset>,
        valid: Arc<dyn Dataset>,
        options: ControllerOptions,
        reporter: Option<Reporter>,
    ) -> Result<Self> {
        config.validate()?;
        if train.is_empty() {
            return Err(DistillError::EmptySplit("train").into());
        }
        if valid.is_empty() {
            return Err(DistillError::EmptySplit("validation").into());
        }

        let mut policy = ParameterUpdatePolicy::new(&config.optim, dispatcher.device_count());
        policy.setup(dispatcher.main().params())?;

        let iterator = EpochIterator::new(train.len(), config.batch_size, config.seed)?;
        let s = &config.schedule;
        let schedule = vec![
            (s.anneal.trigger, Action::Anneal),
            (s.evaluate, Action::Evaluate),
            (s.report, Action::Log),
            (s.snapshot, Action::Snapshot),
        ];

        let progress = progress_bar(&s.stop, options.progress);
        Ok(Self {
            config: config.clone(),
            dispatcher,
            policy,
            train,
            valid,
            options,
            iterator_state: iterator.state(),
            iterator,
            loader: None,
            schedule,
            state: ControllerState::Idle,
            training: TrainingState::default(),
            observations: MetricAccumulator::default(),
            last_record: None,
            reporter,
            progress,
            stop: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            elapsed_before: 0.0,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn training_state(&self) -> &TrainingState {
        &self.training
    }

    pub fn iterator_state(&self) -> IteratorState {
        self.iterator_state
    }

    pub fn policy(&self) -> &ParameterUpdatePolicy {
        &self.policy
    }

    pub fn dispatcher(&self) -> &DeviceDispatcher {
        &self.dispatcher
    }

    pub fn last_record(&self) -> Option<&LogRecord> {
        self.last_record.as_ref()
    }

    pub fn reporter(&self) -> Option<&Reporter> {
        self.reporter.as_ref()
    }

    /// Seconds of training, including time before a resume.
    pub fn elapsed(&self) -> f64 {
        self.elapsed_before + self.started.elapsed().as_secs_f64()
    }

    /// Setting this flag stops the loop after the current step, with a
    /// final snapshot.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    // ── Resume ────────────────────────────────────────────────────────────────

    /// Restore parameters, optimizer, counters, trigger records, iterator
    /// position and reporting state. Only valid before the first step.
    pub fn resume(&mut self, path: &std::path::Path) -> Result<()> {
        if self.state != ControllerState::Idle || self.loader.is_some() {
            return Err(DistillError::ResumeNotIdle(self.state.to_string()).into());
        }
        let ck = Checkpoint::load(path)?;

        let params = self.dispatcher.main().params();
        for (name, _) in params.named_vars()? {
            let value = ck.student.get(&name).ok_or_else(|| DistillError::MissingCheckpointGroup {
                path: path.display().to_string(),
                group: format!("student/{name}"),
            })?;
            params.assign(&name, value).with_context(|| format!("Cannot restore student/{name}"))?;
        }
        self.dispatcher.broadcast()?;
        self.policy.load_state(ck.optimizer).context("Cannot restore optimizer state")?;
        self.iterator.restore(ck.iterator)?;
        self.iterator_state = ck.iterator;
        self.training = ck.training;
        self.observations = MetricAccumulator::from_sums(ck.report.observations);
        self.elapsed_before = ck.report.elapsed_time;
        self.started = Instant::now();
        self.last_record = ck.report.log.last().cloned();
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.restore(ck.report.log).context("Cannot restore the metrics log")?;
        }
        self.progress.set_position(self.training.iteration);

        info!(
            path = %path.display(),
            iteration = self.training.iteration,
            epoch = self.training.epoch,
            alpha = self.policy.hyperparameters().alpha,
            "Resumed from snapshot"
        );
        Ok(())
    }

    // ── Loop ──────────────────────────────────────────────────────────────────

    /// Run until the stop trigger fires or a stop is requested.
    pub fn run(&mut self) -> Result<RunSummary> {
        info!(
            devices = self.dispatcher.device_count(),
            train = self.train.len(),
            validation = self.valid.len(),
            batch_size = self.config.batch_size,
            stop = %self.config.schedule.stop,
            "Starting distillation"
        );

        let mut last = None;
        let mut interrupted = false;
        while self.state != ControllerState::Stopped {
            if self.config.schedule.stop.reached(&self.training) {
                self.state = ControllerState::Stopped;
                break;
            }
            if self.stop.load(Ordering::SeqCst) {
                interrupted = true;
                self.interrupt()?;
                break;
            }
            last = Some(self.step()?);
            interrupted = self.state == ControllerState::Stopped && self.stop.load(Ordering::SeqCst);
        }

        let elapsed = self.elapsed();
        self.progress.finish_with_message(format!(
            "Stopped at iteration {} ({})",
            self.training.iteration,
            format_duration(elapsed as u64)
        ));
        Ok(RunSummary {
            iterations: self.training.iteration,
            epochs: self.training.epoch,
            elapsed_secs: elapsed,
            final_loss: last,
            interrupted,
        })
    }

    /// One update followed by every scheduled action whose trigger fires.
    pub fn step(&mut self) -> Result<LossValues> {
        if self.state == ControllerState::Stopped {
            anyhow::bail!("controller is stopped");
        }
        self.state = ControllerState::Running;

        let loader = self.loader.get_or_insert_with(|| {
            BatchLoader::new(Arc::clone(&self.train), self.iterator.clone(), &self.options.loader)
        });
        let loaded = loader.next_batch().context("Failed to load training batch")?;
        let batch = &loaded.batch;

        let noise = noise::gaussian(
            self.config.seed,
            Stream::TrainNoise,
            self.training.iteration,
            batch.len(),
            batch.samples(),
        )?;
        let values = self
            .dispatcher
            .train_step(batch, &noise, &mut self.policy, self.training.iteration + 1)?;

        // The update succeeded: advance.
        self.training.iteration += 1;
        self.training.epoch = loaded.state.epoch;
        self.training.new_epoch = loaded.new_epoch;
        self.iterator_state = loaded.state;
        self.observations.extend(values.named("main"));
        self.progress.inc(1);
        self.progress.set_message(format!("loss {:.4}", values.loss));
        debug!(iteration = self.training.iteration, loss = values.loss, "Step complete");

        for i in 0..self.schedule.len() {
            let (trigger, action) = self.schedule[i];
            if trigger.fires(&self.training) {
                self.training.mark_fired(action);
                self.perform(action)?;
            }
        }
        self.state = ControllerState::Running;

        if self.config.schedule.stop.reached(&self.training) {
            self.state = ControllerState::Stopped;
        } else if self.stop.load(Ordering::SeqCst) {
            self.interrupt()?;
        }
        Ok(values)
    }

    fn perform(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Anneal => {
                self.state = ControllerState::Annealing;
                let anneal = &self.config.schedule.anneal;
                let value = self.policy.anneal(&anneal.hyperparameter, anneal.rate)?;
                info!(
                    iteration = self.training.iteration,
                    hyperparameter = %anneal.hyperparameter,
                    value,
                    "Annealed"
                );
            }
            Action::Evaluate => {
                self.state = ControllerState::Evaluating;
                let values = self.evaluate()?;
                self.observations.extend(values.named("validation/main"));
            }
            Action::Log => {
                self.state = ControllerState::Logging;
                self.log()?;
            }
            Action::Snapshot => {
                self.state = ControllerState::Snapshotting;
                self.snapshot()?;
            }
        }
        Ok(())
    }

    /// One pass over the validation split on the main replica. Reads
    /// parameters only; optimizer, counters and iterator are untouched.
    pub fn evaluate(&self) -> Result<LossValues> {
        let batch_size = (self.config.batch_size / self.dispatcher.device_count()).max(1);
        let batches = EvalBatches::new(
            Arc::clone(&self.valid),
            batch_size,
            self.config.seed,
            self.options.loader.process,
        );
        let mut parts = Vec::new();
        for (i, batch) in batches.enumerate() {
            let batch = batch.context("Failed to load validation batch")?;
            let noise = noise::gaussian(self.config.seed, Stream::EvalNoise, i as u64, batch.len(), batch.samples())?;
            let values = self.dispatcher.evaluate_batch(&batch, &noise)?;
            parts.push((values, batch.len() as f64));
        }
        let values = LossValues::weighted_mean(&parts);
        debug!(iteration = self.training.iteration, loss = values.loss, "Evaluation complete");
        Ok(values)
    }

    fn log(&mut self) -> Result<()> {
        let mut metrics = self.observations.means();
        metrics.insert("lr".to_string(), self.policy.hyperparameters().alpha);
        let record = LogRecord {
            epoch: self.training.epoch,
            iteration: self.training.iteration,
            elapsed_time: self.elapsed(),
            metrics,
        };

        if self.training.record(Action::Log).fires == 1 {
            self.progress.println(LogRecord::report_header());
        }
        self.progress.println(record.report_line());
        info!(
            epoch = record.epoch,
            iteration = record.iteration,
            loss = record.metrics.get("main/loss").copied().unwrap_or(f64::NAN),
            lr = record.metrics.get("lr").copied().unwrap_or(f64::NAN),
            "Report"
        );

        if let Some(reporter) = self.reporter.as_mut() {
            reporter.write(record.clone())?;
        }
        self.last_record = Some(record);
        self.observations.reset();
        Ok(())
    }

    /// Everything needed to continue this run later.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            student: self.dispatcher.main().params().snapshot()?,
            optimizer: self.policy.state()?,
            training: self.training.clone(),
            iterator: self.iterator_state,
            report: ReportState {
                elapsed_time: self.elapsed(),
                observations: self.observations.sums().clone(),
                log: self.reporter.as_ref().map(|r| r.history().to_vec()).unwrap_or_default(),
            },
        })
    }

    fn snapshot(&self) -> Result<()> {
        match self.reporter.as_ref() {
            Some(r) => self.checkpoint()?.save(&snapshot_path(r.dir().path(), self.training.iteration)),
            None => {
                warn!(iteration = self.training.iteration, "No run directory; snapshot skipped");
                Ok(())
            }
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        warn!(iteration = self.training.iteration, "Stop requested; writing final snapshot");
        self.state = ControllerState::Snapshotting;
        self.snapshot()?;
        self.state = ControllerState::Stopped;
        Ok(())
    }
}

fn progress_bar(stop: &Trigger, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = match stop.unit {
        TriggerUnit::Iteration => ProgressBar::new(stop.every),
        TriggerUnit::Epoch => ProgressBar::new_spinner(),
    };
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) | {msg}",
    ) {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message("starting...");
    pb
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
