//! Audio datasets, seeded epoch iteration and the prefetching batch loader.
//!
//! Waveforms are discovered LJSpeech-style: every `*.wav` under
//! `<root>/wavs/`, or directly under `<root>` when there is no `wavs/`
//! directory, in sorted order.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use parawave_core::{Example, Preprocess};

use crate::error::DistillError;
use crate::noise::{derive_seed, rng, Stream};

/// Random-access source of `(features, waveform)` examples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `seed` drives any randomness in loading, such as the crop offset.
    fn get(&self, index: usize, seed: u64) -> Result<Example>;
}

// ── WAV files ─────────────────────────────────────────────────────────────────

pub struct WavDataset {
    paths: Vec<PathBuf>,
    preprocess: Preprocess,
}

impl WavDataset {
    pub fn new(paths: Vec<PathBuf>, preprocess: Preprocess) -> Self {
        Self { paths, preprocess }
    }

    pub fn from_root(root: &Path, preprocess: Preprocess) -> Result<Self> {
        Ok(Self::new(discover_wavs(root)?, preprocess))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Dataset for WavDataset {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn get(&self, index: usize, seed: u64) -> Result<Example> {
        let path = self.paths.get(index).with_context(|| format!("index {index} out of range"))?;
        let mut rng = StdRng::seed_from_u64(seed);
        self.preprocess
            .load(path, &mut rng)
            .with_context(|| format!("Failed to preprocess {}", path.display()))
    }
}

/// Sorted `*.wav` files under `<root>/wavs`, falling back to `<root>`.
pub fn discover_wavs(root: &Path) -> Result<Vec<PathBuf>> {
    let nested = root.join("wavs");
    let dir = if nested.is_dir() { nested } else { root.to_path_buf() };

    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("Cannot read dataset directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")))
        .collect();
    paths.sort();

    anyhow::ensure!(!paths.is_empty(), "No .wav files found in {}", dir.display());
    info!(dir = %dir.display(), count = paths.len(), "Discovered waveforms");
    Ok(paths)
}

// ── Splitting ─────────────────────────────────────────────────────────────────

/// View of a dataset restricted to `indices`.
pub struct Subset {
    inner: Arc<dyn Dataset>,
    indices: Vec<usize>,
}

impl Subset {
    pub fn new(inner: Arc<dyn Dataset>, indices: Vec<usize>) -> Self {
        Self { inner, indices }
    }
}

impl Dataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize, seed: u64) -> Result<Example> {
        let inner = *self.indices.get(index).with_context(|| format!("index {index} out of range"))?;
        self.inner.get(inner, seed)
    }
}

/// Seeded permutation of `0..len`, cut at `first`.
pub fn split_random(len: usize, first: usize, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let rest = order.split_off(first.min(len));
    (order, rest)
}

/// Split `dataset` into train/validation by `train_fraction`; neither side
/// may be empty.
pub fn split_dataset(
    dataset: Arc<dyn Dataset>,
    train_fraction: f64,
    seed: u64,
) -> Result<(Subset, Subset)> {
    let len = dataset.len();
    let first = (len as f64 * train_fraction) as usize;
    let (train, valid) = split_random(len, first, seed);
    if train.is_empty() {
        return Err(DistillError::EmptySplit("train").into());
    }
    if valid.is_empty() {
        return Err(DistillError::EmptySplit("validation").into());
    }
    info!(train = train.len(), validation = valid.len(), "Split dataset");
    Ok((Subset::new(Arc::clone(&dataset), train), Subset::new(dataset, valid)))
}

// ── Batches ───────────────────────────────────────────────────────────────────

/// Host-resident batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, n_mels, frames]`
    pub features: Tensor,
    /// `[batch, T]`
    pub waveform: Tensor,
}

impl Batch {
    pub fn collate(examples: &[Example]) -> Result<Self> {
        let first = examples.first().context("cannot collate an empty batch")?;
        let (n_mels, n_frames, t) = (first.n_mels, first.n_frames, first.waveform.len());
        let mut features = Vec::with_capacity(examples.len() * n_mels * n_frames);
        let mut waveform = Vec::with_capacity(examples.len() * t);
        for ex in examples {
            anyhow::ensure!(
                ex.n_mels == n_mels && ex.n_frames == n_frames && ex.waveform.len() == t,
                "examples in a batch must share one shape"
            );
            features.extend_from_slice(&ex.features);
            waveform.extend_from_slice(&ex.waveform);
        }
        let b = examples.len();
        Ok(Self {
            features: Tensor::from_vec(features, (b, n_mels, n_frames), &Device::Cpu)?,
            waveform: Tensor::from_vec(waveform, (b, t), &Device::Cpu)?,
        })
    }

    pub fn len(&self) -> usize {
        self.waveform.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn samples(&self) -> usize {
        self.waveform.dims().get(1).copied().unwrap_or(0)
    }

    pub fn narrow(&self, range: Range<usize>) -> Result<Self> {
        let len = range.end - range.start;
        Ok(Self {
            features: self.features.narrow(0, range.start, len)?,
            waveform: self.waveform.narrow(0, range.start, len)?,
        })
    }
}

// ── Iteration ─────────────────────────────────────────────────────────────────

/// Position of the training iterator, persisted in checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorState {
    pub epoch: u64,
    pub position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedItem {
    pub index: usize,
    pub seed: u64,
}

/// One batch worth of indices plus the iterator position after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub items: Vec<PlannedItem>,
    pub new_epoch: bool,
    pub state: IteratorState,
}

/// Infinite, reshuffled-per-epoch index stream. Batches may straddle an
/// epoch boundary. The permutation of epoch `e` depends only on `(seed, e)`.
#[derive(Debug, Clone)]
pub struct EpochIterator {
    len: usize,
    batch_size: usize,
    seed: u64,
    epoch: u64,
    position: usize,
    order: Vec<usize>,
}

impl EpochIterator {
    pub fn new(len: usize, batch_size: usize, seed: u64) -> Result<Self> {
        anyhow::ensure!(len > 0, "cannot iterate an empty dataset");
        anyhow::ensure!(batch_size > 0, "batch size must be positive");
        Ok(Self { len, batch_size, seed, epoch: 0, position: 0, order: permutation(len, seed, 0) })
    }

    pub fn state(&self) -> IteratorState {
        IteratorState { epoch: self.epoch, position: self.position as u64 }
    }

    pub fn restore(&mut self, state: IteratorState) -> Result<()> {
        anyhow::ensure!(
            (state.position as usize) < self.len,
            "iterator position {} out of range for {} examples",
            state.position,
            self.len
        );
        self.epoch = state.epoch;
        self.position = state.position as usize;
        self.order = permutation(self.len, self.seed, self.epoch);
        Ok(())
    }

    pub fn next_plan(&mut self) -> BatchPlan {
        let mut items = Vec::with_capacity(self.batch_size);
        let mut new_epoch = false;
        while items.len() < self.batch_size {
            let index = self.order[self.position];
            items.push(PlannedItem { index, seed: derive_seed(self.seed, Stream::Crop, self.epoch, index as u64) });
            self.position += 1;
            if self.position == self.len {
                self.epoch += 1;
                self.position = 0;
                self.order = permutation(self.len, self.seed, self.epoch);
                new_epoch = true;
            }
        }
        BatchPlan { items, new_epoch, state: self.state() }
    }
}

fn permutation(len: usize, seed: u64, epoch: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rng(seed, Stream::Shuffle, epoch, 0));
    order
}

/// Single pass in index order, final batch may be short.
pub struct EvalBatches {
    dataset: Arc<dyn Dataset>,
    batch_size: usize,
    seed: u64,
    workers: usize,
    next: usize,
}

impl EvalBatches {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize, seed: u64, workers: usize) -> Self {
        Self { dataset, batch_size: batch_size.max(1), seed, workers, next: 0 }
    }
}

impl Iterator for EvalBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.dataset.len();
        if self.next >= len {
            return None;
        }
        let end = (self.next + self.batch_size).min(len);
        let items: Vec<PlannedItem> = (self.next..end)
            .map(|index| PlannedItem { index, seed: derive_seed(self.seed, Stream::EvalCrop, 0, index as u64) })
            .collect();
        self.next = end;
        Some(load_items(self.dataset.as_ref(), &items, self.workers).and_then(|ex| Batch::collate(&ex)))
    }
}

/// Load `items` with up to `workers` threads; output keeps the input order.
pub fn load_items(dataset: &dyn Dataset, items: &[PlannedItem], workers: usize) -> Result<Vec<Example>> {
    if workers <= 1 || items.len() <= 1 {
        return items.iter().map(|it| dataset.get(it.index, it.seed)).collect();
    }
    let chunk = items.len().div_ceil(workers);
    thread::scope(|s| {
        let handles: Vec<_> = items
            .chunks(chunk)
            .map(|part| s.spawn(move || part.iter().map(|it| dataset.get(it.index, it.seed)).collect::<Result<Vec<_>>>()))
            .collect();
        let mut out = Vec::with_capacity(items.len());
        for h in handles {
            let part = h.join().map_err(|_| anyhow::anyhow!("data loader worker panicked"))??;
            out.extend(part);
        }
        Ok(out)
    })
}

// ── Loader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Parallel loading workers.
    pub process: usize,
    /// Bounded queue depth, in batches.
    pub prefetch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { process: 1, prefetch: 64 }
    }
}

impl LoaderConfig {
    pub fn prefetching(&self) -> bool {
        self.process * self.prefetch > 1
    }
}

/// A loaded training batch and the iterator position it leaves behind.
#[derive(Debug, Clone)]
pub struct LoadedBatch {
    pub batch: Batch,
    pub new_epoch: bool,
    pub state: IteratorState,
}

enum Mode {
    Serial { dataset: Arc<dyn Dataset>, iter: EpochIterator, workers: usize },
    Prefetch { rx: Option<Receiver<Result<LoadedBatch>>>, handle: Option<JoinHandle<()>> },
}

/// Training batches in [`EpochIterator`] order, loaded either inline or by
/// a producer thread that stays up to `prefetch` batches ahead.
pub struct BatchLoader {
    mode: Mode,
}

impl BatchLoader {
    pub fn new(dataset: Arc<dyn Dataset>, iter: EpochIterator, cfg: &LoaderConfig) -> Self {
        let workers = cfg.process.max(1);
        if !cfg.prefetching() {
            debug!("Serial data loading");
            return Self { mode: Mode::Serial { dataset, iter, workers } };
        }

        let (tx, rx) = sync_channel(cfg.prefetch.max(1));
        let handle = thread::Builder::new()
            .name("parawave-loader".into())
            .spawn(move || produce(dataset, iter, workers, tx));
        match handle {
            Ok(handle) => {
                debug!(workers, depth = cfg.prefetch, "Prefetching data loader started");
                Self { mode: Mode::Prefetch { rx: Some(rx), handle: Some(handle) } }
            }
            Err(e) => {
                // Thread spawn failure is reported on first use.
                let (etx, erx) = sync_channel(1);
                let _ = etx.send(Err(anyhow::Error::new(e).context("Cannot start data loader thread")));
                Self { mode: Mode::Prefetch { rx: Some(erx), handle: None } }
            }
        }
    }

    pub fn is_prefetching(&self) -> bool {
        matches!(self.mode, Mode::Prefetch { .. })
    }

    pub fn next_batch(&mut self) -> Result<LoadedBatch> {
        match &mut self.mode {
            Mode::Serial { dataset, iter, workers } => {
                let plan = iter.next_plan();
                load_plan(dataset.as_ref(), plan, *workers)
            }
            Mode::Prefetch { rx, .. } => {
                let rx = rx.as_ref().ok_or(DistillError::LoaderDisconnected)?;
                rx.recv().map_err(|_| DistillError::LoaderDisconnected)?
            }
        }
    }
}

impl Drop for BatchLoader {
    fn drop(&mut self) {
        if let Mode::Prefetch { rx, handle } = &mut self.mode {
            // Closing the queue unblocks the producer's pending send.
            drop(rx.take());
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

fn load_plan(dataset: &dyn Dataset, plan: BatchPlan, workers: usize) -> Result<LoadedBatch> {
    let examples = load_items(dataset, &plan.items, workers)?;
    Ok(LoadedBatch { batch: Batch::collate(&examples)?, new_epoch: plan.new_epoch, state: plan.state })
}

fn produce(dataset: Arc<dyn Dataset>, mut iter: EpochIterator, workers: usize, tx: SyncSender<Result<LoadedBatch>>) {
    loop {
        let loaded = load_plan(dataset.as_ref(), iter.next_plan(), workers);
        let failed = loaded.is_err();
        if tx.send(loaded).is_err() || failed {
            break;
        }
    }
}
