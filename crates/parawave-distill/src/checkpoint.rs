//! Single-file training snapshots.
//!
//! Layout (safetensors, one tensor per key):
//!
//! | Key | Content |
//! |-----|---------|
//! | `student/<name>` | student variable |
//! | `optimizer/m/<name>`, `optimizer/v/<name>` | Adam moments |
//! | `optimizer/step` | update count (i64) |
//! | `optimizer/hyper/<name>` | `alpha`, `beta1`, `beta2`, `eps` (f64) |
//! | `trainer/iteration`, `trainer/epoch`, `trainer/new_epoch` | counters (i64) |
//! | `trainer/triggers/<action>/fires`, `.../last` | trigger records (i64) |
//! | `trainer/elapsed_time` | seconds trained so far (f64) |
//! | `trainer/observations`, `trainer/log` | pending metric sums and written log records (JSON, u8) |
//! | `iterator/epoch`, `iterator/position` | training iterator (i64) |

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::dataset::IteratorState;
use crate::error::DistillError;
use crate::policy::{Hyperparameters, OptimizerState};
use crate::report::ReportState;
use crate::state::TrainingState;
use crate::trigger::{Action, TriggerRecord};

pub const STUDENT: &str = "student/";
pub const MOMENT_M: &str = "optimizer/m/";
pub const MOMENT_V: &str = "optimizer/v/";
pub const OPTIMIZER_STEP: &str = "optimizer/step";
pub const HYPER: &str = "optimizer/hyper/";
pub const ITERATION: &str = "trainer/iteration";
pub const EPOCH: &str = "trainer/epoch";
pub const NEW_EPOCH: &str = "trainer/new_epoch";
pub const TRIGGERS: &str = "trainer/triggers/";
pub const ELAPSED: &str = "trainer/elapsed_time";
pub const OBSERVATIONS: &str = "trainer/observations";
pub const LOG: &str = "trainer/log";
pub const ITERATOR: &str = "iterator/";

/// `snapshot_iter_<N>.safetensors` inside `dir`.
pub fn snapshot_path(dir: &Path, iteration: u64) -> PathBuf {
    dir.join(format!("snapshot_iter_{iteration}.safetensors"))
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub student: BTreeMap<String, Tensor>,
    pub optimizer: OptimizerState,
    pub training: TrainingState,
    pub iterator: IteratorState,
    pub report: ReportState,
}

impl Checkpoint {
    pub fn to_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let cpu = Device::Cpu;
        let mut map = HashMap::new();
        for (name, t) in &self.student {
            map.insert(format!("{STUDENT}{name}"), t.to_device(&cpu)?);
        }
        for (name, m, v) in &self.optimizer.moments {
            map.insert(format!("{MOMENT_M}{name}"), m.to_device(&cpu)?);
            map.insert(format!("{MOMENT_V}{name}"), v.to_device(&cpu)?);
        }
        map.insert(OPTIMIZER_STEP.into(), counter(self.optimizer.step)?);
        let h = &self.optimizer.hyper;
        for (name, value) in Hyperparameters::NAMES.iter().zip([h.alpha, h.beta1, h.beta2, h.eps]) {
            map.insert(format!("{HYPER}{name}"), Tensor::new(&[value], &cpu)?);
        }

        map.insert(ITERATION.into(), counter(self.training.iteration)?);
        map.insert(EPOCH.into(), counter(self.training.epoch)?);
        map.insert(NEW_EPOCH.into(), counter(u64::from(self.training.new_epoch))?);
        for action in Action::ALL {
            let rec = self.training.record(action);
            map.insert(format!("{TRIGGERS}{}/fires", action.name()), counter(rec.fires)?);
            map.insert(format!("{TRIGGERS}{}/last", action.name()), counter(rec.last)?);
        }

        map.insert(ELAPSED.into(), Tensor::new(&[self.report.elapsed_time], &cpu)?);
        map.insert(OBSERVATIONS.into(), json_bytes(&self.report.observations)?);
        map.insert(LOG.into(), json_bytes(&self.report.log)?);

        map.insert(format!("{ITERATOR}epoch"), counter(self.iterator.epoch)?);
        map.insert(format!("{ITERATOR}position"), counter(self.iterator.position)?);
        Ok(map)
    }

    /// Parse a tensor map; `path` is only used in diagnostics.
    pub fn from_tensors(mut map: HashMap<String, Tensor>, path: &Path) -> Result<Self> {
        let reader = Reader { path };

        let student = reader.group(&mut map, STUDENT)?;
        let m = reader.group(&mut map, MOMENT_M)?;
        let mut v = reader.group(&mut map, MOMENT_V)?;
        let moments = m
            .into_iter()
            .map(|(name, m)| {
                let v = v.remove(&name).ok_or_else(|| reader.missing(format!("{MOMENT_V}{name}")))?;
                Ok((name, m, v))
            })
            .collect::<Result<Vec<_>>>()?;

        let step = reader.counter(&mut map, OPTIMIZER_STEP)?;
        let hyper = reader.group(&mut map, HYPER)?;
        let mut h = Hyperparameters { alpha: 0.0, beta1: 0.0, beta2: 0.0, eps: 0.0 };
        for name in Hyperparameters::NAMES {
            let t = hyper.get(name).ok_or_else(|| reader.missing(format!("{HYPER}{name}")))?;
            h.set(name, reader.scalar_f64(t, name)?)?;
        }

        let mut training = TrainingState {
            iteration: reader.counter(&mut map, ITERATION)?,
            epoch: reader.counter(&mut map, EPOCH)?,
            new_epoch: reader.counter(&mut map, NEW_EPOCH)? != 0,
            triggers: BTreeMap::new(),
        };
        let triggers = reader.group(&mut map, TRIGGERS)?;
        for action in Action::ALL {
            let fires = format!("{}/fires", action.name());
            let last = format!("{}/last", action.name());
            let get = |key: &str| -> Result<u64> {
                let t = triggers.get(key).ok_or_else(|| reader.missing(format!("{TRIGGERS}{key}")))?;
                reader.scalar_u64(t, key)
            };
            let rec = TriggerRecord { fires: get(&fires)?, last: get(&last)? };
            // Live state only holds actions that have fired at least once.
            if rec != TriggerRecord::default() {
                training.triggers.insert(action, rec);
            }
        }

        let elapsed = map.remove(ELAPSED).ok_or_else(|| reader.missing(ELAPSED))?;
        let report = ReportState {
            elapsed_time: reader.scalar_f64(&elapsed, ELAPSED)?,
            observations: reader.json(&mut map, OBSERVATIONS)?,
            log: reader.json(&mut map, LOG)?,
        };

        let iter = reader.group(&mut map, ITERATOR)?;
        let get = |key: &str| -> Result<u64> {
            let t = iter.get(key).ok_or_else(|| reader.missing(format!("{ITERATOR}{key}")))?;
            reader.scalar_u64(t, key)
        };
        let iterator = IteratorState { epoch: get("epoch")?, position: get("position")? };

        Ok(Self { student, optimizer: OptimizerState { step, hyper: h, moments }, training, iterator, report })
    }

    /// Write atomically: temporary file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors = self.to_tensors()?;
        let tmp = path.with_extension("safetensors.tmp");
        candle_core::safetensors::save(&tensors, &tmp)
            .with_context(|| format!("Cannot write checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("Cannot move checkpoint into {}", path.display()))?;
        info!(path = %path.display(), iteration = self.training.iteration, "Snapshot written");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let map = candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| DistillError::MalformedCheckpoint {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_tensors(map, path)
    }
}

fn counter(value: u64) -> Result<Tensor> {
    Ok(Tensor::new(&[value as i64], &Device::Cpu)?)
}

/// JSON text as a 1-D u8 tensor; never empty.
fn json_bytes<T: Serialize>(value: &T) -> Result<Tensor> {
    let bytes = serde_json::to_vec(value)?;
    let len = bytes.len();
    Ok(Tensor::from_vec(bytes, len, &Device::Cpu)?)
}

struct Reader<'a> {
    path: &'a Path,
}

impl Reader<'_> {
    fn missing(&self, group: impl Into<String>) -> anyhow::Error {
        DistillError::MissingCheckpointGroup { path: self.path.display().to_string(), group: group.into() }.into()
    }

    fn malformed(&self, reason: String) -> anyhow::Error {
        DistillError::MalformedCheckpoint { path: self.path.display().to_string(), reason }.into()
    }

    /// Remove every `prefix*` key; the group must not be empty.
    fn group(&self, map: &mut HashMap<String, Tensor>, prefix: &str) -> Result<BTreeMap<String, Tensor>> {
        let keys: Vec<String> = map.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        if keys.is_empty() {
            return Err(self.missing(prefix.trim_end_matches('/')));
        }
        Ok(keys
            .into_iter()
            .filter_map(|k| map.remove(&k).map(|t| (k[prefix.len()..].to_string(), t)))
            .collect())
    }

    fn counter(&self, map: &mut HashMap<String, Tensor>, key: &str) -> Result<u64> {
        let t = map.remove(key).ok_or_else(|| self.missing(key))?;
        self.scalar_u64(&t, key)
    }

    fn scalar_u64(&self, t: &Tensor, key: &str) -> Result<u64> {
        if t.elem_count() != 1 || t.dtype() != DType::I64 {
            return Err(self.malformed(format!("'{key}' is not a single i64")));
        }
        let v = t.flatten_all()?.to_vec1::<i64>()?[0];
        u64::try_from(v).map_err(|_| self.malformed(format!("'{key}' is negative")))
    }

    fn json<T: DeserializeOwned>(&self, map: &mut HashMap<String, Tensor>, key: &str) -> Result<T> {
        let t = map.remove(key).ok_or_else(|| self.missing(key))?;
        if t.dtype() != DType::U8 || t.rank() != 1 {
            return Err(self.malformed(format!("'{key}' is not a byte string")));
        }
        let bytes = t.to_vec1::<u8>()?;
        serde_json::from_slice(&bytes).map_err(|e| self.malformed(format!("'{key}': {e}")))
    }

    fn scalar_f64(&self, t: &Tensor, key: &str) -> Result<f64> {
        if t.elem_count() != 1 {
            return Err(self.malformed(format!("'{key}' is not a scalar")));
        }
        Ok(t.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?[0])
    }
}
