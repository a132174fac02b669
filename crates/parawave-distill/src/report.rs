//! Run directory, metric aggregation and the append-only `log.jsonl`.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::plot::{write_svg, Series};

pub const LOG_FILE: &str = "log.jsonl";
pub const CONFIG_FILE: &str = "config.json";

/// Plot file stem → metric keys drawn in it.
pub const PLOTS: [(&str, &[&str]); 5] = [
    ("loss", &["main/loss", "validation/main/loss"]),
    ("kl", &["main/kl_divergence", "validation/main/kl_divergence"]),
    ("regularization", &["main/regularization", "validation/main/regularization"]),
    ("spectrogram", &["main/spectrogram_frame_loss", "validation/main/spectrogram_frame_loss"]),
    ("lr", &["lr"]),
];

/// Columns of the console report, after epoch and iteration.
const REPORT_KEYS: [&str; 8] = [
    "main/loss",
    "main/kl_divergence",
    "main/regularization",
    "main/spectrogram_frame_loss",
    "validation/main/loss",
    "validation/main/kl_divergence",
    "validation/main/regularization",
    "validation/main/spectrogram_frame_loss",
];

/// `<out_dir>/<YYYY_MM_DD_HH_MM_SS>/`
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    pub fn create(out_dir: &Path) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y_%m_%d_%H_%M_%S").to_string();
        let mut path = out_dir.join(&stamp);
        let mut n = 1;
        while path.exists() {
            path = out_dir.join(format!("{stamp}_{n}"));
            n += 1;
        }
        Self::at(path)
    }

    pub fn at(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).with_context(|| format!("Cannot create run directory: {}", path.display()))?;
        info!(path = %path.display(), "Run directory ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective configuration as pretty JSON.
    pub fn write_config<T: Serialize>(&self, config: &T) -> Result<()> {
        let path = self.path.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&path, json).with_context(|| format!("Cannot write {}", path.display()))
    }

    /// Verbatim copy of the user's config file.
    pub fn copy_user_config(&self, source: &Path) -> Result<PathBuf> {
        let name = source.file_name().context("config path has no file name")?;
        let dest = self.path.join(name);
        fs::copy(source, &dest)
            .with_context(|| format!("Cannot copy {} to {}", source.display(), dest.display()))?;
        Ok(dest)
    }
}

/// Means of every metric observed since the last reset.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricAccumulator {
    sums: BTreeMap<String, (f64, u64)>,
}

impl MetricAccumulator {
    /// Continue from pending `(sum, count)` pairs, e.g. out of a snapshot.
    pub fn from_sums(sums: BTreeMap<String, (f64, u64)>) -> Self {
        Self { sums }
    }

    pub fn sums(&self) -> &BTreeMap<String, (f64, u64)> {
        &self.sums
    }

    pub fn add(&mut self, name: impl Into<String>, value: f64) {
        let e = self.sums.entry(name.into()).or_insert((0.0, 0));
        e.0 += value;
        e.1 += 1;
    }

    pub fn extend<I: IntoIterator<Item = (String, f64)>>(&mut self, values: I) {
        for (k, v) in values {
            self.add(k, v);
        }
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums.iter().map(|(k, (s, n))| (k.clone(), s / *n as f64)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub epoch: u64,
    pub iteration: u64,
    pub elapsed_time: f64,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,
}

impl LogRecord {
    pub fn report_header() -> String {
        let mut line = format!("{:<8}{:<12}", "epoch", "iteration");
        for k in REPORT_KEYS {
            line.push_str(&format!("{:<width$}", k, width = k.len() + 2));
        }
        line
    }

    /// One console line, blank where a metric has not been observed.
    pub fn report_line(&self) -> String {
        let mut line = format!("{:<8}{:<12}", self.epoch, self.iteration);
        for k in REPORT_KEYS {
            let cell = self.metrics.get(k).map(|v| format!("{v:.6}")).unwrap_or_default();
            line.push_str(&format!("{:<width$}", cell, width = k.len() + 2));
        }
        line
    }
}

/// Reporting state that a snapshot carries so a resumed run keeps logging
/// where the interrupted one left off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportState {
    /// Seconds of training before the snapshot.
    pub elapsed_time: f64,
    /// Observations not yet folded into a log record.
    pub observations: BTreeMap<String, (f64, u64)>,
    /// Records written so far.
    pub log: Vec<LogRecord>,
}

/// `log.jsonl` writer plus in-memory history for plotting.
pub struct Reporter {
    dir: RunDirectory,
    history: Vec<LogRecord>,
}

impl Reporter {
    pub fn new(dir: RunDirectory) -> Self {
        Self { dir, history: Vec::new() }
    }

    pub fn dir(&self) -> &RunDirectory {
        &self.dir
    }

    pub fn history(&self) -> &[LogRecord] {
        &self.history
    }

    /// Replace the history with `records` from an earlier run, rewriting
    /// `log.jsonl` and the plots to match.
    pub fn restore(&mut self, records: Vec<LogRecord>) -> Result<()> {
        let path = self.dir.path().join(LOG_FILE);
        let mut text = String::new();
        for record in &records {
            text.push_str(&serde_json::to_string(record)?);
            text.push('\n');
        }
        fs::write(&path, text).with_context(|| format!("Cannot write {}", path.display()))?;
        self.history = records;
        if self.history.is_empty() {
            return Ok(());
        }
        self.plot()
    }

    /// Append `record` to the log and redraw every plot.
    pub fn write(&mut self, record: LogRecord) -> Result<()> {
        let path = self.dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Cannot open {} for appending", path.display()))?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        self.history.push(record);
        self.plot()
    }

    fn plot(&self) -> Result<()> {
        for (stem, keys) in PLOTS {
            let series: Vec<Series<'_>> = keys
                .iter()
                .map(|k| Series {
                    name: *k,
                    points: self
                        .history
                        .iter()
                        .filter_map(|r| r.metrics.get(*k).map(|v| (r.iteration as f64, *v)))
                        .collect(),
                })
                .collect();
            write_svg(&self.dir.path().join(format!("{stem}.svg")), stem, &series)?;
        }
        Ok(())
    }
}
