use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use parawave_core::{AudioConfig, StudentConfig, TeacherConfig};
use parawave_distill::{DistillConfig, PretrainedConfig};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub data: DataConfig,
    pub pretrained: PretrainedConfig,
    pub teacher: TeacherConfig,
    pub student: StudentConfig,
    pub distill: DistillConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DataConfig {
    /// Corpus root; WAVs are read from `<root>/wavs/` when it exists.
    pub root: String,
    pub train_fraction: f64,
    pub split_seed: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunConfig {
    /// Parent of the timestamped run directories.
    pub out_dir: String,
    pub progress: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            data: DataConfig {
                root: "data/LJSpeech-1.1".to_string(),
                train_fraction: 0.9,
                split_seed: 71,
            },
            pretrained: PretrainedConfig::default(),
            teacher: TeacherConfig::default(),
            student: StudentConfig::default(),
            distill: DistillConfig::default(),
            run: RunConfig {
                out_dir: "runs".to_string(),
                progress: true,
            },
        }
    }
}

impl AppConfig {
    /// Cross-section consistency; each section validates its own fields.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.audio.validate()?;
        self.student.validate()?;
        self.distill.validate()?;

        let factor = self.teacher.upsample_factor();
        anyhow::ensure!(
            factor == self.audio.hop_length,
            "teacher.upsample_factors multiply to {factor}, audio.hop_length is {}",
            self.audio.hop_length
        );
        anyhow::ensure!(
            self.teacher.wavenet.condition_dim == self.audio.n_mels,
            "teacher.wavenet.condition_dim ({}) must equal audio.n_mels ({})",
            self.teacher.wavenet.condition_dim,
            self.audio.n_mels
        );
        anyhow::ensure!(
            self.student.condition_dim == self.teacher.wavenet.condition_dim,
            "student.condition_dim ({}) must equal teacher.wavenet.condition_dim ({})",
            self.student.condition_dim,
            self.teacher.wavenet.condition_dim
        );
        anyhow::ensure!(
            self.data.train_fraction > 0.0 && self.data.train_fraction < 1.0,
            "data.train_fraction must lie in (0, 1), got {}",
            self.data.train_fraction
        );
        Ok(())
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables `PARAWAVE__<SECTION>__<KEY>`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .add_source(Config::try_from(&AppConfig::default())?)
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (PARAWAVE__DISTILL__BATCH_SIZE, etc.)
    builder = builder.add_source(
        Environment::with_prefix("PARAWAVE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~` to the actual home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// `expand_path` for a path-typed field.
pub fn expand(path: &Path) -> PathBuf {
    expand_path(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parawave_distill::{Trigger, TriggerUnit};
    use tempfile::TempDir;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn test_defaults_match_default_impl() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_default_sections() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.audio.sample_rate, 22050);
        assert_eq!(cfg.audio.length, 7680);
        assert_eq!(cfg.data.split_seed, 71);
        assert_eq!(cfg.pretrained.encoder_prefix, "encoder");
        assert_eq!(cfg.teacher.upsample_factors, vec![16, 16]);
        assert_eq!(cfg.student.n_layers, vec![10, 10, 10, 10]);
        assert_eq!(cfg.distill.schedule.report, Trigger::iterations(100));
        assert_eq!(cfg.run.out_dir, "runs");
        assert!(cfg.run.progress);
    }

    #[test]
    fn test_defaults_are_consistent() {
        assert!(AppConfig::default().validate().is_ok());
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(
            &file,
            "[distill]\nbatch_size = 8\n\n[distill.optim]\nlr = 0.001\n\n\
             [distill.schedule.stop]\nevery = 3\nunit = \"epoch\"\n\n[run]\nout_dir = \"/tmp/out\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.distill.batch_size, 8);
        assert!((cfg.distill.optim.lr - 1e-3).abs() < f64::EPSILON);
        assert_eq!(cfg.distill.schedule.stop.unit, TriggerUnit::Epoch);
        assert_eq!(cfg.distill.schedule.stop.every, 3);
        assert_eq!(cfg.run.out_dir, "/tmp/out");
        // Untouched keys keep their defaults.
        assert_eq!(cfg.distill.optim.grad_clip, 10.0);
        assert_eq!(cfg.audio, AudioConfig::default());
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("absent.toml");
        assert!(load_config(Some(&file)).is_err());
    }

    // ── validate ──────────────────────────────────────────────────────────────

    #[test]
    fn test_hop_must_match_upsampling() {
        let mut cfg = AppConfig::default();
        cfg.teacher.upsample_factors = vec![4, 4];
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("upsample_factors"), "{err}");
    }

    #[test]
    fn test_condition_dims_must_agree() {
        let mut cfg = AppConfig::default();
        cfg.student.condition_dim = 40;
        assert!(cfg.validate().is_err());
    }

    // ── expand_path ───────────────────────────────────────────────────────────

    #[test]
    fn test_expand_absolute_path_unchanged() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_produces_non_tilde_prefix() {
        let path = expand_path("~/runs");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with("runs"));
    }

    #[test]
    fn test_expand_relative_path_unchanged() {
        assert_eq!(expand(Path::new("relative/path")), PathBuf::from("relative/path"));
    }
}
