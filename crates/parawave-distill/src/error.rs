use thiserror::Error;

/// Fatal orchestration conditions that callers (and tests) may want to match
/// on. Everything else travels as `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Checkpoint {path} is missing group '{group}'")]
    MissingCheckpointGroup { path: String, group: String },

    #[error("Checkpoint {path}: {reason}")]
    MalformedCheckpoint { path: String, reason: String },

    #[error("Update policy used before setup()")]
    PolicyNotSetup,

    #[error("Unknown optimizer hyper-parameter '{0}'")]
    UnknownHyperparameter(String),

    #[error("Non-finite loss {value} at iteration {iteration}; no update applied")]
    NonFiniteLoss { iteration: u64, value: f64 },

    #[error("Cannot resume: controller is {0}, not idle")]
    ResumeNotIdle(String),

    #[error("Invalid config: {field} — {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Dataset split '{0}' is empty")]
    EmptySplit(&'static str),

    #[error("Data loader worker exited unexpectedly")]
    LoaderDisconnected,
}

impl DistillError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field: field.into(), reason: reason.into() }
    }
}
