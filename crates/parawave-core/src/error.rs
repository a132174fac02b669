use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Pretrained weights missing: no tensors under '{prefix}' in {path}")]
    MissingPretrained { prefix: String, path: String },

    #[error("Cannot read pretrained artifact {path}: {reason}")]
    UnreadablePretrained { path: String, reason: String },

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Parameter store lock poisoned")]
    Poisoned,
}

impl CoreError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
