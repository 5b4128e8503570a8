use thiserror::Error;

/// All errors produced by boww-core.
#[derive(Debug, Error)]
pub enum BowwError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("output sink error: {0}")]
    OutputSink(String),

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BowwError>;
