use thiserror::Error;

pub type Result<T> = std::result::Result<T, FedError>;

/// Errors surfaced to the operator.
#[derive(Debug, Error)]
pub enum FedError {
    #[error("invalid configuration for '{param}': {message}")]
    InvalidConfig { param: String, message: String },

    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("structural mismatch in tensor {index}: expected shape {expected:?}, got {actual:?}")]
    StructuralMismatch {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("parameter count mismatch: expected {expected} tensors, got {actual}")]
    TensorCountMismatch { expected: usize, actual: usize },

    #[error("worker {worker} failed: {message}")]
    WorkerFailure { worker: usize, message: String },

    #[error("no gradients to aggregate")]
    EmptyFederation,

    #[error("trajectory batch is empty")]
    EmptyBatch,

    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint encoding error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl FedError {
    pub fn config(param: &str, message: impl Into<String>) -> Self {
        FedError::InvalidConfig {
            param: param.to_string(),
            message: message.into(),
        }
    }
}
