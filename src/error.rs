use thiserror::Error;

/// Engine-wide error type.
///
/// Every fallible operation in the crate returns `VulcanResult<T>`. Variants
/// map to how the failure is surfaced: validation problems are synchronous,
/// resource limits fail admission, budget errors fail the specific request,
/// and internal errors are fatal to a request but never to the engine.
#[derive(Error, Debug)]
pub enum VulcanError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("KV cache budget exceeded: requested {requested} bytes, {available} available of {max}")]
    OutOfBudget {
        requested: usize,
        available: usize,
        max: usize,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl VulcanError {
    /// Stable machine-readable code for telemetry and stream finalization.
    pub fn code(&self) -> &'static str {
        match self {
            VulcanError::Validation(_) => "validation",
            VulcanError::ShapeMismatch { .. } => "shape_mismatch",
            VulcanError::ResourceLimit(_) => "resource_limit",
            VulcanError::OutOfBudget { .. } => "out_of_budget",
            VulcanError::Cancelled => "cancelled",
            VulcanError::Timeout => "timeout",
            VulcanError::Internal(_) => "internal",
            VulcanError::IoError(_) => "io_error",
            VulcanError::JsonError(_) => "json_error",
        }
    }
}

pub type VulcanResult<T> = Result<T, VulcanError>;
