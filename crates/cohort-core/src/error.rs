//! Error types for cohort

use thiserror::Error;

/// Main error type for cohort
#[derive(Error, Debug)]
pub enum CohortError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed caller input (unknown condition, unknown device, bad mode)
    #[error("Validation error: {0}")]
    Validation(String),

    /// No device can hold a single job with the requested budget
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// A port that looked free was taken by the time the worker bound it
    #[error("Port conflict on port {0}")]
    PortConflict(u16),

    /// A job failed while training or testing
    #[error("Job failed for replicate {replicate_id} of condition '{condition}': {reason}")]
    JobExecution {
        condition: String,
        replicate_id: u32,
        reason: String,
    },

    /// The memory probe failed or produced no usable report
    #[error("Memory estimation failed: {0}")]
    MemoryEstimation(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// GPU error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CohortError {
    /// Whether the error is recovered locally instead of reaching the caller
    pub fn is_transient(&self) -> bool {
        matches!(self, CohortError::PortConflict(_))
    }
}

/// Result type for cohort operations
pub type CohortResult<T> = Result<T, CohortError>;

impl From<serde_json::Error> for CohortError {
    fn from(err: serde_json::Error) -> Self {
        CohortError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CohortError {
    fn from(err: toml::de::Error) -> Self {
        CohortError::Config(err.to_string())
    }
}

impl From<nvml_wrapper::error::NvmlError> for CohortError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        CohortError::Gpu(err.to_string())
    }
}
