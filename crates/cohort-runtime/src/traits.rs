//! Runtime trait definitions

use async_trait::async_trait;
use cohort_core::{CohortResult, Job};
use std::time::Duration;

/// Outcome of a job that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Worker exit code, when the runtime has one
    pub exit_code: Option<i32>,
    /// Wall-clock time spent in the worker
    pub elapsed: Duration,
}

/// Runtime trait for executing jobs
///
/// Implementations return `CohortError::PortConflict` when the worker could
/// not bind its port, and `CohortError::JobExecution` for any other failure.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run a job until its worker exits
    async fn run_job(&self, job: &Job) -> CohortResult<JobReport>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
