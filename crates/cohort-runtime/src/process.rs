//! Process-based runtime implementation
//!
//! Every job runs as its own OS process, so workers share no memory with the
//! coordinator or with each other.

use async_trait::async_trait;
use cohort_core::{CohortError, CohortResult, Job, WorkerConfig};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::traits::{JobReport, Runtime};

/// Process-based runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Worker program
    pub program: PathBuf,
    /// Templated arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Exit code reporting a lost port race
    pub port_conflict_exit_code: i32,
    /// Write worker output to the job's log directory instead of inheriting it
    pub capture_output: bool,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self::from_worker(&WorkerConfig::default(), true)
    }
}

impl ProcessRuntimeConfig {
    pub fn from_worker(worker: &WorkerConfig, verbose: bool) -> Self {
        Self {
            program: worker.program.clone(),
            args: worker.args.clone(),
            env: worker.env.clone(),
            port_conflict_exit_code: worker.port_conflict_exit_code,
            capture_output: !verbose,
        }
    }
}

/// Process-based runtime for running training workers
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
}

impl ProcessRuntime {
    /// Create a new process runtime
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self { config }
    }

    /// Substitute job placeholders in an argument template
    fn render_arg(template: &str, job: &Job) -> String {
        let device = job.device().map(|d| d.to_string()).unwrap_or_default();
        let port = job.port().map(|p| p.to_string()).unwrap_or_default();
        template
            .replace("{condition}", &job.condition)
            .replace("{replicate_id}", &job.replicate_id.to_string())
            .replace("{index}", &job.index.to_string())
            .replace("{device}", &device)
            .replace("{port}", &port)
            .replace("{job_dir}", &job.paths.base.display().to_string())
            .replace("{mode}", &job.mode().to_string())
            .replace("{estimate_memory}", &job.estimate_memory.to_string())
    }

    /// Build the command to run a job
    fn build_command(&self, job: &Job) -> CohortResult<Command> {
        let mut cmd = Command::new(&self.config.program);

        for arg in &self.config.args {
            cmd.arg(Self::render_arg(arg, job));
        }

        cmd.envs(job.worker_env());
        cmd.envs(&self.config.env);

        if self.config.capture_output {
            let open = |name: &str| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(job.paths.logs.join(name))
            };
            cmd.stdout(Stdio::from(open("worker.stdout.log")?));
            cmd.stderr(Stdio::from(open("worker.stderr.log")?));
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }

    fn failure(job: &Job, reason: String) -> CohortError {
        CohortError::JobExecution {
            condition: job.condition.clone(),
            replicate_id: job.replicate_id,
            reason,
        }
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn run_job(&self, job: &Job) -> CohortResult<JobReport> {
        let slot = job.slot().ok_or_else(|| {
            CohortError::Runtime(format!("job {} has no device or port", job.task()))
        })?;

        info!(
            condition = %job.condition,
            replicate_id = job.replicate_id,
            device = slot.device,
            port = slot.port,
            "Starting worker process"
        );

        job.paths.create_all()?;
        let mut cmd = self.build_command(job)?;
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| {
            error!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                error = %e,
                "Failed to spawn worker process"
            );
            Self::failure(job, format!("failed to spawn worker: {}", e))
        })?;

        debug!(
            condition = %job.condition,
            replicate_id = job.replicate_id,
            pid = child.id().unwrap_or(0),
            "Worker process spawned"
        );

        let status = child
            .wait()
            .await
            .map_err(|e| Self::failure(job, format!("failed to wait for worker: {}", e)))?;
        let elapsed = started.elapsed();

        if status.success() {
            info!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                elapsed_secs = elapsed.as_secs(),
                "Worker finished"
            );
            return Ok(JobReport {
                exit_code: status.code(),
                elapsed,
            });
        }

        if status.code() == Some(self.config.port_conflict_exit_code) {
            warn!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                port = slot.port,
                "Worker could not bind its port"
            );
            return Err(CohortError::PortConflict(slot.port));
        }

        let mut reason = format!("worker exited with {}", status);
        if self.config.capture_output {
            reason.push_str(&format!(
                " (see {})",
                job.paths.logs.join("worker.stderr.log").display()
            ));
        }
        Err(Self::failure(job, reason))
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{RunConfig, RunSettings, Slot, Task};
    use std::sync::Arc;

    fn job_in(dir: &std::path::Path) -> Job {
        let settings = Arc::new(RunSettings::from_config(&RunConfig::new(dir)));
        Job::ready(Task::new("object1", 2), 5, Slot::new(1, 5004), settings)
    }

    fn shell(script: &str, capture_output: bool) -> ProcessRuntime {
        ProcessRuntime::new(ProcessRuntimeConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            port_conflict_exit_code: 98,
            capture_output,
        })
    }

    #[test]
    fn test_process_runtime_config_default() {
        let config = ProcessRuntimeConfig::default();
        assert_eq!(config.program.to_str().unwrap(), "cohort-worker");
        assert!(!config.capture_output);
    }

    #[test]
    fn test_render_arg() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        assert_eq!(
            ProcessRuntime::render_arg("--port={port} --gpu={device} {condition}/{replicate_id}", &job),
            "--port=5004 --gpu=1 object1/2"
        );
        assert_eq!(ProcessRuntime::render_arg("{mode}", &job), "full");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_worker() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let runtime = shell("test \"$COHORT_PORT\" = 5004 && echo done", true);

        let report = runtime.run_job(&job).await.unwrap();
        assert_eq!(report.exit_code, Some(0));
        assert!(job.paths.model.is_dir());

        let out = std::fs::read_to_string(job.paths.logs.join("worker.stdout.log")).unwrap();
        assert_eq!(out.trim(), "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_worker() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let err = shell("exit 3", true).run_job(&job).await.unwrap_err();
        match err {
            CohortError::JobExecution {
                condition,
                replicate_id,
                ..
            } => {
                assert_eq!(condition, "object1");
                assert_eq!(replicate_id, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_conflict_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let err = shell("exit 98", true).run_job(&job).await.unwrap_err();
        assert!(matches!(err, CohortError::PortConflict(5004)));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let job = job_in(dir.path());
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
            program: PathBuf::from("/nonexistent/cohort-worker"),
            capture_output: true,
            ..ProcessRuntimeConfig::default()
        });
        assert!(matches!(
            runtime.run_job(&job).await,
            Err(CohortError::JobExecution { .. })
        ));
        assert_eq!(runtime.name(), "process");
    }
}
