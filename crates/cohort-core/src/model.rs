//! Run settings, Job and status type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{RewardType, RunConfig, RunMode};
use crate::task::Task;
use crate::{CohortError, CohortResult};

/// File a probe job writes its device memory usage to
pub const MEMORY_REPORT_FILE: &str = "mem.txt";

/// Training and testing iteration counts for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Iterations {
    pub train: Option<u64>,
    pub test: Option<u64>,
}

/// Settings shared by every job of a run, fixed before the first job exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    pub mode: RunMode,
    pub iterations: Iterations,
    pub steps_per_episode: u64,
    pub save_checkpoints: bool,
    pub checkpoint_freq: u64,
    pub reward: RewardType,
    pub batch_mode: bool,
    pub created_at: DateTime<Utc>,
}

impl RunSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        let training = &config.training;
        let mut iterations = Iterations::default();
        // Overflow is rejected by `RunConfig::validate`
        if config.mode.trains() {
            iterations.train = Some(training.train_iterations().unwrap_or(u64::MAX));
        }
        if config.mode.tests() {
            iterations.test = Some(training.test_iterations().unwrap_or(u64::MAX));
        }

        Self {
            run_id: Uuid::new_v4(),
            output_dir: config.output_dir.clone(),
            mode: config.mode,
            iterations,
            steps_per_episode: training.steps_per_episode,
            save_checkpoints: training.save_checkpoints,
            checkpoint_freq: training.checkpoint_freq,
            reward: training.reward,
            batch_mode: training.batch_mode,
            created_at: Utc::now(),
        }
    }
}

/// Directory layout of a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPaths {
    pub base: PathBuf,
    pub model: PathBuf,
    pub checkpoints: PathBuf,
    pub plots: PathBuf,
    pub logs: PathBuf,
    pub env_recordings: PathBuf,
    pub env_logs: PathBuf,
}

impl JobPaths {
    /// `<output_dir>/<condition>/job_<replicate_id>/...`; nothing is created
    pub fn new(output_dir: &Path, condition: &str, replicate_id: u32) -> Self {
        let base = output_dir
            .join(condition)
            .join(format!("job_{}", replicate_id));
        Self {
            model: base.join("model"),
            checkpoints: base.join("checkpoints"),
            plots: base.join("plots"),
            logs: base.join("logs"),
            env_recordings: base.join("env_recordings"),
            env_logs: base.join("env_logs"),
            base,
        }
    }

    /// Create every directory of the layout
    pub fn create_all(&self) -> CohortResult<()> {
        for dir in [
            &self.model,
            &self.checkpoints,
            &self.plots,
            &self.logs,
            &self.env_recordings,
            &self.env_logs,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Where a probe job reports its memory usage
    pub fn memory_report(&self) -> PathBuf {
        self.base.join(MEMORY_REPORT_FILE)
    }
}

/// Device and port bound to a job while it is ready or running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub device: u32,
    pub port: u16,
}

impl Slot {
    pub fn new(device: u32, port: u16) -> Self {
        Self { device, port }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu{}:{}", self.device, self.port)
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a device to free up
    Waitlisted,
    /// Bound to a slot, not yet dispatched
    Ready,
    /// Worker is executing
    Running,
    /// Worker exited successfully
    Completed,
    /// Worker failed
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Waitlisted => write!(f, "Waitlisted"),
            JobStatus::Ready => write!(f, "Ready"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// A task bound to execution resources
#[derive(Debug, Clone)]
pub struct Job {
    pub condition: String,
    pub replicate_id: u32,
    /// Stable ordinal used for output placement
    pub index: u32,
    /// Marks the one-off memory probe
    pub estimate_memory: bool,
    pub paths: JobPaths,
    pub settings: Arc<RunSettings>,
    slot: Option<Slot>,
    status: JobStatus,
}

impl Job {
    /// Job bound to a slot and ready for dispatch
    pub fn ready(task: Task, index: u32, slot: Slot, settings: Arc<RunSettings>) -> Self {
        let mut job = Self::waitlisted(task, index, settings);
        job.slot = Some(slot);
        job.status = JobStatus::Ready;
        job
    }

    /// Job waiting for capacity; carries no slot
    pub fn waitlisted(task: Task, index: u32, settings: Arc<RunSettings>) -> Self {
        Self {
            paths: JobPaths::new(&settings.output_dir, &task.condition, task.replicate_id),
            condition: task.condition,
            replicate_id: task.replicate_id,
            index,
            estimate_memory: false,
            settings,
            slot: None,
            status: JobStatus::Waitlisted,
        }
    }

    /// Memory probe job; replicate id 0 never collides with a real replicate
    pub fn probe(condition: impl Into<String>, slot: Slot, settings: Arc<RunSettings>) -> Self {
        let mut job = Self::ready(Task::new(condition, 0), 0, slot, settings);
        job.estimate_memory = true;
        job
    }

    pub fn slot(&self) -> Option<Slot> {
        self.slot
    }

    pub fn device(&self) -> Option<u32> {
        self.slot.map(|s| s.device)
    }

    pub fn port(&self) -> Option<u16> {
        self.slot.map(|s| s.port)
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn mode(&self) -> RunMode {
        self.settings.mode
    }

    /// Probe jobs never write checkpoints
    pub fn save_checkpoints(&self) -> bool {
        self.settings.save_checkpoints && !self.estimate_memory
    }

    pub fn task(&self) -> Task {
        Task::new(self.condition.clone(), self.replicate_id)
    }

    /// Bind a waitlisted job to a freed slot
    pub fn bind(&mut self, slot: Slot) -> CohortResult<()> {
        if self.status != JobStatus::Waitlisted {
            return Err(CohortError::Internal(format!(
                "cannot bind job {} in state {}",
                self.task(),
                self.status
            )));
        }
        self.slot = Some(slot);
        self.status = JobStatus::Ready;
        Ok(())
    }

    /// Move a job that has not started yet to another port
    pub fn rebind_port(&mut self, port: u16) -> CohortResult<()> {
        match (self.status, self.slot.as_mut()) {
            (JobStatus::Ready, Some(slot)) => {
                slot.port = port;
                Ok(())
            }
            _ => Err(CohortError::Internal(format!(
                "cannot rebind port of job {} in state {}",
                self.task(),
                self.status
            ))),
        }
    }

    pub fn mark_running(&mut self) -> CohortResult<()> {
        if self.status != JobStatus::Ready {
            return Err(CohortError::Internal(format!(
                "cannot start job {} in state {}",
                self.task(),
                self.status
            )));
        }
        self.status = JobStatus::Running;
        Ok(())
    }

    /// A worker that lost its port goes back to ready, keeping its device
    pub fn mark_retry(&mut self) {
        if self.status == JobStatus::Running {
            self.status = JobStatus::Ready;
        }
    }

    /// Finish the job and hand its slot back
    pub fn finish(&mut self, success: bool) -> Option<Slot> {
        self.status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.slot.take()
    }

    /// Environment handed to the worker process
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("COHORT_RUN_ID".to_string(), self.settings.run_id.to_string()),
            ("COHORT_CONDITION".to_string(), self.condition.clone()),
            ("COHORT_REPLICATE_ID".to_string(), self.replicate_id.to_string()),
            ("COHORT_JOB_INDEX".to_string(), self.index.to_string()),
            ("COHORT_MODE".to_string(), self.mode().to_string()),
            ("COHORT_JOB_DIR".to_string(), self.paths.base.display().to_string()),
            (
                "COHORT_ENV_RECORDINGS".to_string(),
                self.paths.env_recordings.display().to_string(),
            ),
            ("COHORT_ENV_LOGS".to_string(), self.paths.env_logs.display().to_string()),
            (
                "COHORT_ESTIMATE_MEMORY".to_string(),
                self.estimate_memory.to_string(),
            ),
            (
                "COHORT_REWARDED".to_string(),
                (self.settings.reward == RewardType::Supervised).to_string(),
            ),
            (
                "COHORT_STEPS_PER_EPISODE".to_string(),
                self.settings.steps_per_episode.to_string(),
            ),
            ("COHORT_BATCH_MODE".to_string(), self.settings.batch_mode.to_string()),
            (
                "COHORT_SAVE_CHECKPOINTS".to_string(),
                self.save_checkpoints().to_string(),
            ),
            (
                "COHORT_CHECKPOINT_FREQ".to_string(),
                self.settings.checkpoint_freq.to_string(),
            ),
        ];
        if let Some(train) = self.settings.iterations.train {
            env.push(("COHORT_TRAIN_ITERATIONS".to_string(), train.to_string()));
        }
        if let Some(test) = self.settings.iterations.test {
            env.push(("COHORT_TEST_ITERATIONS".to_string(), test.to_string()));
        }
        if let Some(slot) = self.slot {
            env.push(("COHORT_DEVICE".to_string(), slot.device.to_string()));
            env.push(("COHORT_PORT".to_string(), slot.port.to_string()));
            env.push(("CUDA_VISIBLE_DEVICES".to_string(), slot.device.to_string()));
        }
        env
    }
}

/// Caller-facing status row for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub index: u32,
    pub condition: String,
    pub replicate_id: u32,
    /// Device the job runs or ran on; -1 while waitlisted
    pub device: i64,
    /// Port the job runs or ran on; -1 while waitlisted
    pub port: i32,
    pub status: JobStatus,
    pub running: bool,
    pub job_dir: PathBuf,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobView {
    /// Status row for a job as it stands now
    pub fn from_job(job: &Job) -> Self {
        Self {
            index: job.index,
            condition: job.condition.clone(),
            replicate_id: job.replicate_id,
            device: job.device().map(i64::from).unwrap_or(-1),
            port: job.port().map(i32::from).unwrap_or(-1),
            status: job.status(),
            running: job.status() == JobStatus::Running,
            job_dir: job.paths.base.clone(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}
