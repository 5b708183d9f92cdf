//! Live job status and the handle returned to callers

use chrono::Utc;
use cohort_core::{CohortError, CohortResult, Job, JobStatus, JobView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Counts of jobs by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub waitlisted: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl RunSummary {
    /// Every job has finished
    pub fn is_done(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

/// Shared status table keyed by job index
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    jobs: Arc<RwLock<BTreeMap<u32, JobView>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job in its current state
    pub async fn insert(&self, job: &Job) {
        self.jobs.write().await.insert(job.index, JobView::from_job(job));
    }

    /// Record that a job's worker has started on its current slot
    pub async fn started(&self, job: &Job) {
        let view = JobView {
            started_at: Some(Utc::now()),
            ..JobView::from_job(job)
        };
        self.jobs.write().await.insert(job.index, view);
    }

    /// Record a job's outcome; the last slot stays on the row
    pub async fn finished(&self, job: &Job, error: Option<&CohortError>) {
        let mut jobs = self.jobs.write().await;
        let view = jobs
            .entry(job.index)
            .or_insert_with(|| JobView::from_job(job));
        view.status = job.status();
        view.running = false;
        view.error = error.map(|e| e.to_string());
        view.finished_at = Some(Utc::now());
    }

    /// Status rows in index order
    pub async fn views(&self) -> Vec<JobView> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn get(&self, index: u32) -> Option<JobView> {
        self.jobs.read().await.get(&index).cloned()
    }

    pub async fn summary(&self) -> RunSummary {
        let jobs = self.jobs.read().await;
        let mut summary = RunSummary {
            total: jobs.len(),
            ..RunSummary::default()
        };
        for view in jobs.values() {
            match view.status {
                JobStatus::Waitlisted => summary.waitlisted += 1,
                JobStatus::Ready => summary.ready += 1,
                JobStatus::Running => summary.running += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }
}

enum Coordinator {
    Running(JoinHandle<CohortResult<RunSummary>>),
    Finished(CohortResult<RunSummary>),
}

/// Handle over a launched run
///
/// Status can be read while jobs are still running; `wait` blocks until the
/// last job has finished.
pub struct JobSheet {
    run_id: Uuid,
    board: StatusBoard,
    coordinator: Coordinator,
}

impl JobSheet {
    pub(crate) fn new(
        run_id: Uuid,
        board: StatusBoard,
        handle: JoinHandle<CohortResult<RunSummary>>,
    ) -> Self {
        Self {
            run_id,
            board,
            coordinator: Coordinator::Running(handle),
        }
    }

    /// Block until the coordinator exits, keeping the handle usable
    pub(crate) async fn settle(&mut self) {
        if let Coordinator::Running(handle) = &mut self.coordinator {
            let outcome = join_coordinator(handle).await;
            self.coordinator = Coordinator::Finished(outcome);
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Status table shared with the coordinator
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn is_finished(&self) -> bool {
        match &self.coordinator {
            Coordinator::Running(handle) => handle.is_finished(),
            Coordinator::Finished(_) => true,
        }
    }

    pub async fn views(&self) -> Vec<JobView> {
        self.board.views().await
    }

    pub async fn get(&self, index: u32) -> Option<JobView> {
        self.board.get(index).await
    }

    pub async fn summary(&self) -> RunSummary {
        self.board.summary().await
    }

    /// Wait for every job to finish
    pub async fn wait(self) -> CohortResult<RunSummary> {
        match self.coordinator {
            Coordinator::Running(mut handle) => join_coordinator(&mut handle).await,
            Coordinator::Finished(outcome) => outcome,
        }
    }
}

async fn join_coordinator(
    handle: &mut JoinHandle<CohortResult<RunSummary>>,
) -> CohortResult<RunSummary> {
    handle
        .await
        .map_err(|e| CohortError::Internal(format!("launch coordinator stopped: {}", e)))?
}
