//! Job dispatch and waitlist promotion
//!
//! A single coordinator task owns the device ledger, the port pool and the
//! waitlist. Workers run in a `JoinSet`; every completion hands its slot
//! straight to the next waitlisted job, so no more jobs run at once than the
//! initial schedule admitted.

use cohort_core::{CohortError, CohortResult, Job, LaunchConfig, Slot, WaitlistOrder};
use cohort_network::PortPool;
use cohort_runtime::{JobReport, Runtime};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

use crate::ledger::DeviceLedger;
use crate::scheduler::SchedulePlan;
use crate::sheet::{JobSheet, RunSummary, StatusBoard};

/// Launch behavior
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Wait for every job before returning
    pub synchronous: bool,
    /// Pause between consecutive dispatches
    pub stagger: Duration,
    pub waitlist_order: WaitlistOrder,
    /// Fresh ports tried per job after a port conflict
    pub max_port_retries: u32,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::from_config(&LaunchConfig::default())
    }
}

impl LaunchOptions {
    pub fn from_config(config: &LaunchConfig) -> Self {
        Self {
            synchronous: config.synchronous,
            stagger: Duration::from_millis(config.stagger_ms),
            waitlist_order: config.waitlist_order,
            max_port_retries: config.max_port_retries,
        }
    }
}

/// Dispatches scheduled jobs to a runtime
pub struct Launcher {
    runtime: Arc<dyn Runtime>,
    options: LaunchOptions,
}

impl Launcher {
    pub fn new(runtime: Arc<dyn Runtime>, options: LaunchOptions) -> Self {
        Self { runtime, options }
    }

    /// Start every ready job and hand the rest to the coordinator
    ///
    /// Returns once the ready jobs are dispatched, or, in synchronous mode,
    /// once every job has finished. The ledger and pool must already hold
    /// the reservations of the ready jobs.
    pub async fn launch(
        &self,
        plan: SchedulePlan,
        ledger: DeviceLedger,
        ports: PortPool,
        budget: u64,
    ) -> CohortResult<JobSheet> {
        let run_id = plan.run_id;
        let board = StatusBoard::new();
        for job in plan.ready.iter().chain(&plan.waitlist) {
            board.insert(job).await;
        }

        info!(
            runtime = self.runtime.name(),
            ready = plan.ready.len(),
            waitlisted = plan.waitlist.len(),
            synchronous = self.options.synchronous,
            "Launching jobs"
        );

        let coordinator = Coordinator {
            runtime: self.runtime.clone(),
            options: self.options.clone(),
            ledger,
            ports,
            budget,
            waitlist: plan.waitlist.into(),
            board: board.clone(),
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
            retries: HashMap::new(),
            dispatched: 0,
        };

        let (dispatched_tx, dispatched_rx) = oneshot::channel();
        let handle = tokio::spawn(coordinator.run(plan.ready, dispatched_tx));
        let mut sheet = JobSheet::new(run_id, board, handle);

        if self.options.synchronous {
            sheet.settle().await;
        } else {
            // The sender is dropped without a message if the coordinator
            // stops early; the error then surfaces through `JobSheet::wait`.
            let _ = dispatched_rx.await;
        }
        Ok(sheet)
    }
}

struct Coordinator {
    runtime: Arc<dyn Runtime>,
    options: LaunchOptions,
    ledger: DeviceLedger,
    ports: PortPool,
    budget: u64,
    waitlist: VecDeque<Job>,
    board: StatusBoard,
    workers: JoinSet<CohortResult<JobReport>>,
    in_flight: HashMap<task::Id, Job>,
    retries: HashMap<u32, u32>,
    dispatched: usize,
}

impl Coordinator {
    async fn run(
        mut self,
        ready: Vec<Job>,
        dispatched: oneshot::Sender<()>,
    ) -> CohortResult<RunSummary> {
        for job in ready {
            self.dispatch(job).await;
        }
        let _ = dispatched.send(());

        while let Some(joined) = self.workers.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, result)) => (id, Ok(result)),
                Err(e) => (e.id(), Err(e)),
            };
            let Some(job) = self.in_flight.remove(&id) else {
                warn!(task = %id, "Worker finished for an unknown job");
                continue;
            };

            // A panicked or cancelled worker fails its job only
            let result = outcome.unwrap_or_else(|e| {
                Err(CohortError::JobExecution {
                    condition: job.condition.clone(),
                    replicate_id: job.replicate_id,
                    reason: format!("worker task failed: {}", e),
                })
            });
            if let Some(next) = self.settle(job, result).await {
                self.dispatch(next).await;
            }
        }
        self.abandon_waitlist().await;

        let summary = self.board.summary().await;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            total = summary.total,
            "All jobs finished"
        );
        Ok(summary)
    }

    /// Start a ready job's worker, after the stagger delay
    ///
    /// A job that cannot start is failed, and its slot goes to the next
    /// waitlisted job.
    async fn dispatch(&mut self, job: Job) {
        let mut pending = Some(job);
        while let Some(mut job) = pending.take() {
            if self.dispatched > 0 && !self.options.stagger.is_zero() {
                tokio::time::sleep(self.options.stagger).await;
            }
            self.dispatched += 1;

            if let Err(e) = job.mark_running() {
                pending = self.complete(job, Err(e)).await;
                continue;
            }
            self.board.started(&job).await;
            info!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                index = job.index,
                device = job.device(),
                port = job.port(),
                "Dispatched job"
            );

            let runtime = self.runtime.clone();
            let worker = job.clone();
            let handle = self
                .workers
                .spawn(async move { runtime.run_job(&worker).await });
            self.in_flight.insert(handle.id(), job);
        }
    }

    /// Decide what follows a worker's exit: a retry, or a completion
    async fn settle(&mut self, mut job: Job, result: CohortResult<JobReport>) -> Option<Job> {
        match result {
            Err(CohortError::PortConflict(lost)) if self.can_retry(&job) => {
                match self.retry_on_new_port(&mut job, lost) {
                    Ok(()) => Some(job),
                    Err(e) => {
                        error!(
                            condition = %job.condition,
                            replicate_id = job.replicate_id,
                            error = %e,
                            "No port to retry on"
                        );
                        self.complete(job, Err(CohortError::PortConflict(lost)))
                            .await
                    }
                }
            }
            result => self.complete(job, result).await,
        }
    }

    fn can_retry(&self, job: &Job) -> bool {
        self.retries.get(&job.index).copied().unwrap_or(0) < self.options.max_port_retries
    }

    /// Move a job that lost its port race onto the next free port
    fn retry_on_new_port(&mut self, job: &mut Job, lost: u16) -> CohortResult<()> {
        let port = self.ports.allocate()?;
        *self.retries.entry(job.index).or_insert(0) += 1;
        self.ports.release(lost);
        job.mark_retry();
        if let Err(e) = job.rebind_port(port) {
            self.ports.release(port);
            return Err(e);
        }
        warn!(
            condition = %job.condition,
            replicate_id = job.replicate_id,
            lost_port = lost,
            port = port,
            "Port taken by another process, retrying on a new port"
        );
        Ok(())
    }

    /// Record a finished job and bind its slot to the next waitlisted job
    async fn complete(&mut self, mut job: Job, result: CohortResult<JobReport>) -> Option<Job> {
        let success = result.is_ok();
        let lost_port = result.as_ref().err().is_some_and(CohortError::is_transient);
        let slot = job.finish(success);

        match &result {
            Ok(report) => info!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                elapsed_secs = report.elapsed.as_secs(),
                "Job completed"
            ),
            Err(e) => error!(
                condition = %job.condition,
                replicate_id = job.replicate_id,
                device = slot.map(|s| s.device),
                port = slot.map(|s| s.port),
                error = %e,
                "Job failed"
            ),
        }
        self.board.finished(&job, result.as_ref().err()).await;

        let Some(slot) = slot else {
            error!(task = %job.task(), "Finished job held no slot");
            return None;
        };
        if let Err(e) = self.ledger.release(slot.device, self.budget) {
            error!(device = slot.device, error = %e, "Failed to release job memory");
        }
        self.ports.release(slot.port);
        self.promote(slot, lost_port).await
    }

    /// Hand a freed slot to the next waitlisted job that can take it
    async fn promote(&mut self, slot: Slot, lost_port: bool) -> Option<Job> {
        while let Some(mut next) = self.next_waitlisted() {
            match self.bind_slot(&mut next, slot, lost_port) {
                Ok(port) => {
                    debug!(
                        condition = %next.condition,
                        replicate_id = next.replicate_id,
                        device = slot.device,
                        port = port,
                        remaining = self.waitlist.len(),
                        "Promoted job from waitlist"
                    );
                    return Some(next);
                }
                Err(e) => {
                    error!(
                        condition = %next.condition,
                        replicate_id = next.replicate_id,
                        error = %e,
                        "Failed to promote job from waitlist"
                    );
                    next.finish(false);
                    self.board.finished(&next, Some(&e)).await;
                }
            }
        }
        None
    }

    fn next_waitlisted(&mut self) -> Option<Job> {
        match self.options.waitlist_order {
            WaitlistOrder::Fifo => self.waitlist.pop_front(),
            WaitlistOrder::Lifo => self.waitlist.pop_back(),
        }
    }

    fn bind_slot(&mut self, next: &mut Job, slot: Slot, lost_port: bool) -> CohortResult<u16> {
        // A port some other process holds is not handed on
        let port = if lost_port {
            self.ports.allocate()?
        } else {
            self.ports.claim(slot.port)?;
            slot.port
        };
        if let Err(e) = self.ledger.reserve(slot.device, self.budget) {
            self.ports.release(port);
            return Err(e);
        }
        if let Err(e) = next.bind(Slot::new(slot.device, port)) {
            self.ports.release(port);
            if let Err(release) = self.ledger.release(slot.device, self.budget) {
                error!(device = slot.device, error = %release, "Failed to release job memory");
            }
            return Err(e);
        }
        Ok(port)
    }

    /// Fail jobs still waiting once no worker is left to free a slot
    async fn abandon_waitlist(&mut self) {
        while let Some(mut job) = self.waitlist.pop_front() {
            let e = CohortError::Capacity(format!(
                "no slot was freed for job {}",
                job.task()
            ));
            warn!(task = %job.task(), "Waitlisted job never got a slot");
            job.finish(false);
            self.board.finished(&job, Some(&e)).await;
        }
    }
}
