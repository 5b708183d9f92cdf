//! Main scheduler logic
//!
//! One scheduling pass fills devices with jobs until no device in the
//! rotation can hold another budget. Whatever is left goes on the waitlist
//! and is admitted later, as running jobs hand their slots back.

use cohort_core::{CohortError, CohortResult, Job, PlacementPolicy, RunSettings, Slot, Task};
use cohort_network::PortPool;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::DeviceLedger;
use crate::placement::rotation_for;

/// Result of a scheduling pass
#[derive(Debug, Clone, Default)]
pub struct SchedulePlan {
    pub run_id: Uuid,
    /// Jobs bound to a device and port, in dispatch order
    pub ready: Vec<Job>,
    /// Jobs waiting for capacity, in waitlist order
    pub waitlist: Vec<Job>,
}

impl SchedulePlan {
    pub fn len(&self) -> usize {
        self.ready.len() + self.waitlist.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scheduler turning tasks into jobs
pub struct Scheduler {
    settings: Arc<RunSettings>,
    policy: PlacementPolicy,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(settings: Arc<RunSettings>, policy: PlacementPolicy) -> Self {
        Self { settings, policy }
    }

    /// Assign devices and ports to tasks until capacity runs out
    ///
    /// Each device's capacity is checked when it reaches the head of the
    /// rotation; a device found full is dropped for the rest of the pass.
    /// Fails with `CohortError::Capacity` when not a single job fits.
    pub fn schedule(
        &self,
        tasks: BTreeSet<Task>,
        devices: &[u32],
        budget: u64,
        ledger: &mut DeviceLedger,
        ports: &mut PortPool,
    ) -> CohortResult<SchedulePlan> {
        let mut tasks = tasks;
        let mut plan = SchedulePlan {
            run_id: self.settings.run_id,
            ..SchedulePlan::default()
        };
        let mut rotation = rotation_for(self.policy, devices, ledger);

        info!(
            tasks = tasks.len(),
            devices = ?devices,
            budget = budget,
            policy = %self.policy,
            "Scheduling jobs"
        );

        while !tasks.is_empty() {
            let Some(device) = rotation.candidate() else {
                if plan.ready.is_empty() {
                    return Err(CohortError::Capacity(
                        "No jobs could be scheduled. Job size too large for GPUs. \
                         If job_memory = \"auto\", consider setting buffer to 1. \
                         Otherwise, consider setting job_memory to a value less than \
                         or equal to total free GPU memory / buffer."
                            .to_string(),
                    ));
                }
                warn!(
                    waitlisted = tasks.len(),
                    "Insufficient GPU memory. Jobs will be queued until memory is available"
                );
                break;
            };

            if !ledger.has_capacity(device, budget) {
                debug!(device = device, "Device does not have enough memory, removing from rotation");
                rotation.reject(device);
                continue;
            }

            let Some(task) = tasks.pop_first() else {
                break;
            };
            let port = ports.allocate()?;
            ledger.reserve(device, budget)?;
            rotation.assigned(device, ledger);

            let index = plan.ready.len() as u32;
            debug!(
                condition = %task.condition,
                replicate_id = task.replicate_id,
                device = device,
                port = port,
                "Assigned device to job"
            );
            plan.ready
                .push(Job::ready(task, index, Slot::new(device, port), self.settings.clone()));
        }

        let offset = plan.ready.len() as u32;
        plan.waitlist = tasks
            .into_iter()
            .enumerate()
            .map(|(i, task)| Job::waitlisted(task, offset + i as u32, self.settings.clone()))
            .collect();

        info!(
            ready = plan.ready.len(),
            waitlisted = plan.waitlist.len(),
            "Scheduled jobs"
        );

        Ok(plan)
    }
}
