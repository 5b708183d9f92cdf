//! Run orchestration from configuration to launched jobs

use cohort_core::{
    build_task_set, CohortError, CohortResult, DeviceDriver, JobView, RunConfig, RunSettings,
};
use cohort_network::{PortPool, PortProbe};
use cohort_runtime::Runtime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::estimator::MemoryEstimator;
use crate::launcher::{LaunchOptions, Launcher};
use crate::ledger::DeviceLedger;
use crate::scheduler::{SchedulePlan, Scheduler};
use crate::sheet::JobSheet;

/// Schedule of a run that has not been launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub run_id: Uuid,
    pub devices: Vec<u32>,
    /// Buffered bytes reserved per job
    pub budget: u64,
    pub ready: Vec<JobView>,
    pub waitlist: Vec<JobView>,
}

struct Prepared {
    devices: Vec<u32>,
    budget: u64,
    settings: Arc<RunSettings>,
    plan: SchedulePlan,
    ledger: DeviceLedger,
    ports: PortPool,
}

/// One configured run over a set of devices
pub struct Experiment {
    config: RunConfig,
    driver: Arc<dyn DeviceDriver>,
    runtime: Arc<dyn Runtime>,
    port_probe: Option<Box<dyn PortProbe>>,
}

impl Experiment {
    pub fn new(config: RunConfig, driver: Arc<dyn DeviceDriver>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            config,
            driver,
            runtime,
            port_probe: None,
        }
    }

    /// Check port availability with `probe` instead of binding local sockets
    pub fn with_port_probe(mut self, probe: Box<dyn PortProbe>) -> Self {
        self.port_probe = Some(probe);
        self
    }

    /// Validate, schedule and launch a run in one call
    pub async fn run(
        config: RunConfig,
        driver: Arc<dyn DeviceDriver>,
        runtime: Arc<dyn Runtime>,
    ) -> CohortResult<JobSheet> {
        Self::new(config, driver, runtime).launch().await
    }

    /// Launch every job of the run
    ///
    /// Returns after the initial dispatch, or after the last job when the
    /// run is synchronous.
    pub async fn launch(self) -> CohortResult<JobSheet> {
        let options = LaunchOptions::from_config(&self.config.launch);
        let launcher = Launcher::new(self.runtime.clone(), options);
        let prepared = self.prepare().await?;
        info!(
            run_id = %prepared.settings.run_id,
            devices = ?prepared.devices,
            budget = prepared.budget,
            "Starting run"
        );
        launcher
            .launch(prepared.plan, prepared.ledger, prepared.ports, prepared.budget)
            .await
    }

    /// Compute the schedule without starting any job
    ///
    /// With `job_memory = "auto"` this still runs the probe job.
    pub async fn plan(self) -> CohortResult<RunPlan> {
        let prepared = self.prepare().await?;
        Ok(RunPlan {
            run_id: prepared.plan.run_id,
            devices: prepared.devices,
            budget: prepared.budget,
            ready: prepared.plan.ready.iter().map(JobView::from_job).collect(),
            waitlist: prepared.plan.waitlist.iter().map(JobView::from_job).collect(),
        })
    }

    async fn prepare(self) -> CohortResult<Prepared> {
        let Self {
            config,
            driver,
            runtime,
            port_probe,
        } = self;

        // Caller input is checked before any device or port is touched
        config.validate()?;
        let tasks = build_task_set(
            config.replicates,
            &config.conditions.known,
            config.conditions.selected.as_deref(),
        )?;
        let devices = DeviceLedger::authorize(driver.as_ref(), config.resources.devices.as_deref())?;

        std::fs::create_dir_all(&config.output_dir)?;
        let settings = Arc::new(RunSettings::from_config(&config));
        let mut ports = match port_probe {
            Some(probe) => PortPool::with_probe(config.launch.base_port, probe),
            None => PortPool::new(config.launch.base_port),
        };

        let required = match config.resources.job_memory.explicit_bytes() {
            Some(bytes) => bytes,
            None => {
                let condition = tasks
                    .first()
                    .map(|t| t.condition.clone())
                    .ok_or_else(|| CohortError::Validation("no tasks to run".to_string()))?;
                MemoryEstimator::new(driver.clone(), runtime)
                    .with_port_retries(config.launch.max_port_retries)
                    .estimate(&condition, &devices, settings.clone(), &mut ports)
                    .await?
            }
        };
        let budget = config.resources.buffered(required);
        info!(
            job_memory = %config.resources.job_memory,
            required = required,
            buffer = config.resources.buffer,
            budget = budget,
            "Resolved per-job memory budget"
        );

        let mut ledger = DeviceLedger::from_driver(driver.as_ref(), &devices)?;
        let plan = Scheduler::new(settings.clone(), config.resources.placement).schedule(
            tasks,
            &devices,
            budget,
            &mut ledger,
            &mut ports,
        )?;

        Ok(Prepared {
            devices,
            budget,
            settings,
            plan,
            ledger,
            ports,
        })
    }
}
