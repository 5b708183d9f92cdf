//! Device memory estimation through a probe job
//!
//! The probe runs the worker once, on the device with the most free memory,
//! and the worker writes the device's used memory to `mem.txt` in its job
//! directory right before exiting. The estimate is that reading minus the
//! reading taken before the probe started.

use cohort_core::{CohortError, CohortResult, DeviceDriver, Job, LaunchConfig, RunSettings, Slot};
use cohort_network::PortPool;
use cohort_runtime::Runtime;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Measures the device memory one job needs
pub struct MemoryEstimator {
    driver: Arc<dyn DeviceDriver>,
    runtime: Arc<dyn Runtime>,
    max_port_retries: u32,
}

impl MemoryEstimator {
    pub fn new(driver: Arc<dyn DeviceDriver>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            driver,
            runtime,
            max_port_retries: LaunchConfig::default().max_port_retries,
        }
    }

    /// Fresh ports tried after the probe loses its port to another process
    pub fn with_port_retries(mut self, max_port_retries: u32) -> Self {
        self.max_port_retries = max_port_retries;
        self
    }

    /// Authorized device with the most free memory, lowest index on ties
    pub fn pick_device(&self, devices: &[u32]) -> CohortResult<u32> {
        let mut best: Option<(u32, u64)> = None;
        for device in devices {
            let free = self.driver.memory_info(*device)?.free;
            if best.map_or(true, |(_, most)| free > most) {
                best = Some((*device, free));
            }
        }
        best.map(|(device, _)| device).ok_or_else(|| {
            CohortError::MemoryEstimation("no authorized devices to probe".to_string())
        })
    }

    /// Run a probe job and return the bytes it used on its device
    ///
    /// The probe's directory is removed and its port released whether or
    /// not the probe succeeds.
    pub async fn estimate(
        &self,
        condition: &str,
        devices: &[u32],
        settings: Arc<RunSettings>,
        ports: &mut PortPool,
    ) -> CohortResult<u64> {
        let device = self.pick_device(devices)?;
        let port = ports.allocate()?;
        let mut job = Job::probe(condition, Slot::new(device, port), settings);

        info!(
            condition = %condition,
            device = device,
            port = port,
            "Estimating job memory"
        );

        let mut retries = 0;
        let result = loop {
            match self.probe(job.clone(), device).await {
                Err(CohortError::PortConflict(lost)) if retries < self.max_port_retries => {
                    retries += 1;
                    let next = match ports.allocate() {
                        Ok(next) => next,
                        Err(e) => break Err(e),
                    };
                    ports.release(lost);
                    if let Err(e) = job.rebind_port(next) {
                        ports.release(next);
                        break Err(e);
                    }
                    warn!(
                        lost_port = lost,
                        port = next,
                        "Probe port taken by another process, retrying on a new port"
                    );
                }
                Err(CohortError::PortConflict(lost)) => {
                    break Err(CohortError::MemoryEstimation(format!(
                        "probe lost port {} after {} port retries",
                        lost, retries
                    )))
                }
                result => break result,
            }
        };

        if let Some(port) = job.port() {
            ports.release(port);
        }
        if job.paths.base.exists() {
            if let Err(e) = std::fs::remove_dir_all(&job.paths.base) {
                warn!(
                    path = %job.paths.base.display(),
                    error = %e,
                    "Failed to remove probe job directory"
                );
            }
        }

        match &result {
            Ok(bytes) => info!(bytes = *bytes, device = device, "Estimated job memory"),
            Err(e) => warn!(error = %e, "Memory estimation failed"),
        }
        result
    }

    async fn probe(&self, job: Job, device: u32) -> CohortResult<u64> {
        let before = self.driver.memory_info(device)?.used;
        debug!(device = device, used = before, "Memory in use before probe");

        let report = job.paths.memory_report();
        let runtime = self.runtime.clone();
        tokio::spawn(async move { runtime.run_job(&job).await })
            .await
            .map_err(|e| CohortError::MemoryEstimation(format!("probe worker panicked: {}", e)))?
            .map_err(|e| match e {
                CohortError::PortConflict(_) => e,
                e => CohortError::MemoryEstimation(format!("probe job failed: {}", e)),
            })?;

        let after = read_memory_report(&report)?;
        if after < before {
            return Err(CohortError::MemoryEstimation(format!(
                "device {} reported {} bytes in use after the probe, {} before",
                device, after, before
            )));
        }
        Ok(after - before)
    }
}

/// Parse the used-bytes figure a probe worker left behind
pub fn read_memory_report(path: &Path) -> CohortResult<u64> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CohortError::MemoryEstimation(format!(
            "probe did not report memory usage at {}: {}",
            path.display(),
            e
        ))
    })?;
    let trimmed = content.trim();
    trimmed.parse::<u64>().map_err(|_| {
        CohortError::MemoryEstimation(format!(
            "invalid memory report {:?} in {}",
            trimmed,
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cohort_core::{MemoryInfo, RunConfig};
    use cohort_network::PortProbe;
    use cohort_runtime::JobReport;
    use std::sync::Mutex;
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct AllFree;

    impl PortProbe for AllFree {
        fn is_available(&self, _port: u16) -> bool {
            true
        }
    }

    /// Driver whose used memory is set by the test
    struct FakeDriver {
        devices: Mutex<Vec<MemoryInfo>>,
    }

    impl FakeDriver {
        fn new(devices: Vec<MemoryInfo>) -> Self {
            Self {
                devices: Mutex::new(devices),
            }
        }
    }

    impl DeviceDriver for FakeDriver {
        fn device_count(&self) -> CohortResult<u32> {
            Ok(self.devices.lock().unwrap().len() as u32)
        }

        fn memory_info(&self, device: u32) -> CohortResult<MemoryInfo> {
            Ok(self.devices.lock().unwrap()[device as usize])
        }
    }

    /// Runtime that writes a fixed memory report, or fails
    struct ProbeRuntime {
        report: Option<String>,
        seen: Mutex<Vec<Job>>,
        conflicts: Mutex<u32>,
    }

    impl ProbeRuntime {
        fn new(report: Option<String>) -> Self {
            Self {
                report,
                seen: Mutex::new(Vec::new()),
                conflicts: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Runtime for ProbeRuntime {
        async fn run_job(&self, job: &Job) -> CohortResult<JobReport> {
            self.seen.lock().unwrap().push(job.clone());
            {
                let mut conflicts = self.conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Err(CohortError::PortConflict(job.port().unwrap()));
                }
            }
            job.paths.create_all()?;
            match &self.report {
                Some(report) => {
                    std::fs::write(job.paths.memory_report(), report)?;
                    Ok(JobReport {
                        exit_code: Some(0),
                        elapsed: Duration::from_millis(1),
                    })
                }
                None => Err(CohortError::JobExecution {
                    condition: job.condition.clone(),
                    replicate_id: job.replicate_id,
                    reason: "exit status 1".to_string(),
                }),
            }
        }

        fn name(&self) -> &'static str {
            "probe"
        }
    }

    fn device(used: u64) -> MemoryInfo {
        MemoryInfo {
            free: 16 * GIB - used,
            used,
            total: 16 * GIB,
        }
    }

    fn settings(dir: &Path) -> Arc<RunSettings> {
        let mut config = RunConfig::new(dir);
        config.training.save_checkpoints = true;
        Arc::new(RunSettings::from_config(&config))
    }

    #[tokio::test]
    async fn test_estimate_is_post_minus_pre() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![device(2_000_000_000)]));
        let runtime = Arc::new(ProbeRuntime::new(Some("2450000000\n".to_string())));
        let estimator = MemoryEstimator::new(driver, runtime.clone());
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        let bytes = estimator
            .estimate("object1", &[0], settings(dir.path()), &mut ports)
            .await
            .unwrap();

        assert_eq!(bytes, 450_000_000);
        assert_eq!(ports.in_use_count(), 0);

        let seen = runtime.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].estimate_memory);
        assert_eq!(seen[0].replicate_id, 0);
        assert!(!seen[0].save_checkpoints());
        assert_eq!(seen[0].slot(), Some(Slot::new(0, 5004)));
        assert!(!seen[0].paths.base.exists());
    }

    #[tokio::test]
    async fn test_probe_runs_on_most_free_device() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![
            device(8 * GIB),
            device(GIB),
            device(GIB),
        ]));
        let runtime = Arc::new(ProbeRuntime::new(Some((2 * GIB).to_string())));
        let estimator = MemoryEstimator::new(driver, runtime.clone());
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        assert_eq!(estimator.pick_device(&[0, 2]).unwrap(), 2);
        let bytes = estimator
            .estimate("a", &[0, 1, 2], settings(dir.path()), &mut ports)
            .await
            .unwrap();
        assert_eq!(bytes, GIB);
        assert_eq!(runtime.seen.lock().unwrap()[0].device(), Some(1));
    }

    #[tokio::test]
    async fn test_failed_probe_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![device(GIB)]));
        let runtime = Arc::new(ProbeRuntime::new(None));
        let estimator = MemoryEstimator::new(driver, runtime.clone());
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        let err = estimator
            .estimate("a", &[0], settings(dir.path()), &mut ports)
            .await
            .unwrap_err();

        assert!(matches!(err, CohortError::MemoryEstimation(_)));
        assert_eq!(ports.in_use_count(), 0);
        assert!(!runtime.seen.lock().unwrap()[0].paths.base.exists());
    }

    #[tokio::test]
    async fn test_usage_below_baseline_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![device(3 * GIB)]));
        let runtime = Arc::new(ProbeRuntime::new(Some(GIB.to_string())));
        let estimator = MemoryEstimator::new(driver, runtime);
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        let result = estimator
            .estimate("a", &[0], settings(dir.path()), &mut ports)
            .await;
        assert!(matches!(result, Err(CohortError::MemoryEstimation(_))));
    }

    #[tokio::test]
    async fn test_probe_retries_on_port_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![device(GIB)]));
        let runtime = Arc::new(ProbeRuntime::new(Some((3 * GIB).to_string())));
        *runtime.conflicts.lock().unwrap() = 1;
        let estimator = MemoryEstimator::new(driver, runtime.clone());
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        let bytes = estimator
            .estimate("a", &[0], settings(dir.path()), &mut ports)
            .await
            .unwrap();

        assert_eq!(bytes, 2 * GIB);
        assert_eq!(ports.in_use_count(), 0);
        let ports_tried: Vec<Option<u16>> =
            runtime.seen.lock().unwrap().iter().map(Job::port).collect();
        assert_eq!(ports_tried, vec![Some(5004), Some(5005)]);
    }

    #[tokio::test]
    async fn test_probe_port_retries_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![device(GIB)]));
        let runtime = Arc::new(ProbeRuntime::new(Some((3 * GIB).to_string())));
        *runtime.conflicts.lock().unwrap() = 5;
        let estimator = MemoryEstimator::new(driver, runtime.clone()).with_port_retries(2);
        let mut ports = PortPool::with_probe(5004, Box::new(AllFree));

        let err = estimator
            .estimate("a", &[0], settings(dir.path()), &mut ports)
            .await
            .unwrap_err();

        assert!(matches!(err, CohortError::MemoryEstimation(_)));
        assert_eq!(runtime.seen.lock().unwrap().len(), 3);
        assert_eq!(ports.in_use_count(), 0);
    }

    #[test]
    fn test_read_memory_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.txt");
        assert!(read_memory_report(&path).is_err());

        std::fs::write(&path, "12345\n").unwrap();
        assert_eq!(read_memory_report(&path).unwrap(), 12345);

        std::fs::write(&path, "lots").unwrap();
        assert!(read_memory_report(&path).is_err());
    }
}
