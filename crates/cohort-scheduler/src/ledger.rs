//! Device ledger for per-device memory accounting
//!
//! Free memory is read from the driver once, when the ledger is built, and
//! only changes through `reserve` and `release` afterwards. Assignment is
//! optimistic: the live device state is never re-checked mid-run.

use cohort_core::{CohortError, CohortResult, DeviceDriver};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    initial_free: u64,
    reserved: u64,
    jobs: u32,
}

impl Entry {
    fn free(&self) -> u64 {
        self.initial_free - self.reserved
    }
}

/// In-memory free memory per authorized device
#[derive(Debug, Clone)]
pub struct DeviceLedger {
    entries: BTreeMap<u32, Entry>,
}

impl DeviceLedger {
    /// Build a ledger from `(device, free bytes)` pairs
    pub fn new(free: impl IntoIterator<Item = (u32, u64)>) -> Self {
        Self {
            entries: free
                .into_iter()
                .map(|(device, initial_free)| {
                    (
                        device,
                        Entry {
                            initial_free,
                            reserved: 0,
                            jobs: 0,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Snapshot free memory of the authorized devices
    pub fn from_driver(driver: &dyn DeviceDriver, devices: &[u32]) -> CohortResult<Self> {
        let mut free = Vec::with_capacity(devices.len());
        for device in devices {
            free.push((*device, driver.memory_info(*device)?.free));
        }
        let ledger = Self::new(free);
        info!(devices = ?ledger.devices(), "Device ledger initialized");
        Ok(ledger)
    }

    /// Resolve the devices a run may use
    ///
    /// Defaults to every visible device; a caller list must be a subset of
    /// the visible devices.
    pub fn authorize(
        driver: &dyn DeviceDriver,
        requested: Option<&[u32]>,
    ) -> CohortResult<Vec<u32>> {
        let visible = driver.list_devices()?;
        let Some(requested) = requested else {
            return Ok(visible);
        };

        let visible_set: BTreeSet<u32> = visible.iter().copied().collect();
        let unknown: Vec<u32> = requested
            .iter()
            .copied()
            .filter(|d| !visible_set.contains(d))
            .collect();
        if !unknown.is_empty() {
            return Err(CohortError::Validation(format!(
                "Custom device list names unknown devices {:?}. Available devices are: {:?}",
                unknown, visible
            )));
        }

        let mut devices: Vec<u32> = Vec::with_capacity(requested.len());
        for device in requested {
            if !devices.contains(device) {
                devices.push(*device);
            }
        }
        Ok(devices)
    }

    /// Devices tracked by the ledger, in ascending order
    pub fn devices(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    /// Free memory currently believed available on a device
    pub fn free(&self, device: u32) -> Option<u64> {
        self.entries.get(&device).map(Entry::free)
    }

    /// Sum of budgets reserved on a device
    pub fn reserved(&self, device: u32) -> Option<u64> {
        self.entries.get(&device).map(|e| e.reserved)
    }

    /// Number of jobs currently holding a reservation on a device
    pub fn job_count(&self, device: u32) -> u32 {
        self.entries.get(&device).map(|e| e.jobs).unwrap_or(0)
    }

    /// Whether a device can take another job needing `required` bytes
    pub fn has_capacity(&self, device: u32, required: u64) -> bool {
        self.free(device).is_some_and(|free| free >= required)
    }

    /// Take `required` bytes out of a device's free memory
    pub fn reserve(&mut self, device: u32, required: u64) -> CohortResult<()> {
        let entry = self
            .entries
            .get_mut(&device)
            .ok_or_else(|| CohortError::Internal(format!("device {} is not in the ledger", device)))?;
        if entry.free() < required {
            return Err(CohortError::Capacity(format!(
                "device {} has {} bytes free, {} requested",
                device,
                entry.free(),
                required
            )));
        }
        entry.reserved += required;
        entry.jobs += 1;
        debug!(device = device, free = entry.free(), "Reserved device memory");
        Ok(())
    }

    /// Give a finished job's budget back to its device
    pub fn release(&mut self, device: u32, amount: u64) -> CohortResult<()> {
        let entry = self
            .entries
            .get_mut(&device)
            .ok_or_else(|| CohortError::Internal(format!("device {} is not in the ledger", device)))?;
        if amount > entry.reserved || entry.jobs == 0 {
            return Err(CohortError::Internal(format!(
                "device {} releases {} bytes but only {} are reserved",
                device, amount, entry.reserved
            )));
        }
        entry.reserved -= amount;
        entry.jobs -= 1;
        debug!(device = device, free = entry.free(), "Released device memory");
        Ok(())
    }
}
