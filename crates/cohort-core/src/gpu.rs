//! GPU detection and memory queries

use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CohortError, CohortResult};

/// Memory snapshot of a single device, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

impl MemoryInfo {
    /// Snapshot of an idle device with `total` bytes
    pub fn idle(total: u64) -> Self {
        Self {
            free: total,
            used: 0,
            total,
        }
    }
}

/// Access to the devices of the local machine
pub trait DeviceDriver: Send + Sync {
    /// Number of visible devices; indices run from 0 to count - 1
    fn device_count(&self) -> CohortResult<u32>;

    /// Current memory usage of a device
    fn memory_info(&self, device: u32) -> CohortResult<MemoryInfo>;

    /// Human-readable device name
    fn device_name(&self, device: u32) -> CohortResult<String> {
        Ok(format!("GPU {}", device))
    }

    /// All visible device indices
    fn list_devices(&self) -> CohortResult<Vec<u32>> {
        Ok((0..self.device_count()?).collect())
    }
}

/// NVIDIA driver backed by NVML
pub struct NvmlDriver {
    nvml: Nvml,
}

impl NvmlDriver {
    /// Initialize NVML
    pub fn new() -> CohortResult<Self> {
        let nvml = Nvml::init()
            .map_err(|e| CohortError::Gpu(format!("NVML initialization failed: {}", e)))?;
        Ok(Self { nvml })
    }
}

impl DeviceDriver for NvmlDriver {
    fn device_count(&self) -> CohortResult<u32> {
        Ok(self.nvml.device_count()?)
    }

    fn memory_info(&self, device: u32) -> CohortResult<MemoryInfo> {
        let handle = self.nvml.device_by_index(device).map_err(|e| {
            CohortError::Gpu(format!("Failed to access GPU device {}: {}", device, e))
        })?;
        let memory = handle.memory_info()?;
        Ok(MemoryInfo {
            free: memory.free,
            used: memory.used,
            total: memory.total,
        })
    }

    fn device_name(&self, device: u32) -> CohortResult<String> {
        Ok(self.nvml.device_by_index(device)?.name()?)
    }
}

/// Driver with a fixed set of devices, for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticDriver {
    devices: Vec<MemoryInfo>,
}

impl StaticDriver {
    pub fn new(devices: Vec<MemoryInfo>) -> Self {
        Self { devices }
    }

    /// `count` idle devices with `total` bytes each
    pub fn uniform(count: u32, total: u64) -> Self {
        Self::new((0..count).map(|_| MemoryInfo::idle(total)).collect())
    }
}

impl DeviceDriver for StaticDriver {
    fn device_count(&self) -> CohortResult<u32> {
        Ok(self.devices.len() as u32)
    }

    fn memory_info(&self, device: u32) -> CohortResult<MemoryInfo> {
        self.devices
            .get(device as usize)
            .copied()
            .ok_or_else(|| CohortError::Gpu(format!("No such device: {}", device)))
    }
}

/// Represents a GPU device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index
    pub index: u32,
    /// Device name
    pub name: String,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Free memory in bytes
    pub memory_free: u64,
    /// Used memory in bytes
    pub memory_used: u64,
}

/// GPU information for the system
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuInfo {
    /// List of detected GPU devices
    pub devices: Vec<GpuDevice>,
    /// Total number of GPUs
    pub total_count: u32,
}

impl GpuInfo {
    /// Create empty GPU info (no GPUs detected)
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            total_count: 0,
        }
    }

    /// Query every visible device of a driver
    pub fn from_driver(driver: &dyn DeviceDriver) -> CohortResult<Self> {
        let mut devices = Vec::new();
        for index in driver.list_devices()? {
            let memory = driver.memory_info(index)?;
            devices.push(GpuDevice {
                index,
                name: driver.device_name(index)?,
                memory_total: memory.total,
                memory_free: memory.free,
                memory_used: memory.used,
            });
        }
        Ok(Self {
            total_count: devices.len() as u32,
            devices,
        })
    }
}

/// Detect GPUs on the system
///
/// Returns empty info when NVML is not available.
pub fn detect_gpus() -> GpuInfo {
    match NvmlDriver::new().and_then(|driver| GpuInfo::from_driver(&driver)) {
        Ok(info) => info,
        Err(e) => {
            debug!(error = %e, "No NVIDIA GPUs detected");
            GpuInfo::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_info_empty() {
        let info = GpuInfo::empty();
        assert_eq!(info.total_count, 0);
        assert!(info.devices.is_empty());
    }

    #[test]
    fn test_static_driver() {
        let driver = StaticDriver::uniform(2, 1024);
        assert_eq!(driver.list_devices().unwrap(), vec![0, 1]);
        assert_eq!(driver.memory_info(1).unwrap().free, 1024);
        assert!(driver.memory_info(2).is_err());
        assert_eq!(driver.device_name(0).unwrap(), "GPU 0");
    }

    #[test]
    fn test_from_driver() {
        let driver = StaticDriver::new(vec![
            MemoryInfo {
                free: 100,
                used: 924,
                total: 1024,
            },
            MemoryInfo {
                free: 900,
                used: 124,
                total: 1024,
            },
            MemoryInfo {
                free: 900,
                used: 124,
                total: 1024,
            },
        ]);
        let info = GpuInfo::from_driver(&driver).unwrap();
        assert_eq!(info.total_count, 3);
        assert_eq!(info.devices[0].memory_used, 924);
        assert_eq!(info.devices[2].memory_free, 900);
    }
}
