// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{OnceLock, PoisonError, RwLock};

use nvml_wrapper::enum_wrappers::device::{
    Clock, EccCounter, MemoryError, PcieUtilCounter, PerformanceState, TemperatureSensor,
};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::struct_wrappers::device::ProcessInfo;
use nvml_wrapper::{cuda_driver_version_major, cuda_driver_version_minor, Nvml};
use tracing::{debug, info};

use crate::common::config::AppConfig;
use crate::device::reading::Reading;
use crate::device::traits::TelemetryBackend;
use crate::device::types::{
    BackendKind, ClockInfos, ContextType, DeviceHandle, MemoryInfo, ProcessUtilizationSample,
    RawProcess, ThroughputInfo, UtilizationRates,
};
use crate::error::{Error, Result};

impl From<NvmlError> for Error {
    fn from(err: NvmlError) -> Self {
        match err {
            NvmlError::LibloadingError(e) => Error::LibraryNotFound(e.to_string()),
            NvmlError::LibraryNotFound => Error::LibraryNotFound("libnvidia-ml".to_string()),
            NvmlError::DriverNotLoaded => Error::DriverNotLoaded,
            NvmlError::GpuLost => Error::DeviceLost("GPU has fallen off the bus".to_string()),
            NvmlError::NotSupported => Error::NotSupported("NVML".to_string()),
            NvmlError::FunctionNotFound => Error::NotSupported("NVML function".to_string()),
            NvmlError::NotFound => Error::NotFound("NVML".to_string()),
            NvmlError::InvalidArg => Error::InvalidArgument("NVML".to_string()),
            NvmlError::Uninitialized => Error::Uninitialized,
            other => Error::Backend(other.to_string()),
        }
    }
}

/// Binary-library backend over NVML.
///
/// The library handle lives between `initialize` and `shutdown`. Handles are
/// NVML device indices; every call re-resolves the device so a handle never
/// outlives the library it came from.
pub struct NvmlBackend {
    nvml: RwLock<Option<Nvml>>,
    driver_version: OnceLock<String>,
    runtime_version: OnceLock<String>,
}

impl Default for NvmlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmlBackend {
    pub fn new() -> Self {
        Self {
            nvml: RwLock::new(None),
            driver_version: OnceLock::new(),
            runtime_version: OnceLock::new(),
        }
    }

    /// Probe whether the library loads and the driver answers.
    pub fn is_available() -> bool {
        match Nvml::init() {
            Ok(nvml) => {
                let ok = nvml.device_count().is_ok();
                let _ = nvml.shutdown();
                ok
            }
            Err(e) => {
                debug!("NVML unavailable: {e}");
                false
            }
        }
    }

    fn with_nvml<T>(&self, f: impl FnOnce(&Nvml) -> Result<T>) -> Result<T> {
        let guard = self.nvml.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(nvml) => f(nvml),
            None => Err(Error::Uninitialized),
        }
    }

    fn with_device<T>(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&nvml_wrapper::Device<'_>) -> std::result::Result<T, NvmlError>,
    ) -> Result<T> {
        self.with_nvml(|nvml| {
            let device = nvml.device_by_index(handle.index()).map_err(|e| match e {
                NvmlError::InvalidArg => Error::NotFound(format!("GPU {}", handle.index())),
                other => lost_with_index(other, handle),
            })?;
            f(&device).map_err(|e| lost_with_index(e, handle))
        })
    }
}

fn lost_with_index(err: NvmlError, handle: DeviceHandle) -> Error {
    match err {
        NvmlError::GpuLost => Error::DeviceLost(format!("GPU {}", handle.index())),
        other => other.into(),
    }
}

/// Read one NVML field, folding "not supported" into `NotApplicable`.
fn optional<T>(
    result: std::result::Result<T, NvmlError>,
) -> std::result::Result<Reading<T>, NvmlError> {
    match result {
        Ok(value) => Ok(Reading::Value(value)),
        Err(NvmlError::NotSupported | NvmlError::FunctionNotFound | NvmlError::NoPermission) => {
            Ok(Reading::NotApplicable)
        }
        Err(e) => Err(e),
    }
}

fn performance_state_label(state: PerformanceState) -> String {
    let level = match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        PerformanceState::Unknown => return "Unknown".to_string(),
    };
    format!("P{level}")
}

fn raw_process(info: ProcessInfo) -> RawProcess {
    let used_memory = match info.used_gpu_memory {
        UsedGpuMemory::Used(bytes) => Reading::Value(bytes),
        UsedGpuMemory::Unavailable => Reading::NotApplicable,
    };
    RawProcess {
        pid: info.pid,
        used_memory,
        name: None,
    }
}

impl TelemetryBackend for NvmlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nvml
    }

    fn initialize(&self) -> Result<()> {
        let mut guard = self.nvml.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let nvml = Nvml::init()?;
            info!("NVML initialized");
            *guard = Some(nvml);
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let taken = self
            .nvml
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(nvml) = taken {
            nvml.shutdown()?;
            info!("NVML shut down");
        }
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        self.with_nvml(|nvml| Ok(nvml.device_count()?.min(AppConfig::MAX_DEVICES)))
    }

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle> {
        let handle = DeviceHandle(index);
        self.with_device(handle, |_| Ok(()))?;
        Ok(handle)
    }

    fn handle_by_uuid(&self, uuid: &str) -> Result<DeviceHandle> {
        self.with_nvml(|nvml| {
            let device = nvml.device_by_uuid(uuid).map_err(|e| match e {
                NvmlError::InvalidArg => Error::NotFound(uuid.to_string()),
                other => other.into(),
            })?;
            Ok(DeviceHandle(device.index()?))
        })
    }

    fn handle_by_bus_id(&self, bus_id: &str) -> Result<DeviceHandle> {
        self.with_nvml(|nvml| {
            let device = nvml.device_by_pci_bus_id(bus_id).map_err(|e| match e {
                NvmlError::InvalidArg => Error::NotFound(bus_id.to_string()),
                other => other.into(),
            })?;
            Ok(DeviceHandle(device.index()?))
        })
    }

    fn driver_version(&self) -> Result<String> {
        if let Some(version) = self.driver_version.get() {
            return Ok(version.clone());
        }
        let version = self.with_nvml(|nvml| Ok(nvml.sys_driver_version()?))?;
        Ok(self.driver_version.get_or_init(|| version).clone())
    }

    fn runtime_version(&self) -> Result<String> {
        if let Some(version) = self.runtime_version.get() {
            return Ok(version.clone());
        }
        let raw = self.with_nvml(|nvml| Ok(nvml.sys_cuda_driver_version()?))?;
        let version = format!(
            "{}.{}",
            cuda_driver_version_major(raw),
            cuda_driver_version_minor(raw)
        );
        Ok(self.runtime_version.get_or_init(|| version).clone())
    }

    fn name(&self, handle: DeviceHandle) -> Result<String> {
        self.with_device(handle, |d| d.name())
    }

    fn uuid(&self, handle: DeviceHandle) -> Result<String> {
        self.with_device(handle, |d| d.uuid())
    }

    fn bus_id(&self, handle: DeviceHandle) -> Result<String> {
        self.with_device(handle, |d| Ok(d.pci_info()?.bus_id))
    }

    fn memory_info(&self, handle: DeviceHandle) -> Result<MemoryInfo> {
        self.with_device(handle, |d| {
            let mem = d.memory_info()?;
            Ok(MemoryInfo::new(
                Reading::Value(mem.total),
                Reading::Value(mem.free),
                Reading::Value(mem.used),
            ))
        })
    }

    fn utilization_rates(&self, handle: DeviceHandle) -> Result<UtilizationRates> {
        self.with_device(handle, |d| {
            let rates = optional(d.utilization_rates())?;
            let encoder = optional(d.encoder_utilization())?;
            let decoder = optional(d.decoder_utilization())?;
            Ok(UtilizationRates {
                compute: rates.as_ref().map(|r| r.gpu as f64),
                memory: rates.as_ref().map(|r| r.memory as f64),
                encoder: encoder.map(|u| u.utilization as f64),
                decoder: decoder.map(|u| u.utilization as f64),
            })
        })
    }

    fn clock_infos(&self, handle: DeviceHandle) -> Result<ClockInfos> {
        self.with_device(handle, |d| {
            Ok(ClockInfos {
                graphics: optional(d.clock_info(Clock::Graphics))?,
                sm: optional(d.clock_info(Clock::SM))?,
                memory: optional(d.clock_info(Clock::Memory))?,
                video: optional(d.clock_info(Clock::Video))?,
            })
        })
    }

    fn max_clock_infos(&self, handle: DeviceHandle) -> Result<ClockInfos> {
        self.with_device(handle, |d| {
            Ok(ClockInfos {
                graphics: optional(d.max_clock_info(Clock::Graphics))?,
                sm: optional(d.max_clock_info(Clock::SM))?,
                memory: optional(d.max_clock_info(Clock::Memory))?,
                video: optional(d.max_clock_info(Clock::Video))?,
            })
        })
    }

    fn temperature(&self, handle: DeviceHandle) -> Result<u32> {
        self.with_device(handle, |d| d.temperature(TemperatureSensor::Gpu))
    }

    fn fan_speed(&self, handle: DeviceHandle) -> Result<u32> {
        self.with_device(handle, |d| d.fan_speed(0))
    }

    fn power_usage(&self, handle: DeviceHandle) -> Result<u32> {
        self.with_device(handle, |d| d.power_usage())
    }

    fn power_limit(&self, handle: DeviceHandle) -> Result<u32> {
        self.with_device(handle, |d| d.power_management_limit())
    }

    fn pcie_throughput(&self, handle: DeviceHandle) -> Result<ThroughputInfo> {
        self.with_device(handle, |d| {
            Ok(ThroughputInfo {
                tx: optional(d.pcie_throughput(PcieUtilCounter::Send))?.map(u64::from),
                rx: optional(d.pcie_throughput(PcieUtilCounter::Receive))?.map(u64::from),
            })
        })
    }

    fn performance_state(&self, handle: DeviceHandle) -> Result<String> {
        self.with_device(handle, |d| d.performance_state().map(performance_state_label))
    }

    fn compute_mode(&self, handle: DeviceHandle) -> Result<String> {
        self.with_device(handle, |d| d.compute_mode().map(|mode| format!("{mode:?}")))
    }

    fn total_volatile_uncorrected_ecc_errors(&self, handle: DeviceHandle) -> Result<u64> {
        self.with_device(handle, |d| {
            d.total_ecc_errors(MemoryError::Uncorrected, EccCounter::Volatile)
        })
    }

    fn running_processes(
        &self,
        handle: DeviceHandle,
        context: ContextType,
    ) -> Result<Vec<RawProcess>> {
        self.with_device(handle, |d| {
            let listed = match context {
                ContextType::Compute => d.running_compute_processes()?,
                ContextType::Graphics => d.running_graphics_processes()?,
            };
            Ok(listed.into_iter().map(raw_process).collect())
        })
    }

    fn process_utilization(
        &self,
        handle: DeviceHandle,
        since_us: u64,
    ) -> Result<Vec<ProcessUtilizationSample>> {
        self.with_device(handle, |d| {
            let samples = match d.process_utilization_stats(since_us) {
                Ok(samples) => samples,
                // NVML reports "no samples since the timestamp" as not found.
                Err(NvmlError::NotFound) => Vec::new(),
                Err(e) => return Err(e),
            };
            Ok(samples
                .into_iter()
                .map(|s| ProcessUtilizationSample {
                    pid: s.pid,
                    timestamp_us: s.timestamp,
                    compute: Reading::Value(s.sm_util as f64),
                    memory: Reading::Value(s.mem_util as f64),
                    encoder: Reading::Value(s.enc_util as f64),
                    decoder: Reading::Value(s.dec_util as f64),
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(Error::from(NvmlError::DriverNotLoaded).is_backend_unavailable());
        assert!(Error::from(NvmlError::LibraryNotFound).is_backend_unavailable());
        assert!(Error::from(NvmlError::GpuLost).is_device_lost());
        assert!(Error::from(NvmlError::NotSupported).is_not_supported());
        assert!(matches!(
            Error::from(NvmlError::Unknown),
            Error::Backend(_)
        ));
        assert!(lost_with_index(NvmlError::GpuLost, DeviceHandle(3))
            .to_string()
            .contains("GPU 3"));
    }

    #[test]
    fn test_performance_state_label() {
        assert_eq!(performance_state_label(PerformanceState::Zero), "P0");
        assert_eq!(performance_state_label(PerformanceState::Eight), "P8");
        assert_eq!(performance_state_label(PerformanceState::Unknown), "Unknown");
    }

    #[test]
    fn test_optional_folds_not_supported() {
        assert_eq!(optional::<u32>(Err(NvmlError::NotSupported)).unwrap(), Reading::NotApplicable);
        assert_eq!(optional(Ok(5u32)).unwrap(), Reading::Value(5));
        assert!(optional::<u32>(Err(NvmlError::GpuLost)).is_err());
    }

    #[test]
    fn test_uninitialized_backend_refuses_queries() {
        let backend = NvmlBackend::new();
        assert!(matches!(backend.device_count(), Err(Error::Uninitialized)));
        assert!(matches!(
            backend.name(DeviceHandle(0)),
            Err(Error::Uninitialized)
        ));
        assert!(backend.shutdown().is_ok());
    }
}
