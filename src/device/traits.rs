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

use crate::device::types::{
    BackendKind, ClockInfos, ContextType, DeviceHandle, DeviceIdentity, MemoryInfo,
    ProcessUtilizationSample, RawProcess, ThroughputCounters, ThroughputInfo, UtilizationRates,
};
use crate::error::{Error, Result};

/// Capability table of a telemetry backend.
///
/// Every accessor has a default body returning [`Error::NotSupported`], so a
/// backend only implements what it can actually produce and callers never
/// need to probe capabilities first. Power is in milliwatts, temperature in
/// degrees Celsius, clocks in MHz, throughput in KiB/s.
pub trait TelemetryBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Connect to the backend. Called at most once per open session.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Changes whenever the set of devices the backend sees changes.
    fn topology_generation(&self) -> u64 {
        0
    }

    fn device_count(&self) -> Result<u32>;

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle> {
        let count = self.device_count()?;
        if index < count {
            Ok(DeviceHandle(index))
        } else {
            Err(Error::NotFound(format!("device index {index}")))
        }
    }

    fn handle_by_uuid(&self, uuid: &str) -> Result<DeviceHandle> {
        for index in 0..self.device_count()? {
            let handle = self.handle_by_index(index)?;
            let candidate = self
                .uuid(handle)
                .unwrap_or_else(|_| DeviceIdentity::placeholder_uuid(self.kind(), index));
            if candidate.eq_ignore_ascii_case(uuid) {
                return Ok(handle);
            }
        }
        Err(Error::NotFound(format!("device uuid {uuid}")))
    }

    fn handle_by_bus_id(&self, bus_id: &str) -> Result<DeviceHandle> {
        for index in 0..self.device_count()? {
            let handle = self.handle_by_index(index)?;
            if let Ok(candidate) = self.bus_id(handle) {
                if candidate.eq_ignore_ascii_case(bus_id) {
                    return Ok(handle);
                }
            }
        }
        Err(Error::NotFound(format!("device bus id {bus_id}")))
    }

    /// Physical index behind a handle.
    fn index(&self, handle: DeviceHandle) -> Result<u32> {
        Ok(handle.index())
    }

    fn driver_version(&self) -> Result<String> {
        Err(Error::not_supported("driver_version"))
    }

    /// Version of the compute runtime (CUDA, CANN, ...).
    fn runtime_version(&self) -> Result<String> {
        Err(Error::not_supported("runtime_version"))
    }

    fn name(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("name"))
    }

    fn uuid(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("uuid"))
    }

    fn bus_id(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("bus_id"))
    }

    fn health(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("health"))
    }

    fn memory_info(&self, _handle: DeviceHandle) -> Result<MemoryInfo> {
        Err(Error::not_supported("memory_info"))
    }

    fn utilization_rates(&self, _handle: DeviceHandle) -> Result<UtilizationRates> {
        Err(Error::not_supported("utilization_rates"))
    }

    fn clock_infos(&self, _handle: DeviceHandle) -> Result<ClockInfos> {
        Err(Error::not_supported("clock_infos"))
    }

    fn max_clock_infos(&self, _handle: DeviceHandle) -> Result<ClockInfos> {
        Err(Error::not_supported("max_clock_infos"))
    }

    fn temperature(&self, _handle: DeviceHandle) -> Result<u32> {
        Err(Error::not_supported("temperature"))
    }

    fn fan_speed(&self, _handle: DeviceHandle) -> Result<u32> {
        Err(Error::not_supported("fan_speed"))
    }

    fn power_usage(&self, _handle: DeviceHandle) -> Result<u32> {
        Err(Error::not_supported("power_usage"))
    }

    fn power_limit(&self, _handle: DeviceHandle) -> Result<u32> {
        Err(Error::not_supported("power_limit"))
    }

    fn pcie_throughput(&self, _handle: DeviceHandle) -> Result<ThroughputInfo> {
        Err(Error::not_supported("pcie_throughput"))
    }

    /// Cumulative link counters; rates are derived by the caller.
    fn link_throughput_counters(&self, _handle: DeviceHandle) -> Result<ThroughputCounters> {
        Err(Error::not_supported("link_throughput_counters"))
    }

    fn performance_state(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("performance_state"))
    }

    fn compute_mode(&self, _handle: DeviceHandle) -> Result<String> {
        Err(Error::not_supported("compute_mode"))
    }

    fn total_volatile_uncorrected_ecc_errors(&self, _handle: DeviceHandle) -> Result<u64> {
        Err(Error::not_supported("total_volatile_uncorrected_ecc_errors"))
    }

    fn running_processes(
        &self,
        _handle: DeviceHandle,
        context: ContextType,
    ) -> Result<Vec<RawProcess>> {
        Err(Error::not_supported(format!("running_processes({context:?})")))
    }

    /// Utilization samples taken after `since_us` (microseconds since epoch).
    fn process_utilization(
        &self,
        _handle: DeviceHandle,
        _since_us: u64,
    ) -> Result<Vec<ProcessUtilizationSample>> {
        Err(Error::not_supported("process_utilization"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl TelemetryBackend for Minimal {
        fn kind(&self) -> BackendKind {
            BackendKind::Custom
        }

        fn device_count(&self) -> Result<u32> {
            Ok(2)
        }

        fn uuid(&self, handle: DeviceHandle) -> Result<String> {
            if handle.index() == 0 {
                Ok("DEV-aa".to_string())
            } else {
                Err(Error::not_supported("uuid"))
            }
        }
    }

    #[test]
    fn test_defaults_are_not_supported() {
        let backend = Minimal;
        let handle = DeviceHandle(0);
        assert!(backend.memory_info(handle).unwrap_err().is_not_supported());
        assert!(backend.power_usage(handle).unwrap_err().is_not_supported());
        assert!(backend
            .running_processes(handle, ContextType::Graphics)
            .unwrap_err()
            .is_not_supported());
    }

    #[test]
    fn test_default_handle_lookups() {
        let backend = Minimal;
        assert_eq!(backend.handle_by_index(1).unwrap(), DeviceHandle(1));
        assert!(matches!(backend.handle_by_index(2), Err(Error::NotFound(_))));
        assert_eq!(backend.handle_by_uuid("dev-AA").unwrap(), DeviceHandle(0));
        // Falls back to the placeholder for devices without a UUID.
        assert_eq!(backend.handle_by_uuid("DEVICE-01").unwrap(), DeviceHandle(1));
        assert!(backend.handle_by_bus_id("0000:00:00.0").is_err());
    }
}
