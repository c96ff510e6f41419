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

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::device::physical::Device;
use crate::device::reading::Reading;
use crate::device::types::{ClockInfos, LoadingIntensity, ThroughputInfo, UtilizationRates};

/// Point-in-time copy of a device's fields, read inside one oneshot scope.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    #[serde(skip)]
    pub real: Device,
    pub timestamp: DateTime<Local>,
    pub index: usize,
    pub physical_index: u32,
    pub name: Reading<String>,
    pub uuid: String,
    pub bus_id: Reading<String>,
    pub health: Reading<String>,
    pub is_lost: bool,

    pub memory_total: Reading<u64>,
    pub memory_used: Reading<u64>,
    pub memory_free: Reading<u64>,
    pub memory_percent: Reading<f64>,
    pub memory_total_human: String,
    pub memory_used_human: String,
    pub memory_free_human: String,
    pub memory_usage: Reading<String>,

    pub utilization: UtilizationRates,
    pub clocks: ClockInfos,
    pub max_clocks: ClockInfos,

    pub temperature: Reading<u32>,
    pub fan_speed: Reading<u32>,
    pub power_usage: Reading<u32>,
    pub power_limit: Reading<u32>,
    pub power_status: String,

    pub pcie_throughput: ThroughputInfo,
    pub link_throughput: ThroughputInfo,
    pub performance_state: Reading<String>,
    pub compute_mode: Reading<String>,
    pub total_volatile_uncorrected_ecc_errors: Reading<u64>,

    pub memory_loading_intensity: LoadingIntensity,
    pub compute_loading_intensity: LoadingIntensity,
    pub loading_intensity: LoadingIntensity,
    pub display_color: &'static str,
}

impl DeviceSnapshot {
    pub fn compute_utilization(&self) -> Reading<f64> {
        self.utilization.compute
    }

    pub fn memory_utilization(&self) -> Reading<f64> {
        self.utilization.memory
    }
}

impl Device {
    /// Read every snapshot field once, in a fixed order, inside a oneshot
    /// scope. Nested calls reuse the caller's scope.
    pub fn as_snapshot(&self) -> DeviceSnapshot {
        let _scope = self.oneshot();
        DeviceSnapshot {
            real: self.clone(),
            timestamp: Local::now(),
            index: self.index(),
            physical_index: self.physical_index(),
            name: self.name(),
            uuid: self.uuid().to_string(),
            bus_id: self.bus_id(),
            health: self.health(),
            memory_total: self.memory_total(),
            memory_used: self.memory_used(),
            memory_free: self.memory_free(),
            memory_percent: self.memory_percent(),
            memory_total_human: self.memory_total_human(),
            memory_used_human: self.memory_used_human(),
            memory_free_human: self.memory_free_human(),
            memory_usage: self.memory_usage(),
            utilization: self.utilization_rates(),
            clocks: self.clock_infos(),
            max_clocks: self.max_clock_infos(),
            temperature: self.temperature(),
            fan_speed: self.fan_speed(),
            power_usage: self.power_usage(),
            power_limit: self.power_limit(),
            power_status: self.power_status(),
            pcie_throughput: self.pcie_throughput(),
            link_throughput: self.link_throughput(),
            performance_state: self.performance_state(),
            compute_mode: self.compute_mode(),
            total_volatile_uncorrected_ecc_errors: self.total_volatile_uncorrected_ecc_errors(),
            memory_loading_intensity: self.memory_loading_intensity(),
            compute_loading_intensity: self.compute_loading_intensity(),
            loading_intensity: self.loading_intensity(),
            display_color: self.display_color(),
            is_lost: self.is_lost(),
        }
    }
}

/// Snapshots of several devices, each taken in its own scope.
pub fn take_snapshots(devices: &[Device]) -> Vec<DeviceSnapshot> {
    devices.iter().map(Device::as_snapshot).collect()
}
