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

//! Call-counting in-memory backend for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::device::reading::Reading;
use crate::device::traits::TelemetryBackend;
use crate::device::types::{
    BackendKind, ContextType, DeviceHandle, MemoryInfo, ProcessUtilizationSample, RawProcess,
    ThroughputCounters, UtilizationRates,
};
use crate::error::{Error, Result};

pub const FAKE_TOTAL_MEMORY: u64 = 16 * 1024 * 1024 * 1024;
pub const FAKE_POWER_LIMIT_MW: u32 = 300_000;

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub uuid: Option<String>,
    pub lost: bool,
    pub power_mw: Option<u32>,
    pub compute: Vec<RawProcess>,
    pub graphics: Option<Vec<RawProcess>>,
    pub samples: Option<Vec<ProcessUtilizationSample>>,
    pub counters: VecDeque<ThroughputCounters>,
}

impl FakeDevice {
    fn new(index: u32) -> Self {
        Self {
            uuid: Some(format!("GPU-{index:08x}-0000-0000-0000-00000000abcd")),
            lost: false,
            power_mw: Some(100_000 + index * 1_000),
            compute: Vec::new(),
            graphics: None,
            samples: None,
            counters: VecDeque::new(),
        }
    }
}

pub struct FakeBackend {
    devices: Mutex<Vec<FakeDevice>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    init_failure: Mutex<Option<fn() -> Error>>,
    generation: AtomicU64,
}

impl FakeBackend {
    pub fn with_devices(count: u32) -> Self {
        Self {
            devices: Mutex::new((0..count).map(FakeDevice::new).collect()),
            calls: Mutex::new(HashMap::new()),
            init_failure: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn fail_init(&self, failure: Option<fn() -> Error>) {
        *self.init_failure.lock().unwrap() = failure;
    }

    pub fn update(&self, index: u32, f: impl FnOnce(&mut FakeDevice)) {
        f(&mut self.devices.lock().unwrap()[index as usize]);
    }

    pub fn set_lost(&self, index: u32, lost: bool) {
        self.update(index, |d| d.lost = lost);
    }

    pub fn set_power(&self, index: u32, power_mw: Option<u32>) {
        self.update(index, |d| d.power_mw = power_mw);
    }

    pub fn set_uuid(&self, index: u32, uuid: Option<&str>) {
        self.update(index, |d| d.uuid = uuid.map(str::to_string));
    }

    pub fn push_counters(&self, index: u32, tx: u64, rx: u64, timestamp_us: u64) {
        self.update(index, |d| {
            d.counters.push_back(ThroughputCounters {
                tx: Reading::Value(tx),
                rx: Reading::Value(rx),
                timestamp_us,
            })
        });
    }

    /// Add a device and bump the topology generation.
    pub fn hot_plug(&self) {
        let mut devices = self.devices.lock().unwrap();
        let index = devices.len() as u32;
        devices.push(FakeDevice::new(index));
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, op: &'static str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(op).or_insert(0);
        *count += 1;
        *count
    }

    fn device<T>(
        &self,
        op: &'static str,
        handle: DeviceHandle,
        f: impl FnOnce(&mut FakeDevice, usize) -> Result<T>,
    ) -> Result<T> {
        let call = self.record(op);
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(handle.index() as usize)
            .ok_or_else(|| Error::NotFound(format!("device index {}", handle.index())))?;
        if device.lost {
            return Err(Error::DeviceLost(format!("device {}", handle.index())));
        }
        f(device, call)
    }
}

impl TelemetryBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Custom
    }

    fn initialize(&self) -> Result<()> {
        self.record("initialize");
        match *self.init_failure.lock().unwrap() {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.record("shutdown");
        Ok(())
    }

    fn topology_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn device_count(&self) -> Result<u32> {
        self.record("device_count");
        Ok(self.devices.lock().unwrap().len() as u32)
    }

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle> {
        self.device("handle_by_index", DeviceHandle(index), |_, _| Ok(DeviceHandle(index)))
    }

    fn name(&self, handle: DeviceHandle) -> Result<String> {
        self.device("name", handle, |_, _| Ok("Fake Accelerator".to_string()))
    }

    fn uuid(&self, handle: DeviceHandle) -> Result<String> {
        self.device("uuid", handle, |d, _| {
            d.uuid.clone().ok_or_else(|| Error::not_supported("uuid"))
        })
    }

    fn bus_id(&self, handle: DeviceHandle) -> Result<String> {
        self.device("bus_id", handle, |_, _| {
            Ok(format!("00000000:{:02X}:00.0", handle.index() + 1))
        })
    }

    fn memory_info(&self, handle: DeviceHandle) -> Result<MemoryInfo> {
        // Each call reports one more MiB in use so uncached reads differ.
        self.device("memory_info", handle, |_, call| {
            Ok(MemoryInfo::from_total_used(
                FAKE_TOTAL_MEMORY,
                (call as u64) * 1024 * 1024,
            ))
        })
    }

    fn utilization_rates(&self, handle: DeviceHandle) -> Result<UtilizationRates> {
        self.device("utilization_rates", handle, |_, call| {
            Ok(UtilizationRates {
                compute: Reading::Value((call % 100) as f64),
                memory: Reading::Value(10.0),
                encoder: Reading::NotApplicable,
                decoder: Reading::Value(0.0),
            })
        })
    }

    fn temperature(&self, handle: DeviceHandle) -> Result<u32> {
        self.device("temperature", handle, |_, _| Ok(45))
    }

    fn power_usage(&self, handle: DeviceHandle) -> Result<u32> {
        self.device("power_usage", handle, |d, _| {
            d.power_mw.ok_or_else(|| Error::Parse("power placeholder".into()))
        })
    }

    fn power_limit(&self, handle: DeviceHandle) -> Result<u32> {
        self.device("power_limit", handle, |_, _| Ok(FAKE_POWER_LIMIT_MW))
    }

    fn link_throughput_counters(&self, handle: DeviceHandle) -> Result<ThroughputCounters> {
        self.device("link_throughput_counters", handle, |d, _| {
            d.counters
                .pop_front()
                .ok_or_else(|| Error::not_supported("link_throughput_counters"))
        })
    }

    fn running_processes(
        &self,
        handle: DeviceHandle,
        context: ContextType,
    ) -> Result<Vec<RawProcess>> {
        self.device("running_processes", handle, |d, _| match context {
            ContextType::Compute => Ok(d.compute.clone()),
            ContextType::Graphics => d
                .graphics
                .clone()
                .ok_or_else(|| Error::not_supported("graphics processes")),
        })
    }

    fn process_utilization(
        &self,
        handle: DeviceHandle,
        _since_us: u64,
    ) -> Result<Vec<ProcessUtilizationSample>> {
        self.device("process_utilization", handle, |d, _| {
            d.samples
                .clone()
                .ok_or_else(|| Error::not_supported("process_utilization"))
        })
    }
}
