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

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};

use crate::common::config::AppConfig;
use crate::device::physical::Device;
use crate::device::reading::{percent_of, Reading};
use crate::device::types::{ContextType, ProcessUtilizationSample, RawProcess};
use crate::utils::now_micros;

/// A process holding a context on one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProcess {
    pub pid: u32,
    pub device_index: usize,
    pub device_uuid: String,
    /// Name as reported by the device backend, if it reports one.
    pub name: Option<String>,
    pub memory_used: Reading<u64>,
    pub compute_context: bool,
    pub graphics_context: bool,
    pub compute_utilization: Reading<f64>,
    pub memory_utilization: Reading<f64>,
    pub encoder_utilization: Reading<f64>,
    pub decoder_utilization: Reading<f64>,
}

impl DeviceProcess {
    fn new(device: &Device, pid: u32) -> Self {
        Self {
            pid,
            device_index: device.index(),
            device_uuid: device.uuid().to_string(),
            name: None,
            memory_used: Reading::NotApplicable,
            compute_context: false,
            graphics_context: false,
            compute_utilization: Reading::NotApplicable,
            memory_utilization: Reading::NotApplicable,
            encoder_utilization: Reading::NotApplicable,
            decoder_utilization: Reading::NotApplicable,
        }
    }

    fn absorb(&mut self, raw: RawProcess, context: ContextType) {
        match context {
            ContextType::Compute => self.compute_context = true,
            ContextType::Graphics => self.graphics_context = true,
        }
        self.memory_used = match (self.memory_used, raw.used_memory) {
            (Reading::Value(a), Reading::Value(b)) => Reading::Value(a.max(b)),
            (current, incoming) => current.or(incoming),
        };
        if self.name.is_none() {
            self.name = raw.name;
        }
    }

    fn apply_sample(&mut self, sample: &ProcessUtilizationSample) {
        self.compute_utilization = sample.compute;
        self.memory_utilization = sample.memory;
        self.encoder_utilization = sample.encoder;
        self.decoder_utilization = sample.decoder;
    }

    fn set_idle(&mut self) {
        self.compute_utilization = Reading::Value(0.0);
        self.memory_utilization = Reading::Value(0.0);
        self.encoder_utilization = Reading::Value(0.0);
        self.decoder_utilization = Reading::Value(0.0);
    }

    /// "C", "G" or "C+G".
    pub fn context_type(&self) -> &'static str {
        match (self.compute_context, self.graphics_context) {
            (true, true) => "C+G",
            (true, false) => "C",
            (false, true) => "G",
            (false, false) => "N/A",
        }
    }

    pub fn memory_percent(&self, device_total: Reading<u64>) -> Reading<f64> {
        percent_of(self.memory_used, device_total)
    }
}

impl Device {
    /// Processes on this device, keyed by pid.
    ///
    /// Compute and graphics listings are merged; per-process utilization is
    /// taken from samples of the last second, latest sample winning.
    pub fn processes(&self) -> BTreeMap<u32, DeviceProcess> {
        let mut merged: BTreeMap<u32, DeviceProcess> = BTreeMap::new();
        let mut memory_unavailable = false;

        for context in [ContextType::Compute, ContextType::Graphics] {
            let listed = self.query("running_processes", |b, h| b.running_processes(h, context));
            for raw in listed.value().unwrap_or_default() {
                memory_unavailable |= raw.used_memory.is_na();
                merged
                    .entry(raw.pid)
                    .or_insert_with(|| DeviceProcess::new(self, raw.pid))
                    .absorb(raw, context);
            }
        }

        if merged.is_empty() {
            return merged;
        }

        let since = now_micros().saturating_sub(AppConfig::PROCESS_UTILIZATION_WINDOW_US);
        if let Reading::Value(mut samples) =
            self.query("process_utilization", |b, h| b.process_utilization(h, since))
        {
            samples.sort_by_key(|sample| sample.timestamp_us);
            let mut sampled = HashSet::new();
            for sample in &samples {
                if let Some(process) = merged.get_mut(&sample.pid) {
                    process.apply_sample(sample);
                    sampled.insert(sample.pid);
                }
            }
            if !memory_unavailable {
                merged
                    .values_mut()
                    .filter(|process| !sampled.contains(&process.pid))
                    .for_each(DeviceProcess::set_idle);
            }
        }

        merged
    }
}

/// Host-side facts about a process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostProcessInfo {
    pub name: String,
    pub command: String,
    pub user: String,
    pub cpu_percent: f32,
    pub memory_rss: u64,
    pub running_time_secs: u64,
    pub ppid: Option<u32>,
}

/// Host process lookups backed by a reusable `sysinfo::System`.
pub struct HostProcessTable {
    system: System,
    users: Users,
}

impl Default for HostProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }

    /// Refresh only the given pids. CPU percentages need two refreshes to
    /// become meaningful, so keep one table alive across polling cycles.
    pub fn refresh(&mut self, pids: &[u32]) {
        let pids: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::nothing()
                .with_cpu()
                .with_memory()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_user(UpdateKind::OnlyIfNotSet),
        );
    }

    pub fn lookup(&self, pid: u32) -> Option<HostProcessInfo> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let name = process.name().to_string_lossy().to_string();
        let cmd = process.cmd();
        let command = if cmd.is_empty() {
            format!("[{name}]")
        } else {
            cmd.iter()
                .map(|s| s.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let user = process
            .user_id()
            .and_then(|uid| self.users.get_user_by_id(uid))
            .map(|user| user.name().to_string())
            .or_else(|| process.user_id().map(|uid| uid.to_string()))
            .unwrap_or_else(|| "N/A".to_string());
        Some(HostProcessInfo {
            name,
            command,
            user,
            cpu_percent: process.cpu_usage(),
            memory_rss: process.memory(),
            running_time_secs: process.run_time(),
            ppid: process.parent().map(|p| p.as_u32()),
        })
    }
}

/// Immutable copy of a device process joined with host information.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    #[serde(flatten)]
    pub process: DeviceProcess,
    pub memory_percent: Reading<f64>,
    /// `None` when the process is gone from the host process table.
    pub host: Option<HostProcessInfo>,
}

impl ProcessSnapshot {
    pub fn is_running(&self) -> bool {
        self.host.is_some()
    }
}

/// Process snapshots across devices, ordered by device then pid.
pub fn take_process_snapshots(
    devices: &[Device],
    host: &mut HostProcessTable,
) -> Vec<ProcessSnapshot> {
    let per_device: Vec<(Reading<u64>, BTreeMap<u32, DeviceProcess>)> = devices
        .iter()
        .map(|device| (device.memory_total(), device.processes()))
        .collect();

    let pids: Vec<u32> = per_device
        .iter()
        .flat_map(|(_, processes)| processes.keys().copied())
        .collect();
    if !pids.is_empty() {
        host.refresh(&pids);
    }

    per_device
        .into_iter()
        .flat_map(|(total, processes)| {
            processes.into_values().map(move |process| (total, process))
        })
        .map(|(total, process)| ProcessSnapshot {
            memory_percent: process.memory_percent(total),
            host: host.lookup(process.pid),
            process,
        })
        .collect()
}
