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

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::reading::{percent_of, Reading};

/// Which backend family produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Nvml,
    NpuSmi,
    /// In-process backends used by tests and embedders.
    Custom,
}

impl BackendKind {
    /// Prefix of placeholder UUIDs for devices whose backend issues none.
    pub fn uuid_prefix(&self) -> &'static str {
        match self {
            BackendKind::Nvml => "GPU",
            BackendKind::NpuSmi => "ASCEND",
            BackendKind::Custom => "DEVICE",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Nvml => "nvml",
            BackendKind::NpuSmi => "npu-smi",
            BackendKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Opaque reference to a device inside the active backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

impl DeviceHandle {
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Device memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: Reading<u64>,
    pub free: Reading<u64>,
    pub used: Reading<u64>,
}

impl MemoryInfo {
    /// Build from whatever the backend reported, deriving the missing side
    /// so that `free == total - used` whenever `total` and `used` are known.
    pub fn new(total: Reading<u64>, free: Reading<u64>, used: Reading<u64>) -> Self {
        let (used, free) = match (total, used, free) {
            (Reading::Value(t), Reading::Value(u), _) => {
                let u = u.min(t);
                (Reading::Value(u), Reading::Value(t - u))
            }
            (Reading::Value(t), Reading::NotApplicable, Reading::Value(f)) => {
                let f = f.min(t);
                (Reading::Value(t - f), Reading::Value(f))
            }
            _ => (used, free),
        };
        Self { total, free, used }
    }

    pub fn from_total_used(total: u64, used: u64) -> Self {
        Self::new(Reading::Value(total), Reading::NotApplicable, Reading::Value(used))
    }

    pub fn from_total_free(total: u64, free: u64) -> Self {
        Self::new(Reading::Value(total), Reading::Value(free), Reading::NotApplicable)
    }

    pub fn percent(&self) -> Reading<f64> {
        percent_of(self.used, self.total)
    }
}

/// Utilization percentages; every field is independently optional.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UtilizationRates {
    pub compute: Reading<f64>,
    pub memory: Reading<f64>,
    pub encoder: Reading<f64>,
    pub decoder: Reading<f64>,
}

/// Clock frequencies in MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClockInfos {
    pub graphics: Reading<u32>,
    pub sm: Reading<u32>,
    pub memory: Reading<u32>,
    pub video: Reading<u32>,
}

/// Link throughput in KiB/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThroughputInfo {
    pub tx: Reading<u64>,
    pub rx: Reading<u64>,
}

/// Cumulative link traffic counters (KiB) and when they were read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputCounters {
    pub tx: Reading<u64>,
    pub rx: Reading<u64>,
    pub timestamp_us: u64,
}

impl ThroughputInfo {
    /// Rate between two counter reads.
    ///
    /// A direction is `NotApplicable` unless both reads are numeric, the
    /// counter did not go backwards and `current` is strictly newer.
    pub fn from_counters(previous: &ThroughputCounters, current: &ThroughputCounters) -> Self {
        if current.timestamp_us <= previous.timestamp_us {
            return Self::default();
        }
        let elapsed_us = current.timestamp_us - previous.timestamp_us;
        let rate = |old: Reading<u64>, new: Reading<u64>| match (old, new) {
            (Reading::Value(old), Reading::Value(new)) if new >= old => {
                Reading::Value((new - old).saturating_mul(1_000_000) / elapsed_us)
            }
            _ => Reading::NotApplicable,
        };
        Self {
            tx: rate(previous.tx, current.tx),
            rx: rate(previous.rx, current.rx),
        }
    }
}

/// Who a device is, independent of the object that refers to it.
///
/// Equality and hashing only look at the physical index and the UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub physical_index: u32,
    pub uuid: String,
    pub bus_id: Reading<String>,
}

impl DeviceIdentity {
    /// Deterministic stand-in for backends that issue no UUIDs.
    pub fn placeholder_uuid(kind: BackendKind, physical_index: u32) -> String {
        format!("{}-{physical_index:02}", kind.uuid_prefix())
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.physical_index == other.physical_index && self.uuid == other.uuid
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.physical_index.hash(state);
        self.uuid.hash(state);
    }
}

/// Context a process holds on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextType {
    Compute,
    Graphics,
}

/// A process as a backend lists it, before merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcess {
    pub pid: u32,
    pub used_memory: Reading<u64>,
    /// Some backends report the process name alongside the listing.
    pub name: Option<String>,
}

/// One per-process utilization sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUtilizationSample {
    pub pid: u32,
    pub timestamp_us: u64,
    pub compute: Reading<f64>,
    pub memory: Reading<f64>,
    pub encoder: Reading<f64>,
    pub decoder: Reading<f64>,
}

/// Coarse load level used for coloring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingIntensity {
    Light,
    Moderate,
    Heavy,
}

impl LoadingIntensity {
    /// Classify a percentage against `(light_below, heavy_from)`.
    /// Unknown load counts as moderate.
    pub fn from_percent(percent: Reading<f64>, thresholds: (f64, f64)) -> Self {
        let (low, high) = thresholds;
        match percent {
            Reading::Value(p) if p >= high => LoadingIntensity::Heavy,
            Reading::Value(p) if p < low => LoadingIntensity::Light,
            _ => LoadingIntensity::Moderate,
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            LoadingIntensity::Light => "green",
            LoadingIntensity::Moderate => "yellow",
            LoadingIntensity::Heavy => "red",
        }
    }
}
