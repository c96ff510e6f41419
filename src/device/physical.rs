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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::common::config::AppConfig;
use crate::device::oneshot::{self, OneshotCache, OneshotGuard};
use crate::device::reading::Reading;
use crate::device::session::BackendSession;
use crate::device::traits::TelemetryBackend;
use crate::device::types::{
    ClockInfos, DeviceHandle, DeviceIdentity, LoadingIntensity, MemoryInfo, ThroughputCounters,
    ThroughputInfo, UtilizationRates,
};
use crate::error::{Error, Result};
use crate::utils::lock_or_recover;
use crate::utils::units::bytes2human;

struct DeviceInner {
    session: Arc<BackendSession>,
    /// `None` when the handle lookup failed and the device is a placeholder row.
    handle: Option<DeviceHandle>,
    identity: DeviceIdentity,
    name: Reading<String>,
    cache: Arc<OneshotCache>,
    lost: AtomicBool,
    last_counters: Mutex<Option<ThroughputCounters>>,
}

/// One physical accelerator.
///
/// Cloning is cheap and clones share the memo cache. Two `Device` values
/// are equal when they refer to the same physical unit.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
    logical_index: Option<usize>,
}

impl Device {
    /// Number of devices the backend reports. Discovery failures propagate.
    pub fn count(session: &Arc<BackendSession>) -> Result<u32> {
        session.try_query("device_count", |b| b.device_count())
    }

    /// Device at a physical index.
    ///
    /// A device that is lost during lookup still comes back, as a placeholder
    /// with every field `NotApplicable`.
    pub fn new(session: &Arc<BackendSession>, index: u32) -> Result<Self> {
        match session.try_query("handle_by_index", |b| b.handle_by_index(index)) {
            Ok(handle) => Ok(Self::from_handle(session, handle)),
            Err(e) if e.is_device_lost() => {
                warn!(index, error = %e, "device lost during lookup");
                Ok(Self::placeholder(session, index, AppConfig::DEVICE_LOST_NAME))
            }
            Err(e @ Error::Backend(_)) => {
                warn!(index, error = %e, "device lookup failed");
                Ok(Self::placeholder(session, index, AppConfig::DEVICE_UNKNOWN_NAME))
            }
            Err(e) => Err(e),
        }
    }

    pub fn from_uuid(session: &Arc<BackendSession>, uuid: &str) -> Result<Self> {
        let handle = session.try_query("handle_by_uuid", |b| b.handle_by_uuid(uuid))?;
        Ok(Self::from_handle(session, handle))
    }

    pub fn from_bus_id(session: &Arc<BackendSession>, bus_id: &str) -> Result<Self> {
        let handle = session.try_query("handle_by_bus_id", |b| b.handle_by_bus_id(bus_id))?;
        Ok(Self::from_handle(session, handle))
    }

    /// Every device, in discovery order.
    pub fn all(session: &Arc<BackendSession>) -> Result<Vec<Self>> {
        let count = Self::count(session)?;
        (0..count).map(|index| Self::new(session, index)).collect()
    }

    /// Devices at the given physical indices, or all of them for `None`.
    pub fn from_indices(
        session: &Arc<BackendSession>,
        indices: Option<&[u32]>,
    ) -> Result<Vec<Self>> {
        match indices {
            None => Self::all(session),
            Some(indices) => indices
                .iter()
                .map(|&index| Self::new(session, index))
                .collect(),
        }
    }

    fn from_handle(session: &Arc<BackendSession>, handle: DeviceHandle) -> Self {
        let physical_index = session.query_or("index", handle.index(), |b| b.index(handle));
        let uuid = session
            .query("uuid", |b| b.uuid(handle))
            .value()
            .unwrap_or_else(|| DeviceIdentity::placeholder_uuid(session.kind(), physical_index));
        let identity = DeviceIdentity {
            physical_index,
            uuid,
            bus_id: session.query("bus_id", |b| b.bus_id(handle)),
        };
        let name = session.query("name", |b| b.name(handle));
        Self::build(session, Some(handle), identity, name)
    }

    fn placeholder(session: &Arc<BackendSession>, index: u32, name: &str) -> Self {
        let identity = DeviceIdentity {
            physical_index: index,
            uuid: DeviceIdentity::placeholder_uuid(session.kind(), index),
            bus_id: Reading::NotApplicable,
        };
        let device = Self::build(session, None, identity, Reading::Value(name.to_string()));
        device.inner.lost.store(true, Ordering::Relaxed);
        device
    }

    fn build(
        session: &Arc<BackendSession>,
        handle: Option<DeviceHandle>,
        identity: DeviceIdentity,
        name: Reading<String>,
    ) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                session: Arc::clone(session),
                handle,
                identity,
                name,
                cache: Arc::new(OneshotCache::default()),
                lost: AtomicBool::new(false),
                last_counters: Mutex::new(None),
            }),
            logical_index: None,
        }
    }

    pub(crate) fn with_logical_index(mut self, logical_index: usize) -> Self {
        self.logical_index = Some(logical_index);
        self
    }

    pub(crate) fn query<T, F>(&self, op: &'static str, f: F) -> Reading<T>
    where
        F: FnOnce(&dyn TelemetryBackend, DeviceHandle) -> Result<T>,
    {
        let Some(handle) = self.inner.handle else {
            return Reading::NotApplicable;
        };
        match self.inner.session.try_query(op, |b| f(b, handle)) {
            Ok(value) => Reading::Value(value),
            Err(e) => {
                self.note_failure(op, &e);
                Reading::NotApplicable
            }
        }
    }

    fn note_failure(&self, op: &str, error: &Error) {
        if error.is_device_lost() {
            if !self.inner.lost.swap(true, Ordering::Relaxed) {
                warn!(
                    index = self.inner.identity.physical_index,
                    op,
                    error = %error,
                    "device lost"
                );
            }
        } else if !error.is_not_supported() {
            debug!(
                index = self.inner.identity.physical_index,
                op,
                error = %error,
                "query degraded to N/A"
            );
        }
    }

    /// Open a batch-caching scope. Re-entering while a scope is open shares
    /// the values already cached.
    pub fn oneshot(&self) -> OneshotGuard {
        oneshot::enter(&self.inner.cache)
    }

    pub fn in_oneshot(&self) -> bool {
        self.inner.cache.is_active()
    }

    pub fn session(&self) -> &Arc<BackendSession> {
        &self.inner.session
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub fn physical_index(&self) -> u32 {
        self.inner.identity.physical_index
    }

    /// Position in the visible device list, if resolved through one.
    pub fn logical_index(&self) -> Option<usize> {
        self.logical_index
    }

    /// Logical index when known, physical index otherwise.
    pub fn index(&self) -> usize {
        self.logical_index
            .unwrap_or(self.inner.identity.physical_index as usize)
    }

    pub fn uuid(&self) -> &str {
        &self.inner.identity.uuid
    }

    pub fn bus_id(&self) -> Reading<String> {
        self.inner.identity.bus_id.clone()
    }

    pub fn name(&self) -> Reading<String> {
        self.inner.name.clone()
    }

    /// True once the device was found lost at lookup or by any query.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Relaxed)
    }

    /// Strict liveness probe for callers that prune lost devices.
    pub fn health_check(&self) -> Result<()> {
        let handle = self
            .inner
            .handle
            .ok_or_else(|| Error::DeviceLost(self.uuid().to_string()))?;
        match self.inner.session.try_query("health_check", |b| b.name(handle)) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_supported() => Ok(()),
            Err(e) => {
                self.note_failure("health_check", &e);
                Err(e)
            }
        }
    }

    pub fn health(&self) -> Reading<String> {
        self.query("health", |b, h| b.health(h))
    }

    pub fn driver_version(&self) -> Reading<String> {
        self.inner.session.query("driver_version", |b| b.driver_version())
    }

    pub fn runtime_version(&self) -> Reading<String> {
        self.inner.session.query("runtime_version", |b| b.runtime_version())
    }

    // Memory

    pub fn memory_info(&self) -> MemoryInfo {
        self.inner.cache.memoize(
            |m| &mut m.memory_info,
            || {
                self.query("memory_info", |b, h| b.memory_info(h))
                    .map(|m| MemoryInfo::new(m.total, m.free, m.used))
                    .value()
                    .unwrap_or_default()
            },
        )
    }

    pub fn memory_total(&self) -> Reading<u64> {
        self.memory_info().total
    }

    pub fn memory_used(&self) -> Reading<u64> {
        self.memory_info().used
    }

    pub fn memory_free(&self) -> Reading<u64> {
        self.memory_info().free
    }

    pub fn memory_total_human(&self) -> String {
        bytes2human(self.memory_total())
    }

    pub fn memory_used_human(&self) -> String {
        bytes2human(self.memory_used())
    }

    pub fn memory_free_human(&self) -> String {
        bytes2human(self.memory_free())
    }

    pub fn memory_percent(&self) -> Reading<f64> {
        self.memory_info().percent()
    }

    /// "used / total" in human units.
    pub fn memory_usage(&self) -> Reading<String> {
        let info = self.memory_info();
        info.used
            .zip(info.total)
            .map(|(used, total)| {
                format!(
                    "{} / {}",
                    bytes2human(Reading::Value(used)),
                    bytes2human(Reading::Value(total))
                )
            })
    }

    // Utilization

    pub fn utilization_rates(&self) -> UtilizationRates {
        self.inner.cache.memoize(
            |m| &mut m.utilization_rates,
            || {
                self.query("utilization_rates", |b, h| b.utilization_rates(h))
                    .value()
                    .unwrap_or_default()
            },
        )
    }

    pub fn compute_utilization(&self) -> Reading<f64> {
        self.utilization_rates().compute
    }

    pub fn memory_utilization(&self) -> Reading<f64> {
        self.utilization_rates().memory
    }

    pub fn encoder_utilization(&self) -> Reading<f64> {
        self.utilization_rates().encoder
    }

    pub fn decoder_utilization(&self) -> Reading<f64> {
        self.utilization_rates().decoder
    }

    // Clocks

    pub fn clock_infos(&self) -> ClockInfos {
        self.inner.cache.memoize(
            |m| &mut m.clock_infos,
            || {
                self.query("clock_infos", |b, h| b.clock_infos(h))
                    .value()
                    .unwrap_or_default()
            },
        )
    }

    pub fn max_clock_infos(&self) -> ClockInfos {
        self.inner.cache.memoize(
            |m| &mut m.max_clock_infos,
            || {
                self.query("max_clock_infos", |b, h| b.max_clock_infos(h))
                    .value()
                    .unwrap_or_default()
            },
        )
    }

    pub fn graphics_clock(&self) -> Reading<u32> {
        self.clock_infos().graphics
    }

    pub fn sm_clock(&self) -> Reading<u32> {
        self.clock_infos().sm
    }

    pub fn memory_clock(&self) -> Reading<u32> {
        self.clock_infos().memory
    }

    pub fn video_clock(&self) -> Reading<u32> {
        self.clock_infos().video
    }

    // Thermals and power

    pub fn temperature(&self) -> Reading<u32> {
        self.query("temperature", |b, h| b.temperature(h))
    }

    pub fn fan_speed(&self) -> Reading<u32> {
        self.query("fan_speed", |b, h| b.fan_speed(h))
    }

    /// Milliwatts.
    pub fn power_usage(&self) -> Reading<u32> {
        self.inner.cache.memoize(
            |m| &mut m.power_usage,
            || self.query("power_usage", |b, h| b.power_usage(h)),
        )
    }

    /// Milliwatts.
    pub fn power_limit(&self) -> Reading<u32> {
        self.inner.cache.memoize(
            |m| &mut m.power_limit,
            || self.query("power_limit", |b, h| b.power_limit(h)),
        )
    }

    /// "usage / limit" in whole watts, each side `N/A` on its own.
    pub fn power_status(&self) -> String {
        let watts = |mw: Reading<u32>| mw.map(|mw| (mw as f64 / 1000.0).round() as u64);
        let usage = watts(self.power_usage());
        let limit = watts(self.power_limit());
        let side = |w: Reading<u64>| match w {
            Reading::Value(w) => format!("{w}W"),
            Reading::NotApplicable => crate::device::reading::NA.to_string(),
        };
        format!("{} / {}", side(usage), side(limit))
    }

    // Links

    pub fn pcie_throughput(&self) -> ThroughputInfo {
        self.inner.cache.memoize(
            |m| &mut m.pcie_throughput,
            || {
                self.query("pcie_throughput", |b, h| b.pcie_throughput(h))
                    .value()
                    .unwrap_or_default()
            },
        )
    }

    pub fn pcie_tx_throughput(&self) -> Reading<u64> {
        self.pcie_throughput().tx
    }

    pub fn pcie_rx_throughput(&self) -> Reading<u64> {
        self.pcie_throughput().rx
    }

    pub fn pcie_tx_throughput_human(&self) -> String {
        throughput2human(self.pcie_tx_throughput())
    }

    pub fn pcie_rx_throughput_human(&self) -> String {
        throughput2human(self.pcie_rx_throughput())
    }

    /// Rate since the previous counter read on this device.
    ///
    /// The first read after construction has nothing to compare with and
    /// yields `NotApplicable`, as does a read whose counters went backwards.
    pub fn link_throughput(&self) -> ThroughputInfo {
        self.inner.cache.memoize(
            |m| &mut m.link_throughput,
            || {
                let Reading::Value(current) =
                    self.query("link_throughput_counters", |b, h| b.link_throughput_counters(h))
                else {
                    return ThroughputInfo::default();
                };
                let previous = lock_or_recover(&self.inner.last_counters).replace(current);
                previous
                    .map(|previous| ThroughputInfo::from_counters(&previous, &current))
                    .unwrap_or_default()
            },
        )
    }

    // Misc

    pub fn performance_state(&self) -> Reading<String> {
        self.query("performance_state", |b, h| b.performance_state(h))
    }

    pub fn compute_mode(&self) -> Reading<String> {
        self.query("compute_mode", |b, h| b.compute_mode(h))
    }

    pub fn total_volatile_uncorrected_ecc_errors(&self) -> Reading<u64> {
        self.query("total_volatile_uncorrected_ecc_errors", |b, h| {
            b.total_volatile_uncorrected_ecc_errors(h)
        })
    }

    pub fn memory_loading_intensity(&self) -> LoadingIntensity {
        LoadingIntensity::from_percent(
            self.memory_percent(),
            AppConfig::MEMORY_UTILIZATION_THRESHOLDS,
        )
    }

    pub fn compute_loading_intensity(&self) -> LoadingIntensity {
        LoadingIntensity::from_percent(
            self.compute_utilization(),
            AppConfig::COMPUTE_UTILIZATION_THRESHOLDS,
        )
    }

    /// The heavier of memory and compute load.
    pub fn loading_intensity(&self) -> LoadingIntensity {
        self.memory_loading_intensity()
            .max(self.compute_loading_intensity())
    }

    pub fn display_color(&self) -> &'static str {
        let errored =
            matches!(&self.inner.name, Reading::Value(name) if name.starts_with("ERROR:"));
        if errored || self.is_lost() {
            "red"
        } else {
            self.loading_intensity().color()
        }
    }
}

fn throughput2human(kib_per_sec: Reading<u64>) -> String {
    match kib_per_sec {
        Reading::Value(kib) => {
            format!("{}/s", bytes2human(Reading::Value(kib.saturating_mul(1024))))
        }
        Reading::NotApplicable => crate::device::reading::NA.to_string(),
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.identity == other.inner.identity
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.identity.hash(state);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index())
            .field("physical_index", &self.inner.identity.physical_index)
            .field("name", &self.inner.name)
            .field("uuid", &self.inner.identity.uuid)
            .field("lost", &self.is_lost())
            .finish()
    }
}
