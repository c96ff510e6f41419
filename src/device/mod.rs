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

//! Device discovery, telemetry and process enumeration.
//!
//! A [`BackendSession`] wraps one [`TelemetryBackend`]; [`Device`] objects
//! read through it and memoize expensive fields inside a
//! [`oneshot`](Device::oneshot) scope.

pub mod common;
pub mod oneshot;
pub mod physical;
pub mod platform_detection;
pub mod process;
pub mod reader_factory;
pub mod readers;
pub mod reading;
pub mod session;
pub mod snapshot;
pub mod traits;
pub mod types;
pub mod visible;

#[cfg(test)]
pub(crate) mod testing;

pub use oneshot::OneshotGuard;
pub use physical::Device;
pub use process::{
    take_process_snapshots, DeviceProcess, HostProcessInfo, HostProcessTable, ProcessSnapshot,
};
pub use reader_factory::{create_backend, detect_backend, BackendChoice};
pub use reading::{Reading, NA};
pub use session::{BackendSession, SessionGuard};
pub use snapshot::{take_snapshots, DeviceSnapshot};
pub use traits::TelemetryBackend;
pub use types::{
    BackendKind, ClockInfos, ContextType, DeviceHandle, DeviceIdentity, LoadingIntensity,
    MemoryInfo, ProcessUtilizationSample, RawProcess, ThroughputCounters, ThroughputInfo,
    UtilizationRates,
};
pub use visible::{normalize_visible_devices, parse_visible_devices, resolve_visible_devices};
