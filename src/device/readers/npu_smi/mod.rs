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

//! Scraping backend for Ascend NPUs driven by the `npu-smi` tool.
//!
//! Device handles are logical indices: the rank of each (npu, chip) pair in
//! the latest parsed table. A hot-plug bumps the topology generation, which
//! invalidates resolved visible-device lists.

pub mod config;
pub mod parser;
pub mod store;

use std::sync::Arc;

use crate::device::reading::Reading;
use crate::device::traits::TelemetryBackend;
use crate::device::types::{
    BackendKind, ContextType, DeviceHandle, MemoryInfo, RawProcess, UtilizationRates,
};
use crate::error::{Error, Result};

pub use config::NpuSmiConfig;
pub use parser::{ChipRecord, NpuSmiTable};
pub use store::{CommandSource, ReplaySource, ScrapeStore, TableSource};

pub struct NpuSmiBackend {
    config: Option<NpuSmiConfig>,
    store: ScrapeStore,
}

impl NpuSmiBackend {
    pub fn new(config: NpuSmiConfig) -> Self {
        let ttl = config.ttl;
        Self {
            store: ScrapeStore::new(Arc::new(CommandSource::new(config.clone())), ttl),
            config: Some(config),
        }
    }

    /// Backend over any table source, e.g. a recorded table.
    pub fn with_source(source: Arc<dyn TableSource>, ttl: std::time::Duration) -> Self {
        Self {
            config: None,
            store: ScrapeStore::new(source, ttl),
        }
    }

    pub fn store(&self) -> &ScrapeStore {
        &self.store
    }

    fn chip_field<T>(
        &self,
        handle: DeviceHandle,
        what: &str,
        field: impl FnOnce(ChipRecord) -> Reading<T>,
    ) -> Result<T> {
        let chip = self
            .store
            .chip(handle.index() as usize)?
            .ok_or_else(|| Error::Backend("no npu-smi data this cycle".to_string()))?;
        field(chip)
            .value()
            .ok_or_else(|| Error::not_supported(format!("npu-smi {what}")))
    }
}

impl Default for NpuSmiBackend {
    fn default() -> Self {
        Self::new(NpuSmiConfig::default())
    }
}

impl TelemetryBackend for NpuSmiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NpuSmi
    }

    /// Validates the configuration and runs the tool once. A missing tool
    /// is fatal; a slow or failing one is retried on the next read.
    fn initialize(&self) -> Result<()> {
        if let Some(config) = &self.config {
            config.validate()?;
        }
        match self.store.refresh() {
            Err(e) if e.is_backend_unavailable() => Err(e),
            _ => Ok(()),
        }
    }

    fn topology_generation(&self) -> u64 {
        self.store.generation()
    }

    fn device_count(&self) -> Result<u32> {
        self.store.device_count()
    }

    fn driver_version(&self) -> Result<String> {
        let _ = self.store.refresh_if_stale();
        self.store
            .version()
            .ok_or_else(|| Error::not_supported("npu-smi version banner"))
    }

    fn name(&self, handle: DeviceHandle) -> Result<String> {
        self.chip_field(handle, "name", |c| c.name)
    }

    fn bus_id(&self, handle: DeviceHandle) -> Result<String> {
        self.chip_field(handle, "bus id", |c| c.bus_id)
    }

    fn health(&self, handle: DeviceHandle) -> Result<String> {
        self.chip_field(handle, "health", |c| c.health)
    }

    fn memory_info(&self, handle: DeviceHandle) -> Result<MemoryInfo> {
        self.chip_field(handle, "memory", |c| Reading::Value(c.memory))
    }

    fn utilization_rates(&self, handle: DeviceHandle) -> Result<UtilizationRates> {
        self.chip_field(handle, "utilization", |c| {
            Reading::Value(UtilizationRates {
                compute: c.aicore,
                memory: c.memory_percent(),
                encoder: Reading::NotApplicable,
                decoder: Reading::NotApplicable,
            })
        })
    }

    fn temperature(&self, handle: DeviceHandle) -> Result<u32> {
        self.chip_field(handle, "temperature", |c| c.temperature)
    }

    fn power_usage(&self, handle: DeviceHandle) -> Result<u32> {
        self.chip_field(handle, "power", |c| c.power)
    }

    fn running_processes(
        &self,
        handle: DeviceHandle,
        context: ContextType,
    ) -> Result<Vec<RawProcess>> {
        match context {
            ContextType::Compute => self.store.processes(handle.index() as usize),
            ContextType::Graphics => Err(Error::not_supported("npu-smi graphics contexts")),
        }
    }
}
