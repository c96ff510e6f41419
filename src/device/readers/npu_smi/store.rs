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

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::config::NpuSmiConfig;
use super::parser::{ChipRecord, NpuSmiTable};
use crate::device::common::command_executor::{execute_command, CommandOptions};
use crate::device::types::RawProcess;
use crate::error::{Error, Result};
use crate::utils::lock_or_recover;

/// Where table text comes from.
pub trait TableSource: Send + Sync {
    fn fetch(&self) -> Result<String>;
}

/// Runs the vendor tool with a hard timeout.
pub struct CommandSource {
    config: NpuSmiConfig,
}

impl CommandSource {
    pub fn new(config: NpuSmiConfig) -> Self {
        Self { config }
    }
}

impl TableSource for CommandSource {
    fn fetch(&self) -> Result<String> {
        let options = CommandOptions {
            timeout: Some(self.config.timeout),
            check_status: true,
        };
        let output = execute_command(&self.config.command, &self.config.arg_refs(), &options)?;
        Ok(output.stdout)
    }
}

/// Serves queued outputs in order, repeating the last one once the queue
/// runs dry. Used for recorded tables and tests.
#[derive(Default)]
pub struct ReplaySource {
    queue: Mutex<VecDeque<Option<String>>>,
    last: Mutex<Option<Option<String>>>,
    fetches: AtomicUsize,
}

impl ReplaySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(text: impl Into<String>) -> Self {
        let source = Self::new();
        source.push(text);
        source
    }

    pub fn push(&self, text: impl Into<String>) {
        lock_or_recover(&self.queue).push_back(Some(text.into()));
    }

    /// Queue a failed invocation.
    pub fn push_failure(&self) {
        lock_or_recover(&self.queue).push_back(None);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl TableSource for ReplaySource {
    fn fetch(&self) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = lock_or_recover(&self.queue).pop_front();
        let entry = match next {
            Some(entry) => {
                *lock_or_recover(&self.last) = Some(entry.clone());
                entry
            }
            None => lock_or_recover(&self.last).clone().flatten(),
        };
        entry.ok_or_else(|| Error::CommandFailed {
            command: "npu-smi info".to_string(),
            code: Some(1),
            stderr: "replayed failure".to_string(),
        })
    }
}

#[derive(Default)]
struct StoreState {
    fetched_at: Option<Instant>,
    /// Table from the latest refresh; `None` if that refresh failed.
    current: Option<Arc<NpuSmiTable>>,
    version: Option<String>,
    /// (npu, chip) keys of the last successful parse, in logical order.
    topology: Vec<(u32, u32)>,
    /// Last known process list per chip.
    processes: HashMap<(u32, u32), Vec<RawProcess>>,
    generation: u64,
}

/// Time-windowed cache over the scraped table.
///
/// Readers share `state`; at most one thread runs the tool at a time and
/// the others keep reading the previous cycle meanwhile.
pub struct ScrapeStore {
    source: Arc<dyn TableSource>,
    ttl: Duration,
    refresh_lock: Mutex<()>,
    state: RwLock<StoreState>,
}

impl ScrapeStore {
    pub fn new(source: Arc<dyn TableSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            refresh_lock: Mutex::new(()),
            state: RwLock::new(StoreState::default()),
        }
    }

    fn is_fresh(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .fetched_at
            .is_some_and(|at| !self.ttl.is_zero() && at.elapsed() < self.ttl)
    }

    /// Run the tool if the cached table is older than the TTL.
    pub fn refresh_if_stale(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }
        let _refreshing = lock_or_recover(&self.refresh_lock);
        if self.is_fresh() {
            return Ok(());
        }
        self.refresh()
    }

    /// Run the tool now, regardless of the TTL.
    pub fn refresh(&self) -> Result<()> {
        let started = Instant::now();
        let parsed = self.source.fetch().and_then(|text| NpuSmiTable::parse(&text));

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.fetched_at = Some(Instant::now());
        match parsed {
            Ok(table) => {
                let topology = table.keys();
                if topology != state.topology {
                    state.generation += 1;
                    debug!(
                        devices = topology.len(),
                        generation = state.generation,
                        "npu-smi topology changed"
                    );
                }
                let mut processes = HashMap::with_capacity(topology.len());
                for &(npu, chip) in &topology {
                    let listed = table
                        .processes_for(npu, chip)
                        .or_else(|| state.processes.get(&(npu, chip)).cloned())
                        .unwrap_or_default();
                    processes.insert((npu, chip), listed);
                }
                state.processes = processes;
                state.topology = topology;
                if table.version.is_some() {
                    state.version.clone_from(&table.version);
                }
                state.current = Some(Arc::new(table));
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    devices = state.topology.len(),
                    "npu-smi table refreshed"
                );
                Ok(())
            }
            Err(e) => {
                state.current = None;
                if e.is_backend_unavailable() {
                    warn!("npu-smi unavailable: {e}");
                } else {
                    debug!("npu-smi refresh failed, keeping previous topology: {e}");
                }
                Err(e)
            }
        }
    }

    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn version(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
            .clone()
    }

    /// Number of chips in the last successfully parsed table.
    pub fn device_count(&self) -> Result<u32> {
        let refreshed = self.refresh_if_stale();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match refreshed {
            Err(e) if state.topology.is_empty() => Err(e),
            _ => Ok(state.topology.len() as u32),
        }
    }

    /// The chip at a logical index in the current cycle.
    ///
    /// A failed refresh yields `Ok(None)` for chips that existed before, so
    /// their fields read as not applicable without the device disappearing.
    pub fn chip(&self, logical_index: usize) -> Result<Option<ChipRecord>> {
        let _ = self.refresh_if_stale();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if logical_index >= state.topology.len() {
            return Err(Error::NotFound(format!("NPU chip {logical_index}")));
        }
        Ok(state
            .current
            .as_ref()
            .and_then(|table| table.chip(logical_index).cloned()))
    }

    /// Last known processes on the chip at a logical index.
    pub fn processes(&self, logical_index: usize) -> Result<Vec<RawProcess>> {
        let _ = self.refresh_if_stale();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let key = state
            .topology
            .get(logical_index)
            .ok_or_else(|| Error::NotFound(format!("NPU chip {logical_index}")))?;
        Ok(state.processes.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HBM: &str = include_str!("../../../../tests/fixtures/npu_smi_hbm.txt");
    const MULTICHIP: &str = include_str!("../../../../tests/fixtures/npu_smi_multichip.txt");

    fn store(source: &Arc<ReplaySource>, ttl: Duration) -> ScrapeStore {
        ScrapeStore::new(source.clone(), ttl)
    }

    fn pids(list: &[RawProcess]) -> Vec<u32> {
        list.iter().map(|p| p.pid).collect()
    }

    #[test]
    fn test_ttl_bounds_invocations() {
        let source = Arc::new(ReplaySource::with_output(HBM));
        let store = store(&source, Duration::from_secs(60));
        assert_eq!(store.device_count().unwrap(), 2);
        for _ in 0..10 {
            assert!(store.chip(0).unwrap().is_some());
            store.processes(1).unwrap();
        }
        assert_eq!(source.fetches(), 1);
        assert_eq!(store.version().as_deref(), Some("23.0.2.1"));
    }

    #[test]
    fn test_zero_ttl_refreshes_every_read() {
        let source = Arc::new(ReplaySource::with_output(HBM));
        let store = store(&source, Duration::ZERO);
        store.device_count().unwrap();
        store.chip(0).unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[test]
    fn test_missing_process_section_keeps_previous_list() {
        let source = Arc::new(ReplaySource::new());
        source.push(HBM);
        let without_processes = HBM
            .split("| NPU     Chip")
            .next()
            .unwrap_or_default()
            .to_string();
        source.push(without_processes);
        let idle = HBM.replace(
            "| 0       0                 | 124528        | python3.8                | 17400                   |",
            "| No running processes found in NPU 0                                                            |",
        );
        source.push(idle);
        let store = store(&source, Duration::ZERO);

        assert_eq!(pids(&store.processes(0).unwrap()), vec![124528]);
        assert_eq!(pids(&store.processes(0).unwrap()), vec![124528]);
        assert!(store.processes(0).unwrap().is_empty());
        assert!(store.processes(1).unwrap().is_empty());
    }

    #[test]
    fn test_failed_refresh_keeps_topology() {
        let source = Arc::new(ReplaySource::new());
        source.push(MULTICHIP);
        source.push_failure();
        let store = store(&source, Duration::ZERO);

        assert_eq!(store.device_count().unwrap(), 4);
        let generation = store.generation();
        assert_eq!(store.device_count().unwrap(), 4);
        assert!(store.chip(3).unwrap().is_none());
        assert_eq!(pids(&store.processes(3).unwrap()), vec![990711]);
        assert_eq!(store.generation(), generation);
        assert!(matches!(store.chip(4), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_failure_before_first_parse_is_an_error() {
        let source = Arc::new(ReplaySource::new());
        source.push_failure();
        let store = store(&source, Duration::ZERO);
        assert!(matches!(
            store.device_count(),
            Err(Error::CommandFailed { .. })
        ));
    }

    #[test]
    fn test_topology_change_bumps_generation() {
        let source = Arc::new(ReplaySource::new());
        source.push(HBM);
        source.push(MULTICHIP);
        let store = store(&source, Duration::ZERO);

        store.device_count().unwrap();
        let first = store.generation();
        assert_eq!(store.device_count().unwrap(), 4);
        assert_eq!(store.generation(), first + 1);
        store.device_count().unwrap();
        assert_eq!(store.generation(), first + 1);
    }

    #[test]
    fn test_concurrent_readers_share_one_refresh() {
        let source = Arc::new(ReplaySource::with_output(HBM));
        let store = Arc::new(store(&source, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.device_count().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 2);
        }
        assert_eq!(source.fetches(), 1);
    }
}
