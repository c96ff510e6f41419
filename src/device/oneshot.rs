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

//! Per-device batch cache behind [`Device::oneshot`](crate::device::Device::oneshot).
//!
//! While at least one [`OneshotGuard`] is alive, memoizable accessors store
//! their first result and hand it back to every later caller. When the last
//! guard drops, the stored values are discarded. The cache lock is held for
//! one backend call plus the write, never for a whole batch of reads.

use std::sync::{Arc, Mutex};

use crate::device::reading::Reading;
use crate::device::types::{ClockInfos, MemoryInfo, ThroughputInfo, UtilizationRates};
use crate::utils::lock_or_recover;

#[derive(Debug, Default)]
pub(crate) struct Memo {
    pub memory_info: Option<MemoryInfo>,
    pub utilization_rates: Option<UtilizationRates>,
    pub clock_infos: Option<ClockInfos>,
    pub max_clock_infos: Option<ClockInfos>,
    pub power_usage: Option<Reading<u32>>,
    pub power_limit: Option<Reading<u32>>,
    pub pcie_throughput: Option<ThroughputInfo>,
    pub link_throughput: Option<ThroughputInfo>,
}

#[derive(Debug, Default)]
struct CacheState {
    holders: usize,
    memo: Memo,
}

#[derive(Debug, Default)]
pub(crate) struct OneshotCache {
    state: Mutex<CacheState>,
}

impl OneshotCache {
    pub fn is_active(&self) -> bool {
        lock_or_recover(&self.state).holders > 0
    }

    /// Return the cached value for `slot`, or compute it.
    ///
    /// Outside a scope `compute` runs unlocked and nothing is stored.
    pub fn memoize<T, S, F>(&self, slot: S, compute: F) -> T
    where
        T: Clone,
        S: Fn(&mut Memo) -> &mut Option<T>,
        F: FnOnce() -> T,
    {
        let mut state = lock_or_recover(&self.state);
        if state.holders == 0 {
            drop(state);
            return compute();
        }
        if let Some(value) = slot(&mut state.memo) {
            return value.clone();
        }
        let value = compute();
        *slot(&mut state.memo) = Some(value.clone());
        value
    }

    fn enter(self: &Arc<Self>) -> OneshotGuard {
        lock_or_recover(&self.state).holders += 1;
        OneshotGuard {
            cache: Arc::clone(self),
        }
    }

    fn leave(&self) {
        let mut state = lock_or_recover(&self.state);
        state.holders = state.holders.saturating_sub(1);
        if state.holders == 0 {
            state.memo = Memo::default();
        }
    }
}

/// Open oneshot scope. Dropping it (normally, on error or on unwind) closes
/// the scope.
#[must_use = "the oneshot scope closes when the guard is dropped"]
pub struct OneshotGuard {
    cache: Arc<OneshotCache>,
}

impl Drop for OneshotGuard {
    fn drop(&mut self) {
        self.cache.leave();
    }
}

pub(crate) fn enter(cache: &Arc<OneshotCache>) -> OneshotGuard {
    cache.enter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counted(cache: &OneshotCache, counter: &Cell<u32>) -> Reading<u32> {
        cache.memoize(
            |m| &mut m.power_usage,
            || {
                counter.set(counter.get() + 1);
                Reading::Value(counter.get())
            },
        )
    }

    #[test]
    fn test_outside_scope_is_not_cached() {
        let cache = Arc::new(OneshotCache::default());
        let counter = Cell::new(0);
        assert_eq!(counted(&cache, &counter), Reading::Value(1));
        assert_eq!(counted(&cache, &counter), Reading::Value(2));
    }

    #[test]
    fn test_scope_caches_and_clears() {
        let cache = Arc::new(OneshotCache::default());
        let counter = Cell::new(0);
        {
            let _guard = enter(&cache);
            assert_eq!(counted(&cache, &counter), Reading::Value(1));
            assert_eq!(counted(&cache, &counter), Reading::Value(1));
        }
        assert!(!cache.is_active());
        assert_eq!(counted(&cache, &counter), Reading::Value(2));
    }

    #[test]
    fn test_nested_scope_keeps_outer_values() {
        let cache = Arc::new(OneshotCache::default());
        let counter = Cell::new(0);
        let outer = enter(&cache);
        assert_eq!(counted(&cache, &counter), Reading::Value(1));
        {
            let _inner = enter(&cache);
            assert_eq!(counted(&cache, &counter), Reading::Value(1));
        }
        assert!(cache.is_active());
        assert_eq!(counted(&cache, &counter), Reading::Value(1));
        drop(outer);
        assert_eq!(counted(&cache, &counter), Reading::Value(2));
    }

    #[test]
    fn test_scope_released_on_panic() {
        let cache = Arc::new(OneshotCache::default());
        let cloned = Arc::clone(&cache);
        let result = std::panic::catch_unwind(move || {
            let _guard = enter(&cloned);
            cloned.memoize(|m| &mut m.power_limit, || Reading::Value(1u32));
            panic!("poller stopped mid-batch");
        });
        assert!(result.is_err());
        assert!(!cache.is_active());
        let fresh = cache.memoize(|m| &mut m.power_limit, || Reading::Value(2u32));
        assert_eq!(fresh, Reading::Value(2));
    }
}
