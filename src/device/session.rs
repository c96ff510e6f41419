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

//! Backend query façade.
//!
//! A [`BackendSession`] owns one backend, initializes it lazily exactly once,
//! and turns backend calls into either a [`Reading`] (lenient) or a
//! [`Result`] (strict). Sessions are shared as `Arc<BackendSession>` and
//! handed to every [`Device`](crate::device::Device) explicitly.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::device::reader_factory;
use crate::device::reading::Reading;
use crate::device::traits::TelemetryBackend;
use crate::device::types::BackendKind;
use crate::device::visible::VisibleDeviceCache;
use crate::error::Result;
use crate::utils::lock_or_recover;

#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    open_count: usize,
}

pub struct BackendSession {
    backend: Arc<dyn TelemetryBackend>,
    state: Mutex<SessionState>,
    visible: VisibleDeviceCache,
}

impl BackendSession {
    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(SessionState::default()),
            visible: VisibleDeviceCache::default(),
        })
    }

    /// Session over the first backend found on this host.
    pub fn detect() -> Result<Arc<Self>> {
        Ok(Self::new(reader_factory::detect_backend()?))
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &dyn TelemetryBackend {
        self.backend.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        lock_or_recover(&self.state).initialized
    }

    /// Initialize the backend if nobody has yet. Concurrent callers block on
    /// the state lock, so the backend sees a single `initialize` call.
    pub fn ensure_initialized(&self) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        if !state.initialized {
            self.backend.initialize()?;
            state.initialized = true;
            debug!(backend = %self.kind(), "backend initialized");
        }
        Ok(())
    }

    /// Scoped acquisition: the backend stays up until the last guard drops.
    pub fn open(self: &Arc<Self>) -> Result<SessionGuard> {
        self.ensure_initialized()?;
        lock_or_recover(&self.state).open_count += 1;
        Ok(SessionGuard {
            session: Arc::clone(self),
        })
    }

    /// Release one `open`. The last release shuts the backend down;
    /// extra releases are ignored.
    pub fn close(&self) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        if state.open_count == 0 {
            return Ok(());
        }
        state.open_count -= 1;
        if state.open_count == 0 && state.initialized {
            state.initialized = false;
            self.backend.shutdown()?;
            debug!(backend = %self.kind(), "backend shut down");
        }
        Ok(())
    }

    /// Shut down regardless of outstanding opens. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        state.open_count = 0;
        if state.initialized {
            state.initialized = false;
            self.backend.shutdown()?;
        }
        Ok(())
    }

    /// Strict query: the backend error comes back for the caller to branch on.
    pub fn try_query<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn TelemetryBackend) -> Result<T>,
    {
        if let Err(e) = self.ensure_initialized() {
            warn!(op, error = %e, "backend initialization failed");
            return Err(e);
        }
        f(self.backend.as_ref())
    }

    /// Lenient query: any failure becomes `NotApplicable`.
    pub fn query<T, F>(&self, op: &str, f: F) -> Reading<T>
    where
        F: FnOnce(&dyn TelemetryBackend) -> Result<T>,
    {
        match self.try_query(op, f) {
            Ok(value) => Reading::Value(value),
            Err(e) => {
                if !e.is_not_supported() {
                    debug!(op, error = %e, "query degraded to N/A");
                }
                Reading::NotApplicable
            }
        }
    }

    /// Lenient query with an explicit fallback value.
    pub fn query_or<T, F>(&self, op: &str, default: T, f: F) -> T
    where
        F: FnOnce(&dyn TelemetryBackend) -> Result<T>,
    {
        self.query(op, f).unwrap_or(default)
    }

    pub(crate) fn visible_cache(&self) -> &VisibleDeviceCache {
        &self.visible
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "backend shutdown failed");
        }
    }
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("backend", &self.kind())
            .field("state", &*lock_or_recover(&self.state))
            .finish()
    }
}

/// Keeps a session open; closes it on drop.
#[must_use = "the session closes when the guard is dropped"]
pub struct SessionGuard {
    session: Arc<BackendSession>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.close() {
            warn!(error = %e, "backend close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::FakeBackend;
    use crate::device::DeviceHandle;
    use crate::error::Error;
    use std::thread;

    #[test]
    fn test_lazy_init_happens_once_across_threads() {
        let fake = Arc::new(FakeBackend::with_devices(2));
        let session = BackendSession::new(fake.clone());
        assert!(!session.is_initialized());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || session.query("device_count", |b| b.device_count()))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Reading::Value(2));
        }
        assert_eq!(fake.calls("initialize"), 1);
    }

    #[test]
    fn test_query_absorbs_and_try_query_surfaces() {
        let fake = Arc::new(FakeBackend::with_devices(1));
        let session = BackendSession::new(fake);
        let lenient = session.query("fan_speed", |b| b.fan_speed(DeviceHandle(0)));
        assert!(lenient.is_na());
        let strict = session.try_query("fan_speed", |b| b.fan_speed(DeviceHandle(0)));
        assert!(matches!(strict, Err(Error::NotSupported(_))));
        assert_eq!(
            session.query_or("fan_speed", 7, |b| b.fan_speed(DeviceHandle(0))),
            7
        );
    }

    #[test]
    fn test_init_failure_is_retried_and_surfaced() {
        let fake = Arc::new(FakeBackend::with_devices(1));
        fake.fail_init(Some(|| Error::DriverNotLoaded));
        let session = BackendSession::new(fake.clone());

        let err = session.try_query("device_count", |b| b.device_count()).unwrap_err();
        assert!(err.is_backend_unavailable());
        assert!(!session.is_initialized());

        fake.fail_init(None);
        assert_eq!(session.query("device_count", |b| b.device_count()), Reading::Value(1));
        assert_eq!(fake.calls("initialize"), 2);
    }

    #[test]
    fn test_open_close_refcount() {
        let fake = Arc::new(FakeBackend::with_devices(1));
        let session = BackendSession::new(fake.clone());
        {
            let _a = session.open().unwrap();
            let _b = session.open().unwrap();
            assert_eq!(fake.calls("initialize"), 1);
        }
        assert_eq!(fake.calls("shutdown"), 1);
        assert!(!session.is_initialized());

        // Unbalanced close is harmless.
        session.close().unwrap();
        assert_eq!(fake.calls("shutdown"), 1);
    }
}
