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

//! Unified error types for the nputop library.
//!
//! Per-field telemetry failures are normally absorbed into
//! [`Reading::NotApplicable`](crate::device::Reading) by the query façade.
//! The variants below are what strict queries, discovery and identity
//! lookups hand back to the caller so it can decide between degrading and
//! giving up.
//!
//! # Example
//!
//! ```rust,no_run
//! use nputop::device::{BackendSession, Device};
//! use nputop::Result;
//!
//! fn count() -> Result<u32> {
//!     let session = BackendSession::detect()?;
//!     Device::count(&session)
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// The main error type for nputop library operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The management library (or vendor tool) could not be located.
    #[error("Management library not found: {0}")]
    LibraryNotFound(String),

    /// The library loaded, but the kernel driver is not running.
    #[error("Driver not loaded")]
    DriverNotLoaded,

    /// The device fell off the bus or its handle became invalid.
    #[error("Device is lost: {0}")]
    DeviceLost(String),

    /// The active backend cannot produce this value for this device.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// A lookup by index, UUID or bus id matched nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A logical device index outside the visible device list.
    #[error("Invalid device ordinal: {0}")]
    InvalidOrdinal(usize),

    /// The backend was used before initialization or after shutdown.
    #[error("Backend is not initialized")]
    Uninitialized,

    /// An external command exited with a non-zero status.
    #[error("Command failed: '{command}' (code: {code:?}) stderr: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// An external command exceeded its wall-clock budget and was killed.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Backend output could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Any other backend-reported failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// An I/O error occurred while spawning or talking to a process.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_supported(what: impl Into<String>) -> Self {
        Error::NotSupported(what.into())
    }

    /// Discovery-level failure: the backend is unusable as a whole and the
    /// caller should stop rather than retry silently.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::LibraryNotFound(_) | Error::DriverNotLoaded)
    }

    /// Identity-level failure: the caller should treat the device as gone.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::DeviceLost(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }
}

/// A specialized Result type for nputop operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::LibraryNotFound("libnvidia-ml.so".to_string());
        assert_eq!(
            err.to_string(),
            "Management library not found: libnvidia-ml.so"
        );

        let err = Error::DriverNotLoaded;
        assert_eq!(err.to_string(), "Driver not loaded");

        let err = Error::InvalidOrdinal(7);
        assert_eq!(err.to_string(), "Invalid device ordinal: 7");

        let err = Error::CommandFailed {
            command: "npu-smi info".to_string(),
            code: Some(1),
            stderr: "dcmi error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed: 'npu-smi info' (code: Some(1)) stderr: dcmi error"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::LibraryNotFound(String::new()).is_backend_unavailable());
        assert!(Error::DriverNotLoaded.is_backend_unavailable());
        assert!(!Error::DeviceLost("0".into()).is_backend_unavailable());

        assert!(Error::DeviceLost("0".into()).is_device_lost());
        assert!(!Error::NotFound("0".into()).is_device_lost());

        assert!(Error::not_supported("fan_speed").is_not_supported());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_not_supported());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
