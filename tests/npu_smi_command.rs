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

//! Runs the npu-smi backend against a stand-in executable.
//!
//! Everything lives in one test so no other test thread forks while the
//! script file is still open for writing.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nputop::device::readers::npu_smi::{NpuSmiBackend, NpuSmiConfig};
use nputop::device::{resolve_visible_devices, BackendSession, Device, Reading};
use nputop::Error;

const TWO_DEVICES: &str = include_str!("fixtures/npu_smi_two_devices.txt");

fn write_script(dir: &Path) -> String {
    let table = dir.join("table.txt");
    fs::write(&table, TWO_DEVICES).unwrap();
    let script = dir.join("npu-smi");
    let body = format!(
        "#!/bin/sh\nif [ -f \"{slow}\" ]; then exec sleep 5; fi\ncat \"{table}\"\n",
        slow = dir.join("slow").display(),
        table = table.display(),
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script.to_string_lossy().to_string()
}

#[test]
fn test_scripted_tool_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path());
    let config = NpuSmiConfig::with_command(script)
        .ttl(Duration::from_secs(60))
        .timeout(Duration::from_millis(500));
    let backend = Arc::new(NpuSmiBackend::new(config));
    let session = BackendSession::new(backend.clone());
    let _open = session.open().unwrap();

    let devices = resolve_visible_devices(&session, Some("1,0")).unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].physical_index(), 1);
    let snapshot = devices[0].as_snapshot();
    assert_eq!(snapshot.index, 0);
    assert_eq!(snapshot.health, Reading::Value("Warning".to_string()));
    assert!(snapshot.power_usage.is_na());
    assert_eq!(devices[1].as_snapshot().power_usage, Reading::Value(88_600));

    // A hung tool is killed and the cycle degrades to N/A.
    fs::write(dir.path().join("slow"), "").unwrap();
    let started = Instant::now();
    let err = backend.store().refresh().unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(Device::count(&session).unwrap(), 2);
    let degraded = devices[0].as_snapshot();
    assert!(degraded.memory_used.is_na());
    assert!(degraded.compute_utilization().is_na());
    assert!(!degraded.is_lost);
    assert_eq!(devices[0].processes().len(), 2);

    // The next successful run brings the values back.
    fs::remove_file(dir.path().join("slow")).unwrap();
    backend.store().refresh().unwrap();
    assert_eq!(devices[0].temperature(), Reading::Value(50));
}
