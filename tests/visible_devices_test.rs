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

//! Visible-device resolution through a backend defined outside the crate.

use std::sync::Arc;

use nputop::device::{
    normalize_visible_devices, parse_visible_devices, resolve_visible_devices, BackendKind,
    BackendSession, DeviceHandle, MemoryInfo, TelemetryBackend,
};
use nputop::Result;

const UUIDS: [&str; 3] = [
    "GPU-0b2f6e1c-41a3-4c55-9d7e-0f1d3c7a9b10",
    "GPU-1c3a7f2d-52b4-4d66-8e8f-1a2e4d8b0c21",
    "GPU-2d4b803e-63c5-4e77-9f90-2b3f5e9c1d32",
];

struct ThreeCards;

impl TelemetryBackend for ThreeCards {
    fn kind(&self) -> BackendKind {
        BackendKind::Custom
    }

    fn device_count(&self) -> Result<u32> {
        Ok(UUIDS.len() as u32)
    }

    fn uuid(&self, handle: DeviceHandle) -> Result<String> {
        Ok(UUIDS[handle.index() as usize].to_string())
    }

    fn memory_info(&self, handle: DeviceHandle) -> Result<MemoryInfo> {
        Ok(MemoryInfo::from_total_used(
            16 << 30,
            u64::from(handle.index()) << 30,
        ))
    }
}

fn session() -> Arc<BackendSession> {
    BackendSession::new(Arc::new(ThreeCards))
}

#[test]
fn test_repeated_ordinal_hides_everything() {
    let session = session();
    assert!(resolve_visible_devices(&session, Some("0,1,0")).unwrap().is_empty());
}

#[test]
fn test_mixed_schemes_keep_leading_run() {
    let session = session();
    let spec = format!("0,{}", UUIDS[1]);
    assert_eq!(parse_visible_devices(&session, Some(&spec)).unwrap(), vec![0]);
}

#[test]
fn test_uuid_spec_selects_and_orders() {
    let session = session();
    let spec = format!("{},{}", UUIDS[2], UUIDS[0]);
    let devices = resolve_visible_devices(&session, Some(&spec)).unwrap();
    let physical: Vec<u32> = devices.iter().map(|d| d.physical_index()).collect();
    assert_eq!(physical, vec![2, 0]);
    assert_eq!(devices[0].index(), 0);
    assert_eq!(devices[0].memory_used().value(), Some(2 << 30));
}

#[test]
fn test_normalize_is_idempotent() {
    let session = session();
    let once = normalize_visible_devices(&session, Some("2,1")).unwrap();
    assert_eq!(once, format!("{},{}", UUIDS[2], UUIDS[1]));
    let twice = normalize_visible_devices(&session, Some(&once)).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_empty_spec_shows_nothing() {
    let session = session();
    assert!(resolve_visible_devices(&session, Some("")).unwrap().is_empty());
}
