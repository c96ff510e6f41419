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

//! Visible-device resolution.
//!
//! A spec such as `"0,2"` or `"GPU-5a1c...,GPU-77e0..."` selects and orders
//! the devices a consumer sees; position in the resulting list is the
//! logical index. Parsing is lenient in the same places the vendor runtimes
//! are: trailing garbage after a number is ignored, and the first bad token
//! ends the list instead of failing it. Repeated identifiers hide every
//! device.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::common::config::{AppConfig, EnvConfig};
use crate::device::physical::Device;
use crate::device::session::BackendSession;
use crate::error::{Error, Result};
use crate::utils::lock_or_recover;

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^(?:
            (?:MIG-)?(?:GPU-|NPU-)?
            [0-9a-fA-F]{8}(?:-[0-9a-fA-F]{4}){3}-[0-9a-fA-F]{12}
            (?:/\d+/\d+)?
          |
            (?:GPU|ASCEND|DEVICE)-\d{2,}
        )$",
    )
    .expect("UUID pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Ordinal,
    Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Identifier {
    Ordinal(u32),
    Uuid(String),
}

impl Identifier {
    fn scheme(&self) -> Scheme {
        match self {
            Identifier::Ordinal(_) => Scheme::Ordinal,
            Identifier::Uuid(_) => Scheme::Uuid,
        }
    }
}

/// Trim a token and, if it starts with an optionally signed number, cut it
/// down to that number.
pub fn strip_identifier(token: &str) -> &str {
    let token = token.trim();
    let bytes = token.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits = bytes[sign..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        token
    } else {
        &token[..sign + digits]
    }
}

pub fn is_uuid_like(token: &str) -> bool {
    UUID_PATTERN.is_match(token)
}

fn classify(token: &str) -> Option<Identifier> {
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        token.parse().ok().map(Identifier::Ordinal)
    } else if is_uuid_like(token) {
        Some(Identifier::Uuid(token.to_string()))
    } else {
        None
    }
}

fn parse_spec(session: &Arc<BackendSession>, spec: &str) -> Result<Vec<Device>> {
    let mut devices = Vec::new();
    let mut presented: HashSet<&str> = HashSet::new();
    let mut scheme = None;

    for token in spec.split(',').map(strip_identifier) {
        if presented.contains(token) {
            debug!(spec, token, "duplicate visible device identifier");
            return Ok(Vec::new());
        }

        let Some(identifier) = classify(token) else {
            debug!(spec, token, "unrecognized visible device identifier");
            break;
        };
        let expected = *scheme.get_or_insert(identifier.scheme());
        if identifier.scheme() != expected {
            debug!(spec, token, "mixed ordinal and UUID identifiers");
            break;
        }

        let resolved = match &identifier {
            Identifier::Ordinal(index) => Device::new(session, *index),
            Identifier::Uuid(uuid) => Device::from_uuid(session, uuid),
        };
        match resolved {
            Ok(device) => devices.push(device),
            Err(e) if e.is_backend_unavailable() => return Err(e),
            Err(e) => {
                debug!(spec, token, error = %e, "unresolvable visible device identifier");
                break;
            }
        }
        presented.insert(token);
    }

    Ok(devices)
}

type CacheKey = (Option<String>, u64);

#[derive(Default)]
struct CacheEntries {
    devices: HashMap<CacheKey, Vec<Device>>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<CacheKey>,
}

/// Resolution results keyed by the exact spec string and backend topology.
///
/// Only the current topology generation is kept, and at most
/// `AppConfig::VISIBLE_CACHE_CAPACITY` specs of it; the oldest spec is
/// evicted first.
#[derive(Default)]
pub(crate) struct VisibleDeviceCache {
    entries: Mutex<CacheEntries>,
}

impl VisibleDeviceCache {
    fn get(&self, key: &CacheKey) -> Option<Vec<Device>> {
        lock_or_recover(&self.entries).devices.get(key).cloned()
    }

    fn insert(&self, key: CacheKey, devices: Vec<Device>) {
        let mut guard = lock_or_recover(&self.entries);
        let CacheEntries {
            devices: cached,
            order,
        } = &mut *guard;

        let generation = key.1;
        cached.retain(|(_, g), _| *g == generation);
        order.retain(|(_, g)| *g == generation);

        if !cached.contains_key(&key) {
            while order.len() >= AppConfig::VISIBLE_CACHE_CAPACITY {
                let Some(oldest) = order.pop_front() else {
                    break;
                };
                cached.remove(&oldest);
            }
            order.push_back(key.clone());
        }
        cached.insert(key, devices);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_or_recover(&self.entries).devices.len()
    }
}

/// Devices visible under `spec`, falling back to the visible-devices
/// environment variables, then to every device in discovery order.
///
/// The returned devices carry their logical index. Results are cached per
/// spec string until the backend's topology changes.
pub fn resolve_visible_devices(
    session: &Arc<BackendSession>,
    spec: Option<&str>,
) -> Result<Vec<Device>> {
    let spec = spec.map(str::to_string).or_else(EnvConfig::visible_devices);
    let key = (spec, session.backend().topology_generation());
    if let Some(devices) = session.visible_cache().get(&key) {
        return Ok(devices);
    }

    let physical = match key.0.as_deref() {
        None => Device::all(session)?,
        Some(spec) => parse_spec(session, spec)?,
    };
    let devices: Vec<Device> = physical
        .into_iter()
        .enumerate()
        .map(|(logical, device)| device.with_logical_index(logical))
        .collect();

    session.visible_cache().insert(key, devices.clone());
    Ok(devices)
}

/// Physical indices of the visible devices, in logical order.
pub fn parse_visible_devices(
    session: &Arc<BackendSession>,
    spec: Option<&str>,
) -> Result<Vec<u32>> {
    Ok(resolve_visible_devices(session, spec)?
        .iter()
        .map(Device::physical_index)
        .collect())
}

/// The visible set rewritten as comma-separated UUIDs.
pub fn normalize_visible_devices(
    session: &Arc<BackendSession>,
    spec: Option<&str>,
) -> Result<String> {
    Ok(resolve_visible_devices(session, spec)?
        .iter()
        .map(|device| device.uuid().to_string())
        .collect::<Vec<_>>()
        .join(","))
}

impl Device {
    /// Devices at the given logical indices of the environment's visible set.
    pub fn from_visible_indices(
        session: &Arc<BackendSession>,
        indices: &[usize],
    ) -> Result<Vec<Device>> {
        let visible = resolve_visible_devices(session, None)?;
        indices
            .iter()
            .map(|&logical| {
                visible
                    .get(logical)
                    .cloned()
                    .ok_or(Error::InvalidOrdinal(logical))
            })
            .collect()
    }
}
