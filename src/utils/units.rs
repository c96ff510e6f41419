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

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::reading::{Reading, NA};

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;
pub const PIB: u64 = 1 << 50;

static SIZE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<value>\d+(?:\.\d+)?)\s*(?P<unit>[KMGTP]i?B|B)?\s*$").unwrap()
});

/// Convert megabytes as printed by vendor tools (MiB) to bytes
#[inline]
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(MIB)
}

/// Convert watts to milliwatts, rounding to the nearest milliwatt
#[inline]
pub fn watts_to_milliwatts(watts: f64) -> u32 {
    (watts * 1000.0).round().clamp(0.0, u32::MAX as f64) as u32
}

/// Human readable size, with precision shrinking as values grow.
pub fn bytes2human(bytes: Reading<u64>) -> String {
    let Reading::Value(b) = bytes else {
        return NA.to_string();
    };
    let f = b as f64;
    if b < KIB {
        format!("{b}B")
    } else if b < MIB {
        format!("{}KiB", (f / KIB as f64).round())
    } else if b <= 20 * GIB {
        format!("{}MiB", (f / MIB as f64).round())
    } else if b < 100 * GIB {
        format!("{:.2}GiB", f / GIB as f64)
    } else if b < 1000 * GIB {
        format!("{:.1}GiB", f / GIB as f64)
    } else if b < 100 * TIB {
        format!("{:.2}TiB", f / TIB as f64)
    } else if b < 1000 * TIB {
        format!("{:.1}TiB", f / TIB as f64)
    } else {
        format!("{:.2}PiB", f / PIB as f64)
    }
}

/// Parse "512MiB", "1.5 GiB", "42" (bytes) and the like.
pub fn human2bytes(text: &str) -> Option<u64> {
    let caps = SIZE_PATTERN.captures(text)?;
    let value: f64 = caps.name("value")?.as_str().parse().ok()?;
    let scale = match caps.name("unit").map(|m| m.as_str()) {
        None | Some("B") => 1,
        Some("KiB") | Some("KB") => KIB,
        Some("MiB") | Some("MB") => MIB,
        Some("GiB") | Some("GB") => GIB,
        Some("TiB") | Some("TB") => TIB,
        Some("PiB") | Some("PB") => PIB,
        Some(_) => return None,
    };
    Some((value * scale as f64).round() as u64)
}

/// Percentage with at most one decimal, or "N/A".
pub fn utilization2string(percent: Reading<f64>) -> String {
    match percent {
        Reading::Value(p) if p.fract() == 0.0 => format!("{p:.0}%"),
        Reading::Value(p) => format!("{p:.1}%"),
        Reading::NotApplicable => NA.to_string(),
    }
}
