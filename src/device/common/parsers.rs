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

// Field parsers for vendor tables. Placeholder tokens ("NA", "-", ...) and
// unparseable text both become `Reading::NotApplicable`.

use std::str::FromStr;

use crate::common::config::AppConfig;
use crate::device::reading::Reading;
use crate::utils::units::{mib_to_bytes, watts_to_milliwatts};

/// True if the token is one the vendor prints instead of a value
pub fn is_placeholder(token: &str) -> bool {
    let token = token.trim();
    AppConfig::PLACEHOLDER_TOKENS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(token))
}

/// Parse a numeric field, treating placeholders as not applicable
pub fn parse_reading<T: FromStr>(token: &str) -> Reading<T> {
    let token = token.trim();
    if is_placeholder(token) {
        return Reading::NotApplicable;
    }
    token.parse::<T>().ok().into()
}

/// Parse a text field, treating placeholders as not applicable
pub fn parse_text(token: &str) -> Reading<String> {
    let token = token.trim();
    if is_placeholder(token) {
        Reading::NotApplicable
    } else {
        Reading::Value(token.to_string())
    }
}

/// Parse a power string in watts ("88.6", "150W") into milliwatts
pub fn parse_power_w_to_mw(power_str: &str) -> Reading<u32> {
    parse_reading::<f64>(power_str.trim().trim_end_matches('W'))
        .and_then(|w| Reading::from((w.is_finite() && w >= 0.0).then_some(w)))
        .map(watts_to_milliwatts)
}

/// Parse a temperature string ("51", "45C") into degrees Celsius
pub fn parse_temperature(temp_str: &str) -> Reading<u32> {
    parse_reading(temp_str.trim().trim_end_matches(['C', '°']))
}

/// Parse a utilization percentage ("85", "85.5%")
pub fn parse_utilization(util_str: &str) -> Reading<f64> {
    parse_reading(util_str.trim().trim_end_matches('%'))
}

/// Parse a memory amount in MB ("1024", "1024MB") into bytes
pub fn parse_mb_to_bytes(mem_str: &str) -> Reading<u64> {
    let cleaned = mem_str
        .trim()
        .trim_end_matches("MiB")
        .trim_end_matches("MB");
    parse_reading::<u64>(cleaned).map(mib_to_bytes)
}

/// Parse a "used / total" pair of MB values into bytes.
pub fn parse_used_total_mb(pair: &str) -> (Reading<u64>, Reading<u64>) {
    match pair.split_once('/') {
        Some((used, total)) => (parse_mb_to_bytes(used), parse_mb_to_bytes(total)),
        None => (Reading::NotApplicable, Reading::NotApplicable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        for token in ["NA", "N/A", "-", "--", "", "  ", "na"] {
            assert!(is_placeholder(token), "{token:?}");
        }
        assert!(!is_placeholder("0"));
        assert!(parse_reading::<u32>("NA").is_na());
        assert_eq!(parse_reading::<u32>(" 51 "), Reading::Value(51));
        assert!(parse_reading::<u32>("garbage").is_na());
    }

    #[test]
    fn test_parse_power() {
        assert_eq!(parse_power_w_to_mw("88.6"), Reading::Value(88_600));
        assert_eq!(parse_power_w_to_mw("150W"), Reading::Value(150_000));
        assert!(parse_power_w_to_mw("-").is_na());
        assert!(parse_power_w_to_mw("-5").is_na());
    }

    #[test]
    fn test_parse_temperature_and_utilization() {
        assert_eq!(parse_temperature("45C"), Reading::Value(45));
        assert_eq!(parse_temperature("45°C"), Reading::Value(45));
        assert_eq!(parse_utilization("85.5%"), Reading::Value(85.5));
        assert!(parse_utilization("NA").is_na());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_mb_to_bytes("1024MB"), Reading::Value(1_073_741_824));
        assert_eq!(parse_mb_to_bytes("1024"), Reading::Value(1_073_741_824));
        assert!(parse_mb_to_bytes("invalid").is_na());

        let (used, total) = parse_used_total_mb("20701/ 65536");
        assert_eq!(used, Reading::Value(20701 * 1024 * 1024));
        assert_eq!(total, Reading::Value(65536 * 1024 * 1024));
        let (used, total) = parse_used_total_mb("3628");
        assert!(used.is_na() && total.is_na());
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(parse_text(" OK "), Reading::Value("OK".to_string()));
        assert!(parse_text("NA").is_na());
    }
}
