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

use std::time::Duration;

/// Application-wide configuration constants
pub struct AppConfig;

impl AppConfig {
    // Data Collection
    pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 2;
    pub const MIN_UPDATE_INTERVAL_MS: u64 = 100;
    pub const SCRAPE_TTL_MS: u64 = 1000;
    pub const PROCESS_UTILIZATION_WINDOW_US: u64 = 1_000_000;
    pub const MAX_DEVICES: u32 = 256;
    pub const VISIBLE_CACHE_CAPACITY: usize = 16;

    // External commands
    pub const COMMAND_TIMEOUT_SECS: u64 = 2;
    pub const CONTAINER_COMMAND_TIMEOUT_MS: u64 = 500;
    pub const COMMAND_POLL_INTERVAL_MS: u64 = 10;

    // Loading intensity thresholds (percent): (light below, heavy at or above)
    pub const MEMORY_UTILIZATION_THRESHOLDS: (f64, f64) = (10.0, 80.0);
    pub const COMPUTE_UTILIZATION_THRESHOLDS: (f64, f64) = (10.0, 75.0);

    /// Tokens the vendor table prints in place of a value.
    pub const PLACEHOLDER_TOKENS: [&'static str; 5] = ["NA", "N/A", "-", "--", ""];

    pub const DEVICE_LOST_NAME: &'static str = "ERROR: Device is lost";
    pub const DEVICE_UNKNOWN_NAME: &'static str = "ERROR: Unknown";
}

/// Environment-specific configuration
pub struct EnvConfig;

impl EnvConfig {
    /// Visible-device variables, highest priority first.
    pub const VISIBLE_DEVICES_VARS: [&'static str; 2] =
        ["ASCEND_RT_VISIBLE_DEVICES", "CUDA_VISIBLE_DEVICES"];
    pub const NPU_SMI_PATH_VAR: &'static str = "NPUTOP_NPU_SMI";
    pub const SCRAPE_TTL_VAR: &'static str = "NPUTOP_SCRAPE_TTL_MS";

    /// Default visible-device spec taken from the environment.
    ///
    /// The first variable with a non-empty value wins, so an empty
    /// `ASCEND_RT_VISIBLE_DEVICES` falls through to `CUDA_VISIBLE_DEVICES`.
    /// When none is non-empty the last variable decides: an empty
    /// `CUDA_VISIBLE_DEVICES` hides every device, an unset one shows them all.
    /// An empty spec passed explicitly by the caller is not affected.
    pub fn visible_devices() -> Option<String> {
        first_non_empty(
            Self::VISIBLE_DEVICES_VARS
                .iter()
                .map(|name| std::env::var(name).ok()),
        )
    }

    pub fn npu_smi_path() -> Option<String> {
        std::env::var(Self::NPU_SMI_PATH_VAR)
            .ok()
            .filter(|path| !path.trim().is_empty())
    }

    pub fn scrape_ttl() -> Duration {
        let millis = std::env::var(Self::SCRAPE_TTL_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(AppConfig::SCRAPE_TTL_MS);
        Duration::from_millis(millis)
    }

    /// Wall-clock budget for one external command, shorter inside containers
    /// where missing vendor tools tend to hang on device nodes.
    pub fn command_timeout() -> Duration {
        if is_container_environment() {
            Duration::from_millis(AppConfig::CONTAINER_COMMAND_TIMEOUT_MS)
        } else {
            Duration::from_secs(AppConfig::COMMAND_TIMEOUT_SECS)
        }
    }

    pub fn poll_interval(requested_secs: Option<f64>) -> Duration {
        let secs = requested_secs.unwrap_or(AppConfig::DEFAULT_UPDATE_INTERVAL_SECS as f64);
        let millis = (secs * 1000.0).round().max(AppConfig::MIN_UPDATE_INTERVAL_MS as f64);
        Duration::from_millis(millis as u64)
    }
}

fn first_non_empty(values: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    let mut last = None;
    for value in values {
        if value.as_deref().is_some_and(|v| !v.is_empty()) {
            return value;
        }
        last = value;
    }
    last
}

/// Detect if we're running in a container environment
pub fn is_container_environment() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::path::Path::new("/run/.containerenv").exists()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
        || std::env::var("CONTAINER_RUNTIME").is_ok()
        || check_cgroup_container()
}

fn check_cgroup_container() -> bool {
    if let Ok(contents) = std::fs::read_to_string("/proc/self/cgroup") {
        contents.contains("/docker/")
            || contents.contains("/lxc/")
            || contents.contains("/kubepods/")
            || contents.contains("/containerd/")
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_defaults_and_floor() {
        assert_eq!(EnvConfig::poll_interval(None), Duration::from_secs(2));
        assert_eq!(
            EnvConfig::poll_interval(Some(0.5)),
            Duration::from_millis(500)
        );
        assert_eq!(
            EnvConfig::poll_interval(Some(0.0)),
            Duration::from_millis(AppConfig::MIN_UPDATE_INTERVAL_MS)
        );
    }

    #[test]
    fn test_empty_visible_devices_falls_through() {
        let env = |ascend: Option<&str>, cuda: Option<&str>| {
            first_non_empty([ascend.map(String::from), cuda.map(String::from)])
        };
        assert_eq!(env(Some(""), Some("1,0")).as_deref(), Some("1,0"));
        assert_eq!(env(Some("2"), Some("1,0")).as_deref(), Some("2"));
        assert_eq!(env(None, Some("1")).as_deref(), Some("1"));
        assert_eq!(env(Some(""), None), None);
        assert_eq!(env(None, Some("")).as_deref(), Some(""));
        assert_eq!(env(Some(""), Some("")).as_deref(), Some(""));
        assert_eq!(env(None, None), None);
    }

    #[test]
    fn test_thresholds_are_ordered() {
        let (low, high) = AppConfig::MEMORY_UTILIZATION_THRESHOLDS;
        assert!(low < high);
        let (low, high) = AppConfig::COMPUTE_UTILIZATION_THRESHOLDS;
        assert!(low < high);
    }

    #[test]
    fn test_placeholders_include_dash_and_empty() {
        assert!(AppConfig::PLACEHOLDER_TOKENS.contains(&"-"));
        assert!(AppConfig::PLACEHOLDER_TOKENS.contains(&""));
        assert!(AppConfig::PLACEHOLDER_TOKENS.contains(&"NA"));
    }
}
