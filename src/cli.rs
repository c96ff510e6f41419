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

use clap::{Parser, ValueEnum};

use crate::common::config::EnvConfig;
use crate::device::readers::npu_smi::NpuSmiConfig;
use crate::device::BackendChoice;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Print one snapshot of every visible device and exit.
    #[arg(long)]
    pub once: bool,
    /// Print snapshots as JSON instead of a text table.
    #[arg(long)]
    pub json: bool,
    /// The interval in seconds between refreshes.
    #[arg(short, long)]
    pub interval: Option<f64>,
    /// Telemetry backend to use.
    #[arg(short, long, value_enum, default_value_t = BackendArg::Auto)]
    pub backend: BackendArg,
    /// Comma-separated device ordinals or UUIDs to show.
    /// Defaults to ASCEND_RT_VISIBLE_DEVICES, then CUDA_VISIBLE_DEVICES.
    #[arg(long)]
    pub visible_devices: Option<String>,
    /// Path to the npu-smi executable.
    #[arg(long, env = "NPUTOP_NPU_SMI")]
    pub npu_smi: Option<String>,
    /// Also list processes running on each device.
    #[arg(short, long)]
    pub processes: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    Auto,
    Nvml,
    NpuSmi,
}

impl From<BackendArg> for BackendChoice {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => BackendChoice::Auto,
            BackendArg::Nvml => BackendChoice::Nvml,
            BackendArg::NpuSmi => BackendChoice::NpuSmi,
        }
    }
}

impl Cli {
    pub fn poll_interval(&self) -> Duration {
        EnvConfig::poll_interval(self.interval)
    }

    pub fn npu_smi_config(&self) -> NpuSmiConfig {
        match &self.npu_smi {
            Some(path) => NpuSmiConfig::with_command(path.clone()),
            None => NpuSmiConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["nputop"]).unwrap();
        assert!(!cli.once);
        assert!(!cli.json);
        assert_eq!(cli.backend, BackendArg::Auto);
        assert_eq!(cli.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "nputop",
            "--once",
            "--json",
            "--interval",
            "0.5",
            "--backend",
            "npu-smi",
            "--visible-devices",
            "1,0",
            "--npu-smi",
            "/opt/bin/npu-smi",
        ])
        .unwrap();
        assert!(cli.once && cli.json);
        assert_eq!(cli.poll_interval(), Duration::from_millis(500));
        assert_eq!(BackendChoice::from(cli.backend), BackendChoice::NpuSmi);
        assert_eq!(cli.visible_devices.as_deref(), Some("1,0"));
        assert_eq!(cli.npu_smi_config().command, "/opt/bin/npu-smi");
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["nputop", "--backend", "rocm"]).is_err());
    }
}
