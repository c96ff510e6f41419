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

use crate::common::config::EnvConfig;
use crate::error::{Error, Result};

pub const DEFAULT_COMMAND: &str = "npu-smi";

/// Configuration for the npu-smi scraping backend
#[derive(Debug, Clone)]
pub struct NpuSmiConfig {
    /// Executable name or absolute path
    pub command: String,
    /// Arguments producing the summary table
    pub args: Vec<String>,
    /// Minimum age of the cached table before the tool is run again
    pub ttl: Duration,
    /// Wall-clock budget for one invocation
    pub timeout: Duration,
}

impl Default for NpuSmiConfig {
    fn default() -> Self {
        Self {
            command: EnvConfig::npu_smi_path().unwrap_or_else(|| DEFAULT_COMMAND.to_string()),
            args: vec!["info".to_string()],
            ttl: EnvConfig::scrape_ttl(),
            timeout: EnvConfig::command_timeout(),
        }
    }
}

impl NpuSmiConfig {
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments are passed verbatim, so keep them to plain words and flags
    fn validate_arg(arg: &str) -> bool {
        !arg.is_empty()
            && arg.len() <= 32
            && arg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidArgument("npu-smi command is empty".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "npu-smi timeout must be positive".to_string(),
            ));
        }
        for arg in &self.args {
            if !Self::validate_arg(arg) {
                return Err(Error::InvalidArgument(format!(
                    "Invalid npu-smi argument: '{arg}'. Only alphanumeric, dash, dot, and underscore allowed"
                )));
            }
        }
        Ok(())
    }

    pub fn arg_refs(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }
}
