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

// Command execution for scraping backends.
//
// Spawn failures map to `Error::LibraryNotFound` when the tool is missing,
// timeouts to `Error::Timeout`, and non-zero exits to `Error::CommandFailed`
// when status checking is requested.

use std::io;
use std::time::Duration;

use tracing::debug;

use crate::common::config::EnvConfig;
use crate::error::{Error, Result};
use crate::utils::command_timeout::run_command_with_timeout;

/// Options to control command execution behavior.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Optional timeout. If None, uses the environment-aware default.
    pub timeout: Option<Duration>,
    /// If true, non-zero exit statuses return an error.
    pub check_status: bool,
}

/// Normalized command output.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code (or -1 if killed by a signal)
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub fn execute_command(
    command: &str,
    args: &[&str],
    options: &CommandOptions,
) -> Result<CommandOutput> {
    let timeout = options.timeout.unwrap_or_else(EnvConfig::command_timeout);
    debug!(command, ?args, ?timeout, "executing command");

    let output = run_command_with_timeout(command, args, timeout).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut => Error::Timeout(timeout),
        io::ErrorKind::NotFound => Error::LibraryNotFound(command.to_string()),
        _ => Error::Io(e),
    })?;

    let status_code = output.status.code().unwrap_or(-1);
    let out = CommandOutput {
        status: status_code,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if options.check_status && status_code != 0 {
        return Err(Error::CommandFailed {
            command: format!("{command} {}", args.join(" ")).trim_end().to_string(),
            code: output.status.code(),
            stderr: out.stderr.trim().to_string(),
        });
    }

    Ok(out)
}
