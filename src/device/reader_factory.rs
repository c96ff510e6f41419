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

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::device::platform_detection::{get_os_type, has_ascend_driver, has_npu_smi, has_nvidia};
use crate::device::readers::npu_smi::{NpuSmiBackend, NpuSmiConfig};
use crate::device::readers::nvml::NvmlBackend;
use crate::device::traits::TelemetryBackend;
use crate::error::{Error, Result};

/// Which backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Probe NVML first, then npu-smi.
    #[default]
    Auto,
    Nvml,
    NpuSmi,
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChoice::Auto => write!(f, "auto"),
            BackendChoice::Nvml => write!(f, "nvml"),
            BackendChoice::NpuSmi => write!(f, "npu-smi"),
        }
    }
}

impl FromStr for BackendChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendChoice::Auto),
            "nvml" | "nvidia" => Ok(BackendChoice::Nvml),
            "npu-smi" | "npu_smi" | "ascend" => Ok(BackendChoice::NpuSmi),
            other => Err(Error::InvalidArgument(format!("unknown backend '{other}'"))),
        }
    }
}

pub fn create_backend(
    choice: BackendChoice,
    npu_smi: NpuSmiConfig,
) -> Result<Arc<dyn TelemetryBackend>> {
    match choice {
        BackendChoice::Nvml => Ok(Arc::new(NvmlBackend::new())),
        BackendChoice::NpuSmi => Ok(Arc::new(NpuSmiBackend::new(npu_smi))),
        BackendChoice::Auto => {
            if get_os_type() != "linux" && get_os_type() != "windows" {
                return Err(Error::LibraryNotFound(format!(
                    "no accelerator backend for {}",
                    get_os_type()
                )));
            }
            if has_nvidia() {
                info!("using NVML backend");
                return Ok(Arc::new(NvmlBackend::new()));
            }
            if has_npu_smi(&npu_smi.command) || has_ascend_driver() {
                info!(command = %npu_smi.command, "using npu-smi backend");
                return Ok(Arc::new(NpuSmiBackend::new(npu_smi)));
            }
            debug!("neither NVML nor npu-smi is available");
            Err(Error::LibraryNotFound(
                "neither NVML nor npu-smi is available".to_string(),
            ))
        }
    }
}

/// Probe the host for a usable backend with default settings.
pub fn detect_backend() -> Result<Arc<dyn TelemetryBackend>> {
    create_backend(BackendChoice::Auto, NpuSmiConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::types::BackendKind;

    #[test]
    fn test_backend_choice_parsing() {
        assert_eq!("auto".parse::<BackendChoice>().unwrap(), BackendChoice::Auto);
        assert_eq!("NVML".parse::<BackendChoice>().unwrap(), BackendChoice::Nvml);
        assert_eq!("npu-smi".parse::<BackendChoice>().unwrap(), BackendChoice::NpuSmi);
        assert!("rocm".parse::<BackendChoice>().is_err());
        assert_eq!(BackendChoice::NpuSmi.to_string(), "npu-smi");
    }

    #[test]
    fn test_explicit_choice_skips_probing() {
        let backend = create_backend(
            BackendChoice::NpuSmi,
            NpuSmiConfig::with_command("/nonexistent/npu-smi"),
        )
        .unwrap();
        assert_eq!(backend.kind(), BackendKind::NpuSmi);

        let backend = create_backend(BackendChoice::Nvml, NpuSmiConfig::default()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Nvml);
    }
}
