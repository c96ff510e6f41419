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

use std::path::{Path, PathBuf};

use crate::device::readers::nvml::NvmlBackend;

/// Device nodes created by the Ascend driver.
const ASCEND_DEVICE_NODES: [&str; 2] = ["/dev/davinci_manager", "/dev/davinci0"];

pub fn has_nvidia() -> bool {
    NvmlBackend::is_available()
}

/// True if `command` resolves to an executable, either as a path or via PATH
pub fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|path| path.is_file())
    })
}

pub fn has_npu_smi(command: &str) -> bool {
    find_executable(command).is_some()
}

pub fn has_ascend_driver() -> bool {
    ASCEND_DEVICE_NODES.iter().any(|node| Path::new(node).exists())
}

pub fn get_os_type() -> &'static str {
    std::env::consts::OS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_find_executable() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("/bin/sh").is_some());
        assert!(find_executable("/nonexistent/npu-smi").is_none());
        assert!(!has_npu_smi("definitely-not-a-real-tool-4821"));
    }
}
