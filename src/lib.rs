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

//! Accelerator telemetry acquisition and normalization.
//!
//! Talks to NVML or scrapes `npu-smi`, and exposes both through one cached
//! device/process model: [`device::Device`] accessors, oneshot batch
//! caching, snapshots, and visible-device resolution.

pub mod cli;
pub mod collector;
pub mod device;
pub mod error;
pub mod utils;

pub mod common {
    pub mod config;
}

pub use error::{Error, Result};
