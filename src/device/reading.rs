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

use serde::{Deserialize, Serialize};

/// Text shown wherever a reading is not applicable.
pub const NA: &str = "N/A";

/// A telemetry value, or the marker that it is unsupported or unavailable
/// this cycle.
///
/// `NotApplicable` is not zero and not "unknown yet": formatting code must
/// check for it before doing arithmetic. It serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading<T> {
    Value(T),
    NotApplicable,
}

impl<T> Default for Reading<T> {
    fn default() -> Self {
        Reading::NotApplicable
    }
}

impl<T> Reading<T> {
    #[inline]
    pub fn is_na(&self) -> bool {
        matches!(self, Reading::NotApplicable)
    }

    #[inline]
    pub fn is_value(&self) -> bool {
        !self.is_na()
    }

    pub fn value(self) -> Option<T> {
        match self {
            Reading::Value(v) => Some(v),
            Reading::NotApplicable => None,
        }
    }

    pub fn as_ref(&self) -> Reading<&T> {
        match self {
            Reading::Value(v) => Reading::Value(v),
            Reading::NotApplicable => Reading::NotApplicable,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Reading<U> {
        match self {
            Reading::Value(v) => Reading::Value(f(v)),
            Reading::NotApplicable => Reading::NotApplicable,
        }
    }

    pub fn and_then<U, F: FnOnce(T) -> Reading<U>>(self, f: F) -> Reading<U> {
        match self {
            Reading::Value(v) => f(v),
            Reading::NotApplicable => Reading::NotApplicable,
        }
    }

    /// Both values, or `NotApplicable` if either side is.
    pub fn zip<U>(self, other: Reading<U>) -> Reading<(T, U)> {
        match (self, other) {
            (Reading::Value(a), Reading::Value(b)) => Reading::Value((a, b)),
            _ => Reading::NotApplicable,
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        self.value().unwrap_or(default)
    }

    pub fn or(self, other: Reading<T>) -> Reading<T> {
        if self.is_na() {
            other
        } else {
            self
        }
    }
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Reading::Value(v),
            None => Reading::NotApplicable,
        }
    }
}

impl<T> From<Reading<T>> for Option<T> {
    fn from(value: Reading<T>) -> Self {
        value.value()
    }
}

impl<T: fmt::Display> fmt::Display for Reading<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value(v) => v.fmt(f),
            Reading::NotApplicable => f.pad(NA),
        }
    }
}

/// Percentage rounded to one decimal, as long as `total` is non-zero.
pub fn percent_of(used: Reading<u64>, total: Reading<u64>) -> Reading<f64> {
    match (used, total) {
        (Reading::Value(used), Reading::Value(total)) if total > 0 => {
            Reading::Value(round1(100.0 * used as f64 / total as f64))
        }
        _ => Reading::NotApplicable,
    }
}

#[inline]
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_applicable_is_not_zero() {
        let na: Reading<u64> = Reading::NotApplicable;
        assert_ne!(na, Reading::Value(0));
        assert!(na.is_na());
        assert_eq!(na.value(), None);
        assert_eq!(Reading::<u64>::default(), Reading::NotApplicable);
    }

    #[test]
    fn test_display_pads_na() {
        let na: Reading<u32> = Reading::NotApplicable;
        assert_eq!(na.to_string(), "N/A");
        assert_eq!(format!("{na:>5}"), "  N/A");
        assert_eq!(Reading::Value(42u32).to_string(), "42");
    }

    #[test]
    fn test_zip_requires_both_values() {
        assert_eq!(
            Reading::Value(1u32).zip(Reading::Value(2u32)),
            Reading::Value((1, 2))
        );
        assert!(Reading::Value(1u32)
            .zip(Reading::<u32>::NotApplicable)
            .is_na());
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(
            percent_of(Reading::Value(20701), Reading::Value(65536)),
            Reading::Value(31.6)
        );
        assert_eq!(
            percent_of(Reading::Value(3628), Reading::Value(15609)),
            Reading::Value(23.2)
        );
        assert!(percent_of(Reading::Value(1), Reading::Value(0)).is_na());
        assert!(percent_of(Reading::NotApplicable, Reading::Value(10)).is_na());
    }

    #[test]
    fn test_serializes_as_null() {
        let na: Reading<u32> = Reading::NotApplicable;
        assert_eq!(serde_json::to_string(&na).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Reading::Value(5u32)).unwrap(), "5");
    }
}
