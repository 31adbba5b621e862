use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whether a structural mutation (new key, new or removed edge) re-sorts the
/// execution order immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortPolicy {
    /// Re-sort right away. Cycles surface from the mutating call.
    #[default]
    Auto,
    /// Only invalidate the cached order. Nothing fires until `sort()` succeeds,
    /// which lets callers batch several mutations behind one sort.
    Manual,
}

impl FromStr for SortPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(SortPolicy::Auto),
            "manual" => Ok(SortPolicy::Manual),
            other => Err(format!("expected \"auto\" or \"manual\", got {other:?}")),
        }
    }
}

/// Dispatcher tuning. Embeddable in a larger file config via serde; missing
/// fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Policy used by `connect`, `add_dependency` and `remove_dependency`
    /// when the caller does not pass one explicitly.
    pub sort_policy: SortPolicy,
    /// Number of signal groups to preallocate.
    pub group_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            sort_policy: SortPolicy::Auto,
            group_capacity: 0,
        }
    }
}

impl DispatcherConfig {
    /// Load overrides from `SIGORDER_SORT_POLICY` and `SIGORDER_GROUP_CAPACITY`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("SIGORDER_SORT_POLICY") {
            config.sort_policy =
                value
                    .parse()
                    .map_err(|reason| ConfigError::InvalidValue {
                        var: "SIGORDER_SORT_POLICY",
                        value: value.clone(),
                        reason,
                    })?;
        }

        if let Ok(value) = env::var("SIGORDER_GROUP_CAPACITY") {
            config.group_capacity =
                value
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                        var: "SIGORDER_GROUP_CAPACITY",
                        value: value.clone(),
                        reason: e.to_string(),
                    })?;
        }

        tracing::debug!(
            sort_policy = ?config.sort_policy,
            group_capacity = config.group_capacity,
            "Dispatcher config loaded"
        );
        Ok(config)
    }

    pub fn with_sort_policy(mut self, sort_policy: SortPolicy) -> Self {
        self.sort_policy = sort_policy;
        self
    }

    pub fn with_group_capacity(mut self, group_capacity: usize) -> Self {
        self.group_capacity = group_capacity;
        self
    }
}
