//! Configuration of a conformance run.
//!
//! Values come from code (`with_*` builders), from the environment
//! ([`ConformanceConfig::from_env`]) or from the command line.

use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TEST_DTYPE_ENV: &str = "RUSTYMOD_TEST_DTYPE";
pub const SEED_ENV: &str = "RUSTYMOD_SEED";
pub const APPLICATIONS_ENV: &str = "RUSTYMOD_APPLICATIONS";
pub const FILTER_ENV: &str = "RUSTYMOD_FILTER";

/// Errors in configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Settings of the precision conformance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformanceConfig {
    /// Reduced-precision dtype the modules are checked under.
    pub test_dtype: DType,
    /// Seed for the input sample, `init` and `apply`.
    pub seed: u64,
    /// Number of consecutive applications, threading state.
    pub applications: usize,
    /// Only descriptors whose name contains this substring are checked.
    pub filter: Option<String>,
}

impl Default for ConformanceConfig {
    fn default() -> Self {
        Self {
            test_dtype: DType::BF16,
            seed: 42,
            applications: 2,
            filter: None,
        }
    }
}

impl ConformanceConfig {
    pub fn with_test_dtype(mut self, test_dtype: DType) -> Self {
        self.test_dtype = test_dtype;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_applications(mut self, applications: usize) -> Self {
        self.applications = applications;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Whether a descriptor named `name` is selected by the filter.
    pub fn selects(&self, name: &str) -> bool {
        self.filter.as_deref().map_or(true, |f| name.contains(f))
    }

    /// Defaults overridden by any `RUSTYMOD_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(TEST_DTYPE_ENV) {
            let dtype: DType = value.parse().map_err(|e: crate::tensor::TensorError| {
                invalid(TEST_DTYPE_ENV, &value, e.to_string())
            })?;
            if !dtype.is_float() {
                return Err(invalid(TEST_DTYPE_ENV, &value, "not a floating-point dtype"));
            }
            config.test_dtype = dtype;
        }
        if let Some(value) = lookup(SEED_ENV) {
            config.seed = value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(SEED_ENV, &value, e.to_string()))?;
        }
        if let Some(value) = lookup(APPLICATIONS_ENV) {
            let applications: usize = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                invalid(APPLICATIONS_ENV, &value, e.to_string())
            })?;
            if applications == 0 {
                return Err(invalid(APPLICATIONS_ENV, &value, "must be at least 1"));
            }
            config.applications = applications;
        }
        if let Some(value) = lookup(FILTER_ENV) {
            if !value.is_empty() {
                config.filter = Some(value);
            }
        }
        Ok(config)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}
