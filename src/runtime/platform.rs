//! Introspection of the local execution device.
//!
//! Reduced-precision formats are emulated on the CPU through the `half`
//! crate. Whether the device reports them as supported is configurable, so
//! a run can reproduce the behavior of hardware without native `bf16`.

use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable that disables reduced-precision support when set to
/// `0`, `false`, `no` or `off`.
pub const REDUCED_PRECISION_ENV: &str = "RUSTYMOD_REDUCED_PRECISION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Cpu,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Cpu => f.write_str("cpu"),
        }
    }
}

/// A device that tensors are computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub platform: Platform,
    /// Whether bf16/f16 tensors are supported.
    pub reduced_precision: bool,
}

impl Device {
    /// The CPU with emulated reduced-precision support.
    pub fn cpu() -> Self {
        Self {
            platform: Platform::Cpu,
            reduced_precision: true,
        }
    }

    /// Returns the device with reduced-precision support switched on or off.
    pub fn with_reduced_precision(mut self, enabled: bool) -> Self {
        self.reduced_precision = enabled;
        self
    }

    /// The first local device, honoring [`REDUCED_PRECISION_ENV`].
    pub fn local() -> Self {
        let enabled = match std::env::var(REDUCED_PRECISION_ENV) {
            Ok(value) => !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            ),
            Err(_) => true,
        };
        let device = Self::cpu().with_reduced_precision(enabled);
        log::debug!(
            "local device: {} (reduced precision: {})",
            device.platform,
            device.reduced_precision
        );
        device
    }

    pub fn supports(&self, dtype: DType) -> bool {
        !dtype.is_reduced_precision() || self.reduced_precision
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_supports_every_dtype() {
        let device = Device::cpu();
        for dtype in [DType::F32, DType::BF16, DType::F16, DType::I32, DType::Bool] {
            assert!(device.supports(dtype), "{} should be supported", dtype);
        }
    }

    #[test]
    fn test_disabled_reduced_precision() {
        let device = Device::cpu().with_reduced_precision(false);
        assert!(!device.supports(DType::BF16));
        assert!(!device.supports(DType::F16));
        assert!(device.supports(DType::F32));
        assert!(device.supports(DType::I32));
    }
}
