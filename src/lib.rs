//! # RustyMod: eager neural-network modules in Rust
//!
//! **RustyMod** is a small library of neural-network modules (linear and
//! convolutional layers, normalization, recurrent cores) built on eager,
//! dtype-tagged tensors, plus the scaffolding that checks every module under
//! reduced precision.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustymod::integration::{find, DTypeChecker};
//! use rustymod::config::ConformanceConfig;
//! use rustymod::runtime::platform::Device;
//! use rustymod::tensor::DType;
//!
//! // 1. Pick a registered module
//! let linear = find("Linear").unwrap();
//!
//! // 2. Check that bfloat16 in means bfloat16 out
//! let config = ConformanceConfig::default().with_test_dtype(DType::BF16);
//! let checker = DTypeChecker::new(Device::local(), config);
//! let outcome = checker.check_descriptor(linear).unwrap();
//! println!("{:?}", outcome);
//! ```

// Declare public modules that constitute the core library API.
pub mod config;
pub mod integration;
pub mod nn;
pub mod runtime;
pub mod tensor;
pub mod transform;
pub mod tree;
