//! Execution environment: numeric kernels and device introspection.
//!
//! - `cpu_backend` holds the kernels behind matmul, convolutions and lookups.
//! - `platform` describes the local device and which dtypes it supports.

pub mod cpu_backend;
pub mod platform;
