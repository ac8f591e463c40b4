//! # Neural Network Layers Module
//!
//! Eager building blocks for neural networks. A layer holds only its
//! configuration; parameters and state live in the [`Context`] of a
//! transformed function (see [`crate::transform`]), keyed by the layer's
//! name.
//!
//! ## Available Layers
//!
//! ### Core Layers
//! - [`Linear`], [`Bias`]: dense layer and learned bias
//! - [`ConvND`], [`ConvNDTranspose`]: 1-3 dimensional (transposed) convolutions
//! - [`Embed`]: embedding lookup table
//! - [`Flatten`], [`Reshape`], [`Sequential`]
//!
//! ### Normalization
//! - [`LayerNorm`], [`InstanceNorm`], [`BatchNorm`], [`SpectralNorm`]
//! - [`ExponentialMovingAverage`]: running statistics kept in state
//!
//! ### Recurrent
//! - [`VanillaRnn`], [`Lstm`], [`Gru`], [`ResetCore`]
//! - [`static_unroll`], [`dynamic_unroll`]
//!
//! ### Networks
//! - [`Mlp`]
//!
//! ## Example
//!
//! ```ignore
//! use rustymod::nn::{Linear, Module};
//! use rustymod::transform::transform_with_state;
//!
//! let linear = Linear::new(10);
//! let f = transform_with_state(|ctx, x| Ok(linear.forward(ctx, x)?.into()));
//! let (params, state) = f.init(42, &x)?;
//! let (out, state) = f.apply(&params, &state, 42, &x)?;
//! ```
//!
//! [`Context`]: crate::transform::Context

pub mod basic;
pub mod batchnorm;
pub mod conv;
pub mod embedding;
pub mod initializers;
pub mod linear;
pub mod module;
pub mod moving_average;
pub mod nets;
pub mod norm;
pub mod recurrent;
pub mod spectral_norm;
pub mod unroll;

pub use basic::{Flatten, Layer, Reshape, Sequential};
pub use batchnorm::BatchNorm;
pub use conv::{ConvConfig, ConvND, ConvNDTranspose};
pub use embedding::Embed;
pub use initializers::{FanMode, Initializer};
pub use linear::{Bias, Linear};
pub use moving_average::ExponentialMovingAverage;
pub use nets::Mlp;
pub use norm::{InstanceNorm, LayerNorm};
pub use recurrent::{Gru, Lstm, ResetCore, VanillaRnn};
pub use spectral_norm::SpectralNorm;
pub use unroll::{dynamic_unroll, static_unroll, Unroller, DYNAMIC_UNROLL, STATIC_UNROLL};

// Base traits
pub use module::{Module, ModuleError, ModuleResult, RnnCore};

/// `kind()` of every module type this library exports.
pub const MODULE_KINDS: &[&str] = &[
    "BatchNorm",
    "Bias",
    "Conv1D",
    "Conv1DTranspose",
    "Conv2D",
    "Conv2DTranspose",
    "Conv3D",
    "Conv3DTranspose",
    "Embed",
    "ExponentialMovingAverage",
    "Flatten",
    "GRU",
    "InstanceNorm",
    "LSTM",
    "LayerNorm",
    "Linear",
    "Reshape",
    "ResetCore",
    "Sequential",
    "SpectralNorm",
    "VanillaRNN",
    "nets.MLP",
];
