//! Module defining `DType` and the eager `Tensor`.
//!
//! A `Tensor` owns its data as an `ndarray::ArrayD` of one of the supported
//! element types. Reduced-precision floats (`bf16`, `f16`) come from the
//! `half` crate; arithmetic on them is carried out in `f32` and rounded back
//! after every operation, so a chain of operations on `bf16` tensors behaves
//! like it would on hardware with native `bf16` storage.
//!
//! Binary operations promote their operands (see [`DType::promote`]).
//! Scalar operations (`add_scalar`, `mul_scalar`, ...) are weakly typed and
//! keep the dtype of the tensor they are applied to.

use crate::runtime::cpu_backend::{self, Padding};
use half::{bf16, f16};
use ndarray::{ArrayD, ArrayView, Axis, IxDyn, Slice, Zip};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("cannot broadcast shapes {lhs:?} and {rhs:?}")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("operation `{op}` expects a floating-point tensor, got {dtype}")]
    NotFloat { op: &'static str, dtype: DType },

    #[error("operation `{op}` expects an int32 tensor, got {dtype}")]
    NotInteger { op: &'static str, dtype: DType },

    #[error("operation `{op}` expects a bool tensor, got {dtype}")]
    NotBool { op: &'static str, dtype: DType },

    #[error("index {index} is out of range for an axis of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("axis {axis} is out of range for a tensor of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("unknown dtype `{0}`")]
    UnknownDType(String),
}

pub type TensorResult<T> = std::result::Result<T, TensorError>;

/// Element type of a tensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    BF16,
    F16,
    I32,
    Bool,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::BF16 | DType::F16)
    }

    /// `true` for float formats narrower than 32 bits.
    pub fn is_reduced_precision(self) -> bool {
        matches!(self, DType::BF16 | DType::F16)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::BF16 => "bfloat16",
            DType::F16 => "float16",
            DType::I32 => "int32",
            DType::Bool => "bool",
        }
    }

    /// Result dtype of a binary operation on `self` and `other`.
    ///
    /// Equal dtypes are kept, `bool < int32 < any float`, and two different
    /// float formats meet at `float32`.
    pub fn promote(self, other: DType) -> DType {
        match (self, other) {
            (a, b) if a == b => a,
            (DType::Bool, x) | (x, DType::Bool) => x,
            (DType::I32, x) | (x, DType::I32) => x,
            _ => DType::F32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(DType::F32),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f16" | "float16" | "half" => Ok(DType::F16),
            "i32" | "int32" => Ok(DType::I32),
            "bool" => Ok(DType::Bool),
            _ => Err(TensorError::UnknownDType(s.to_string())),
        }
    }
}

/// An eager, dtype-tagged n-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    BF16(ArrayD<bf16>),
    F16(ArrayD<f16>),
    I32(ArrayD<i32>),
    Bool(ArrayD<bool>),
}

/// Runs `$body` with `$a` bound to the array of whatever variant `$t` holds.
macro_rules! with_array {
    ($t:expr, $a:ident => $body:expr) => {
        match $t {
            Tensor::F32($a) => $body,
            Tensor::BF16($a) => $body,
            Tensor::F16($a) => $body,
            Tensor::I32($a) => $body,
            Tensor::Bool($a) => $body,
        }
    };
}

/// Like `with_array!`, but wraps the result back into the same variant.
macro_rules! map_array {
    ($t:expr, $a:ident => $body:expr) => {
        match $t {
            Tensor::F32($a) => Tensor::F32($body),
            Tensor::BF16($a) => Tensor::BF16($body),
            Tensor::F16($a) => Tensor::F16($body),
            Tensor::I32($a) => Tensor::I32($body),
            Tensor::Bool($a) => Tensor::Bool($body),
        }
    };
}

fn shape_error(e: ndarray::ShapeError) -> TensorError {
    TensorError::Shape(e.to_string())
}

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> TensorResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let l = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let r = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        out[i] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(TensorError::Broadcast {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                })
            }
        };
    }
    Ok(out)
}

impl Tensor {
    // --- Construction ---

    /// Builds a tensor of `dtype` from `f32` data, rounding as needed.
    pub fn from_f32_array(data: ArrayD<f32>, dtype: DType) -> Self {
        match dtype {
            DType::F32 => Tensor::F32(data),
            DType::BF16 => Tensor::BF16(data.mapv(bf16::from_f32)),
            DType::F16 => Tensor::F16(data.mapv(f16::from_f32)),
            DType::I32 => Tensor::I32(data.mapv(|v| v as i32)),
            DType::Bool => Tensor::Bool(data.mapv(|v| v != 0.0)),
        }
    }

    pub fn from_i32_array(data: ArrayD<i32>) -> Self {
        Tensor::I32(data)
    }

    pub fn from_bool_array(data: ArrayD<bool>) -> Self {
        Tensor::Bool(data)
    }

    pub fn full(shape: &[usize], value: f32, dtype: DType) -> Self {
        Self::from_f32_array(ArrayD::from_elem(IxDyn(shape), value), dtype)
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f32, dtype: DType) -> Self {
        Self::full(&[], value, dtype)
    }

    /// Samples a float32 tensor uniformly from `[0, 1)` with a fixed seed.
    ///
    /// Two calls with the same `shape` and `seed` return bit-identical tensors.
    pub fn random_uniform(shape: &[usize], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::random_uniform_using(shape, 0.0, 1.0, &mut rng)
    }

    /// Samples a float32 tensor uniformly from `[low, high)`.
    ///
    /// A degenerate range (`low >= high`) fills the tensor with `low`.
    pub fn random_uniform_using<R: Rng + ?Sized>(
        shape: &[usize],
        low: f32,
        high: f32,
        rng: &mut R,
    ) -> Self {
        if low >= high {
            return Self::full(shape, low, DType::F32);
        }
        Tensor::F32(ArrayD::random_using(IxDyn(shape), Uniform::new(low, high), rng))
    }

    /// Samples a float32 tensor from the standard normal distribution.
    pub fn random_normal_using<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        Tensor::F32(ArrayD::random_using(IxDyn(shape), StandardNormal, rng))
    }

    // --- Introspection ---

    pub fn dtype(&self) -> DType {
        match self {
            Tensor::F32(_) => DType::F32,
            Tensor::BF16(_) => DType::BF16,
            Tensor::F16(_) => DType::F16,
            Tensor::I32(_) => DType::I32,
            Tensor::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Tensor::F32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bf16(&self) -> Option<&ArrayD<bf16>> {
        match self {
            Tensor::BF16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f16(&self) -> Option<&ArrayD<f16>> {
        match self {
            Tensor::F16(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&ArrayD<i32>> {
        match self {
            Tensor::I32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&ArrayD<bool>> {
        match self {
            Tensor::Bool(a) => Some(a),
            _ => None,
        }
    }

    /// Widens the data to `f32`, whatever the dtype.
    pub fn to_f32_array(&self) -> ArrayD<f32> {
        match self {
            Tensor::F32(a) => a.clone(),
            Tensor::BF16(a) => a.mapv(|v| v.to_f32()),
            Tensor::F16(a) => a.mapv(|v| v.to_f32()),
            Tensor::I32(a) => a.mapv(|v| v as f32),
            Tensor::Bool(a) => a.mapv(|v| if v { 1.0 } else { 0.0 }),
        }
    }

    /// Value of a single-element tensor, widened to `f32`.
    pub fn to_scalar_f32(&self) -> TensorResult<f32> {
        if self.len() != 1 {
            return Err(TensorError::Shape(format!(
                "expected a single-element tensor, got shape {:?}",
                self.shape()
            )));
        }
        self.to_f32_array()
            .iter()
            .next()
            .copied()
            .ok_or_else(|| TensorError::Shape("empty tensor".to_string()))
    }

    /// Converts to `dtype`. Casting to the current dtype returns a copy.
    pub fn cast(&self, dtype: DType) -> Tensor {
        if self.dtype() == dtype {
            return self.clone();
        }
        match (self, dtype) {
            (Tensor::I32(a), DType::Bool) => Tensor::Bool(a.mapv(|v| v != 0)),
            (Tensor::Bool(a), DType::I32) => Tensor::I32(a.mapv(i32::from)),
            _ => Self::from_f32_array(self.to_f32_array(), dtype),
        }
    }

    // --- Elementwise ---

    /// Applies `f` in `f32` and rounds back to the tensor's float dtype.
    fn map_float<F: Fn(f32) -> f32>(&self, op: &'static str, f: F) -> TensorResult<Tensor> {
        Ok(match self {
            Tensor::F32(a) => Tensor::F32(a.mapv(f)),
            Tensor::BF16(a) => Tensor::BF16(a.mapv(|v| bf16::from_f32(f(v.to_f32())))),
            Tensor::F16(a) => Tensor::F16(a.mapv(|v| f16::from_f32(f(v.to_f32())))),
            other => {
                return Err(TensorError::NotFloat {
                    op,
                    dtype: other.dtype(),
                })
            }
        })
    }

    /// Broadcasting binary float operation; the result has the promoted dtype.
    fn zip_float<F: Fn(f32, f32) -> f32>(
        &self,
        rhs: &Tensor,
        op: &'static str,
        f: F,
    ) -> TensorResult<Tensor> {
        let dtype = self.dtype().promote(rhs.dtype());
        if !dtype.is_float() {
            return Err(TensorError::NotFloat { op, dtype });
        }
        let lhs_data = self.to_f32_array();
        let rhs_data = rhs.to_f32_array();
        let shape = broadcast_shape(lhs_data.shape(), rhs_data.shape())?;
        let broadcast_err = || TensorError::Broadcast {
            lhs: lhs_data.shape().to_vec(),
            rhs: rhs_data.shape().to_vec(),
        };
        let l = lhs_data.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
        let r = rhs_data.broadcast(IxDyn(&shape)).ok_or_else(broadcast_err)?;
        let out = Zip::from(&l).and(&r).map_collect(|&a, &b| f(a, b));
        Ok(Self::from_f32_array(out, dtype))
    }

    pub fn add(&self, rhs: &Tensor) -> TensorResult<Tensor> {
        self.zip_float(rhs, "add", |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> TensorResult<Tensor> {
        self.zip_float(rhs, "sub", |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> TensorResult<Tensor> {
        self.zip_float(rhs, "mul", |a, b| a * b)
    }

    pub fn div(&self, rhs: &Tensor) -> TensorResult<Tensor> {
        self.zip_float(rhs, "div", |a, b| a / b)
    }

    pub fn add_scalar(&self, value: f32) -> TensorResult<Tensor> {
        self.map_float("add_scalar", |v| v + value)
    }

    pub fn mul_scalar(&self, value: f32) -> TensorResult<Tensor> {
        self.map_float("mul_scalar", |v| v * value)
    }

    pub fn div_scalar(&self, value: f32) -> TensorResult<Tensor> {
        self.map_float("div_scalar", |v| v / value)
    }

    /// `value - self`.
    pub fn rsub_scalar(&self, value: f32) -> TensorResult<Tensor> {
        self.map_float("rsub_scalar", |v| value - v)
    }

    pub fn maximum_scalar(&self, value: f32) -> TensorResult<Tensor> {
        self.map_float("maximum_scalar", |v| v.max(value))
    }

    pub fn relu(&self) -> TensorResult<Tensor> {
        self.map_float("relu", |v| v.max(0.0))
    }

    pub fn sigmoid(&self) -> TensorResult<Tensor> {
        self.map_float("sigmoid", |v| 1.0 / (1.0 + (-v).exp()))
    }

    pub fn tanh(&self) -> TensorResult<Tensor> {
        self.map_float("tanh", f32::tanh)
    }

    pub fn sqrt(&self) -> TensorResult<Tensor> {
        self.map_float("sqrt", f32::sqrt)
    }

    pub fn rsqrt(&self) -> TensorResult<Tensor> {
        self.map_float("rsqrt", |v| 1.0 / v.sqrt())
    }

    pub fn square(&self) -> TensorResult<Tensor> {
        self.map_float("square", |v| v * v)
    }

    /// Adds `value` to every element of an int32 tensor.
    pub fn add_int(&self, value: i32) -> TensorResult<Tensor> {
        match self {
            Tensor::I32(a) => Ok(Tensor::I32(a.mapv(|v| v.wrapping_add(value)))),
            other => Err(TensorError::NotInteger {
                op: "add_int",
                dtype: other.dtype(),
            }),
        }
    }

    /// Picks `on_true` where `mask` is set and `on_false` elsewhere.
    ///
    /// All three operands broadcast against each other.
    pub fn select(mask: &Tensor, on_true: &Tensor, on_false: &Tensor) -> TensorResult<Tensor> {
        let mask_data = mask.as_bool().ok_or(TensorError::NotBool {
            op: "select",
            dtype: mask.dtype(),
        })?;
        let dtype = on_true.dtype().promote(on_false.dtype());
        let t = on_true.to_f32_array();
        let f = on_false.to_f32_array();
        let shape = broadcast_shape(&broadcast_shape(mask_data.shape(), t.shape())?, f.shape())?;
        let err = || TensorError::Shape(format!("cannot broadcast select operands to {:?}", shape));
        let m = mask_data.broadcast(IxDyn(&shape)).ok_or_else(err)?;
        let tv = t.broadcast(IxDyn(&shape)).ok_or_else(err)?;
        let fv = f.broadcast(IxDyn(&shape)).ok_or_else(err)?;
        let out = Zip::from(&m)
            .and(&tv)
            .and(&fv)
            .map_collect(|&keep, &a, &b| if keep { a } else { b });
        Ok(Self::from_f32_array(out, dtype))
    }

    // --- Reductions ---

    fn check_axes(&self, axes: &[usize]) -> TensorResult<Vec<usize>> {
        let rank = self.ndim();
        if let Some(&axis) = axes.iter().find(|&&a| a >= rank) {
            return Err(TensorError::AxisOutOfRange { axis, rank });
        }
        let mut sorted = axes.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        sorted.dedup();
        Ok(sorted)
    }

    /// Sums over `axes`, keeping them as length-one axes when `keepdims`.
    pub fn sum_axes(&self, axes: &[usize], keepdims: bool) -> TensorResult<Tensor> {
        if !self.dtype().is_float() {
            return Err(TensorError::NotFloat {
                op: "sum_axes",
                dtype: self.dtype(),
            });
        }
        let mut data = self.to_f32_array();
        // Highest axis first so the remaining indices stay valid.
        for axis in self.check_axes(axes)? {
            data = data.sum_axis(Axis(axis));
            if keepdims {
                data = data.insert_axis(Axis(axis));
            }
        }
        Ok(Self::from_f32_array(data, self.dtype()))
    }

    pub fn mean_axes(&self, axes: &[usize], keepdims: bool) -> TensorResult<Tensor> {
        let axes = self.check_axes(axes)?;
        let count: usize = axes.iter().map(|&a| self.shape()[a]).product();
        if count == 0 {
            return Err(TensorError::Shape("mean over an empty axis".to_string()));
        }
        let sum = self.sum_axes(&axes, keepdims)?;
        sum.div_scalar(count as f32)
    }

    /// Population variance over `axes`.
    pub fn var_axes(&self, axes: &[usize], keepdims: bool) -> TensorResult<Tensor> {
        let mean = self.mean_axes(axes, true)?;
        self.sub(&mean)?.square()?.mean_axes(axes, keepdims)
    }

    // --- Linear algebra and convolution ---

    /// `self[..., k] x rhs[k, n] -> [..., n]`.
    pub fn matmul(&self, rhs: &Tensor) -> TensorResult<Tensor> {
        let dtype = self.dtype().promote(rhs.dtype());
        if !dtype.is_float() {
            return Err(TensorError::NotFloat { op: "matmul", dtype });
        }
        let out = cpu_backend::matmul(&self.to_f32_array(), &rhs.to_f32_array())?;
        Ok(Self::from_f32_array(out, dtype))
    }

    /// Channels-last convolution; `kernel` is `[k..., in, out]`.
    pub fn conv(&self, kernel: &Tensor, stride: &[usize], padding: Padding) -> TensorResult<Tensor> {
        let dtype = self.dtype().promote(kernel.dtype());
        if !dtype.is_float() {
            return Err(TensorError::NotFloat { op: "conv", dtype });
        }
        let out = cpu_backend::conv_nd(&self.to_f32_array(), &kernel.to_f32_array(), stride, padding)?;
        Ok(Self::from_f32_array(out, dtype))
    }

    /// Channels-last transposed convolution; `kernel` is `[k..., out, in]`.
    pub fn conv_transpose(
        &self,
        kernel: &Tensor,
        stride: &[usize],
        padding: Padding,
    ) -> TensorResult<Tensor> {
        let dtype = self.dtype().promote(kernel.dtype());
        if !dtype.is_float() {
            return Err(TensorError::NotFloat {
                op: "conv_transpose",
                dtype,
            });
        }
        let out = cpu_backend::conv_transpose_nd(
            &self.to_f32_array(),
            &kernel.to_f32_array(),
            stride,
            padding,
        )?;
        Ok(Self::from_f32_array(out, dtype))
    }

    /// Gathers rows of a `[vocab, dim]` table for every id in `ids`.
    pub fn take_rows(&self, ids: &Tensor) -> TensorResult<Tensor> {
        let ids = ids.as_i32().ok_or(TensorError::NotInteger {
            op: "take_rows",
            dtype: ids.dtype(),
        })?;
        let out = cpu_backend::embedding(ids, &self.to_f32_array())?;
        Ok(Self::from_f32_array(out, self.dtype()))
    }

    // --- Shape manipulation ---

    pub fn reshape(&self, shape: &[usize]) -> TensorResult<Tensor> {
        let expected: usize = shape.iter().product();
        if expected != self.len() {
            return Err(TensorError::Shape(format!(
                "cannot reshape {:?} into {:?}",
                self.shape(),
                shape
            )));
        }
        Ok(map_array!(self, a => a
            .to_shape(IxDyn(shape))
            .map_err(shape_error)?
            .into_owned()))
    }

    pub fn expand_dims(&self, axis: usize) -> TensorResult<Tensor> {
        if axis > self.ndim() {
            return Err(TensorError::AxisOutOfRange {
                axis,
                rank: self.ndim(),
            });
        }
        Ok(map_array!(self, a => a.clone().insert_axis(Axis(axis))))
    }

    /// Removes a length-one axis.
    pub fn squeeze(&self, axis: usize) -> TensorResult<Tensor> {
        match self.shape().get(axis) {
            Some(1) => self.index_axis(axis, 0),
            Some(&len) => Err(TensorError::Shape(format!(
                "cannot squeeze axis {} of length {}",
                axis, len
            ))),
            None => Err(TensorError::AxisOutOfRange {
                axis,
                rank: self.ndim(),
            }),
        }
    }

    /// The sub-tensor at `index` along `axis`, with that axis removed.
    pub fn index_axis(&self, axis: usize, index: usize) -> TensorResult<Tensor> {
        let len = *self.shape().get(axis).ok_or(TensorError::AxisOutOfRange {
            axis,
            rank: self.ndim(),
        })?;
        if index >= len {
            return Err(TensorError::IndexOutOfRange {
                index: index as i64,
                len,
            });
        }
        Ok(map_array!(self, a => a.index_axis(Axis(axis), index).to_owned()))
    }

    /// Elements `start..end` along `axis`.
    pub fn slice_axis(&self, axis: usize, start: usize, end: usize) -> TensorResult<Tensor> {
        let len = *self.shape().get(axis).ok_or(TensorError::AxisOutOfRange {
            axis,
            rank: self.ndim(),
        })?;
        if start > end || end > len {
            return Err(TensorError::Shape(format!(
                "slice {}..{} out of bounds for axis of length {}",
                start, end, len
            )));
        }
        Ok(map_array!(self, a => a.slice_axis(Axis(axis), Slice::from(start..end)).to_owned()))
    }

    /// Reorders axes; `axes[i]` is the source axis of output axis `i`.
    pub fn permute(&self, axes: &[usize]) -> TensorResult<Tensor> {
        let rank = self.ndim();
        let mut seen = vec![false; rank];
        for &axis in axes {
            if axis >= rank || seen[axis] {
                return Err(TensorError::Shape(format!(
                    "invalid permutation {:?} for rank {}",
                    axes, rank
                )));
            }
            seen[axis] = true;
        }
        if axes.len() != rank {
            return Err(TensorError::Shape(format!(
                "invalid permutation {:?} for rank {}",
                axes, rank
            )));
        }
        Ok(map_array!(self, a => a
            .clone()
            .permuted_axes(IxDyn(axes))
            .as_standard_layout()
            .into_owned()))
    }

    /// Swaps the last two axes.
    pub fn transpose(&self) -> TensorResult<Tensor> {
        let rank = self.ndim();
        if rank < 2 {
            return Err(TensorError::Shape(format!(
                "transpose needs rank >= 2, got {}",
                rank
            )));
        }
        let mut axes: Vec<usize> = (0..rank).collect();
        axes.swap(rank - 2, rank - 1);
        self.permute(&axes)
    }

    /// Stacks tensors along a new `axis`, promoting to a common dtype.
    pub fn stack(tensors: &[Tensor], axis: usize) -> TensorResult<Tensor> {
        Self::join(tensors, axis, true)
    }

    /// Concatenates tensors along an existing `axis`, promoting to a common dtype.
    pub fn concat(tensors: &[Tensor], axis: usize) -> TensorResult<Tensor> {
        Self::join(tensors, axis, false)
    }

    fn join(tensors: &[Tensor], axis: usize, new_axis: bool) -> TensorResult<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::Shape("cannot join an empty sequence".to_string()))?;
        let dtype = tensors
            .iter()
            .fold(first.dtype(), |acc, t| acc.promote(t.dtype()));
        let cast: Vec<Tensor> = tensors.iter().map(|t| t.cast(dtype)).collect();
        Ok(match dtype {
            DType::F32 => Tensor::F32(join_arrays(&cast, axis, new_axis, Tensor::as_f32)?),
            DType::BF16 => Tensor::BF16(join_arrays(&cast, axis, new_axis, Tensor::as_bf16)?),
            DType::F16 => Tensor::F16(join_arrays(&cast, axis, new_axis, Tensor::as_f16)?),
            DType::I32 => Tensor::I32(join_arrays(&cast, axis, new_axis, Tensor::as_i32)?),
            DType::Bool => Tensor::Bool(join_arrays(&cast, axis, new_axis, Tensor::as_bool)?),
        })
    }
}

fn join_arrays<A: Clone>(
    tensors: &[Tensor],
    axis: usize,
    new_axis: bool,
    get: fn(&Tensor) -> Option<&ArrayD<A>>,
) -> TensorResult<ArrayD<A>> {
    let views: Vec<ArrayView<'_, A, IxDyn>> = tensors
        .iter()
        .map(|t| get(t).map(|a| a.view()))
        .collect::<Option<_>>()
        .ok_or_else(|| TensorError::Shape("mixed dtypes after promotion".to_string()))?;
    let joined = if new_axis {
        ndarray::stack(Axis(axis), &views)
    } else {
        ndarray::concatenate(Axis(axis), &views)
    };
    joined.map_err(shape_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_promotion_rules() {
        assert_eq!(DType::BF16.promote(DType::BF16), DType::BF16);
        assert_eq!(DType::BF16.promote(DType::F32), DType::F32);
        assert_eq!(DType::BF16.promote(DType::F16), DType::F32);
        assert_eq!(DType::I32.promote(DType::BF16), DType::BF16);
        assert_eq!(DType::Bool.promote(DType::I32), DType::I32);
    }

    #[test]
    fn test_dtype_parsing() {
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert!("complex64".parse::<DType>().is_err());
    }

    #[test]
    fn test_cast_keeps_shape() {
        let t = Tensor::random_uniform(&[2, 3], 0);
        let b = t.cast(DType::BF16);
        assert_eq!(b.dtype(), DType::BF16);
        assert_eq!(b.shape(), &[2, 3]);
        assert_eq!(b.cast(DType::BF16), b);
    }

    #[test]
    fn test_random_uniform_is_deterministic() {
        let a = Tensor::random_uniform(&[4, 5], 42);
        let b = Tensor::random_uniform(&[4, 5], 42);
        let c = Tensor::random_uniform(&[4, 5], 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_f32_array().iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_scalar_ops_keep_reduced_precision() {
        let t = Tensor::ones(&[3], DType::BF16);
        let out = t.add_scalar(1e-5).unwrap().mul_scalar(3.0).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        let out = t.rsqrt().unwrap().rsub_scalar(1.0).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
    }

    #[test]
    fn test_broadcasting_add() {
        let a = Tensor::from_f32_array(array![[1.0, 2.0], [3.0, 4.0]].into_dyn(), DType::F32);
        let b = Tensor::from_f32_array(array![10.0, 20.0].into_dyn(), DType::BF16);
        let out = a.add(&b).unwrap();
        assert_eq!(out.dtype(), DType::F32);
        assert_eq!(out.to_f32_array(), array![[11.0f32, 22.0], [13.0, 24.0]].into_dyn());

        let c = Tensor::zeros(&[3], DType::F32);
        assert!(matches!(a.add(&c), Err(TensorError::Broadcast { .. })));
    }

    #[test]
    fn test_float_ops_reject_integers() {
        let ids = Tensor::from_i32_array(array![1i32, 2].into_dyn());
        assert!(matches!(ids.relu(), Err(TensorError::NotFloat { .. })));
        assert_eq!(ids.add_int(1).unwrap().as_i32().unwrap(), &array![2i32, 3].into_dyn());
    }

    #[test]
    fn test_mean_and_var() {
        let t = Tensor::from_f32_array(array![[1.0, 3.0], [5.0, 7.0]].into_dyn(), DType::F32);
        let mean = t.mean_axes(&[0], true).unwrap();
        assert_eq!(mean.shape(), &[1, 2]);
        assert_eq!(mean.to_f32_array(), array![[3.0f32, 5.0]].into_dyn());
        let var = t.var_axes(&[1], false).unwrap();
        assert_eq!(var.shape(), &[2]);
        assert_abs_diff_eq!(var.to_f32_array()[[0]], 1.0, epsilon = 1e-6);
        assert!(t.mean_axes(&[2], true).is_err());
    }

    #[test]
    fn test_select_broadcasts_mask() {
        let mask = Tensor::from_bool_array(array![[true], [false]].into_dyn());
        let a = Tensor::ones(&[2, 3], DType::BF16);
        let b = Tensor::zeros(&[2, 3], DType::BF16);
        let out = Tensor::select(&mask, &a, &b).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
        assert_eq!(
            out.to_f32_array(),
            array![[1.0f32, 1.0, 1.0], [0.0, 0.0, 0.0]].into_dyn()
        );
    }

    #[test]
    fn test_shape_manipulation() {
        let t = Tensor::random_uniform(&[2, 3, 4], 1);
        assert_eq!(t.reshape(&[6, 4]).unwrap().shape(), &[6, 4]);
        assert!(t.reshape(&[5, 5]).is_err());
        assert_eq!(t.expand_dims(0).unwrap().shape(), &[1, 2, 3, 4]);
        assert_eq!(t.expand_dims(0).unwrap().squeeze(0).unwrap(), t);
        assert_eq!(t.index_axis(1, 2).unwrap().shape(), &[2, 4]);
        assert_eq!(t.slice_axis(2, 1, 3).unwrap().shape(), &[2, 3, 2]);
        assert_eq!(t.transpose().unwrap().shape(), &[2, 4, 3]);

        let stacked = Tensor::stack(&[t.clone(), t.cast(DType::BF16)], 0).unwrap();
        assert_eq!(stacked.shape(), &[2, 2, 3, 4]);
        assert_eq!(stacked.dtype(), DType::F32);
        let joined = Tensor::concat(&[t.clone(), t.clone()], 2).unwrap();
        assert_eq!(joined.shape(), &[2, 3, 8]);
    }
}
