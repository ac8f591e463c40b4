//! CPU kernels behind the heavier tensor operations.
//!
//! Kernels work on `f32` data; `Tensor` widens its operands before calling
//! them and rounds the result back to the promoted dtype. Layouts follow the
//! channels-last convention: inputs are `[batch, spatial..., channels]`.

use crate::tensor::TensorError;
use ndarray::{Array2, ArrayD, Ix2, IxDyn};
use serde::{Deserialize, Serialize};

/// Padding scheme for convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Padding {
    /// Output spatial size is `ceil(input / stride)`.
    #[default]
    Same,
    /// No padding; only positions where the kernel fits are computed.
    Valid,
}

fn shape_error(e: ndarray::ShapeError) -> TensorError {
    TensorError::Shape(e.to_string())
}

/// Row-major strides for a contiguous array of `shape`.
fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Converts a flat row-major index into a multi-index over `dims`.
fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for (slot, &dim) in out.iter_mut().zip(dims).rev() {
        *slot = flat % dim;
        flat /= dim;
    }
}

/// `lhs[..., k] x rhs[k, n] -> [..., n]`.
pub fn matmul(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    if rhs.ndim() != 2 || lhs.ndim() == 0 {
        return Err(TensorError::Shape(format!(
            "matmul expects [..., k] x [k, n], got {:?} and {:?}",
            lhs.shape(),
            rhs.shape()
        )));
    }
    let (k, n) = (rhs.shape()[0], rhs.shape()[1]);
    let lead = &lhs.shape()[..lhs.ndim() - 1];
    if lhs.shape()[lhs.ndim() - 1] != k {
        return Err(TensorError::Shape(format!(
            "incompatible matmul shapes {:?} and {:?}",
            lhs.shape(),
            rhs.shape()
        )));
    }
    let rows: usize = lead.iter().product();
    let lhs2 = lhs.to_shape((rows, k)).map_err(shape_error)?;
    let rhs2 = rhs.view().into_dimensionality::<Ix2>().map_err(shape_error)?;
    let product = lhs2.dot(&rhs2);

    let mut out_shape = lead.to_vec();
    out_shape.push(n);
    product
        .into_shape_with_order(IxDyn(&out_shape))
        .map_err(shape_error)
}

/// Output size and leading padding per spatial dimension.
fn conv_geometry(
    spatial: &[usize],
    kernel: &[usize],
    stride: &[usize],
    padding: Padding,
) -> Result<(Vec<usize>, Vec<usize>), TensorError> {
    let mut out = Vec::with_capacity(spatial.len());
    let mut pad_before = Vec::with_capacity(spatial.len());
    for ((&size, &k), &s) in spatial.iter().zip(kernel).zip(stride) {
        if s == 0 || k == 0 {
            return Err(TensorError::Shape(format!(
                "kernel {:?} and stride {:?} must be positive",
                kernel, stride
            )));
        }
        match padding {
            Padding::Same => {
                let o = size.div_ceil(s);
                let total = ((o.saturating_sub(1)) * s + k).saturating_sub(size);
                out.push(o);
                pad_before.push(total / 2);
            }
            Padding::Valid => {
                if k > size {
                    return Err(TensorError::Shape(format!(
                        "kernel {:?} does not fit input {:?} without padding",
                        kernel, spatial
                    )));
                }
                out.push((size - k) / s + 1);
                pad_before.push(0);
            }
        }
    }
    Ok((out, pad_before))
}

/// N-d convolution via im2col.
///
/// `input` is `[batch, spatial..., in]`, `kernel` is `[k..., in, out]` and
/// `stride` has one entry per spatial dimension.
pub fn conv_nd(
    input: &ArrayD<f32>,
    kernel: &ArrayD<f32>,
    stride: &[usize],
    padding: Padding,
) -> Result<ArrayD<f32>, TensorError> {
    let n = stride.len();
    if input.ndim() != n + 2 || kernel.ndim() != n + 2 {
        return Err(TensorError::Shape(format!(
            "conv with {} spatial dims got input {:?} and kernel {:?}",
            n,
            input.shape(),
            kernel.shape()
        )));
    }
    let batch = input.shape()[0];
    let spatial = &input.shape()[1..=n];
    let in_channels = input.shape()[n + 1];
    let kernel_shape = &kernel.shape()[..n];
    let out_channels = kernel.shape()[n + 1];
    if kernel.shape()[n] != in_channels {
        return Err(TensorError::Shape(format!(
            "kernel expects {} input channels, input has {}",
            kernel.shape()[n],
            in_channels
        )));
    }

    let (out_spatial, pad_before) = conv_geometry(spatial, kernel_shape, stride, padding)?;
    let out_positions: usize = out_spatial.iter().product();
    let kernel_positions: usize = kernel_shape.iter().product();
    let cols = kernel_positions * in_channels;

    let input = input.as_standard_layout();
    let data = input
        .as_slice()
        .ok_or_else(|| TensorError::Shape("input is not contiguous".to_string()))?;
    let strides = contiguous_strides(input.shape());

    let mut patches = vec![0.0f32; batch * out_positions * cols];
    let mut out_idx = vec![0; n];
    let mut k_idx = vec![0; n];
    for b in 0..batch {
        for o in 0..out_positions {
            unravel(o, &out_spatial, &mut out_idx);
            let row = (b * out_positions + o) * cols;
            'kernel: for kp in 0..kernel_positions {
                unravel(kp, kernel_shape, &mut k_idx);
                let mut offset = b * strides[0];
                for d in 0..n {
                    let pos = (out_idx[d] * stride[d] + k_idx[d]) as isize - pad_before[d] as isize;
                    if pos < 0 || pos >= spatial[d] as isize {
                        continue 'kernel;
                    }
                    offset += pos as usize * strides[d + 1];
                }
                let dst = row + kp * in_channels;
                patches[dst..dst + in_channels].copy_from_slice(&data[offset..offset + in_channels]);
            }
        }
    }

    let patches = Array2::from_shape_vec((batch * out_positions, cols), patches).map_err(shape_error)?;
    let kernel2 = kernel.to_shape((cols, out_channels)).map_err(shape_error)?;
    let product = patches.dot(&kernel2);

    let mut out_shape = Vec::with_capacity(n + 2);
    out_shape.push(batch);
    out_shape.extend_from_slice(&out_spatial);
    out_shape.push(out_channels);
    product
        .into_shape_with_order(IxDyn(&out_shape))
        .map_err(shape_error)
}

/// N-d transposed convolution.
///
/// `input` is `[batch, spatial..., in]` and `kernel` is `[k..., out, in]`.
/// Every input position scatters `kernel · x` into a window of the output
/// starting at `position * stride`; the full result is then cropped to
/// `input * stride` (`Same`) or kept whole (`Valid`).
pub fn conv_transpose_nd(
    input: &ArrayD<f32>,
    kernel: &ArrayD<f32>,
    stride: &[usize],
    padding: Padding,
) -> Result<ArrayD<f32>, TensorError> {
    let n = stride.len();
    if input.ndim() != n + 2 || kernel.ndim() != n + 2 {
        return Err(TensorError::Shape(format!(
            "conv_transpose with {} spatial dims got input {:?} and kernel {:?}",
            n,
            input.shape(),
            kernel.shape()
        )));
    }
    let batch = input.shape()[0];
    let spatial = input.shape()[1..=n].to_vec();
    let in_channels = input.shape()[n + 1];
    let kernel_shape = kernel.shape()[..n].to_vec();
    let out_channels = kernel.shape()[n];
    if kernel.shape()[n + 1] != in_channels {
        return Err(TensorError::Shape(format!(
            "kernel expects {} input channels, input has {}",
            kernel.shape()[n + 1],
            in_channels
        )));
    }
    if stride.iter().chain(&kernel_shape).any(|&v| v == 0) {
        return Err(TensorError::Shape(format!(
            "kernel {:?} and stride {:?} must be positive",
            kernel_shape, stride
        )));
    }

    let mut out_spatial = Vec::with_capacity(n);
    let mut crop_before = Vec::with_capacity(n);
    for d in 0..n {
        let full = spatial[d].saturating_sub(1) * stride[d] + kernel_shape[d];
        let size = match padding {
            Padding::Same => spatial[d] * stride[d],
            Padding::Valid => full,
        };
        crop_before.push(full.saturating_sub(size) / 2);
        out_spatial.push(size);
    }

    let in_positions: usize = spatial.iter().product();
    let kernel_positions: usize = kernel_shape.iter().product();

    // [k, out, in] -> [in, k * out] so one matmul yields every contribution.
    let kernel3 = kernel
        .to_shape((kernel_positions, out_channels, in_channels))
        .map_err(shape_error)?;
    let weights = kernel3
        .permuted_axes([2, 0, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((in_channels, kernel_positions * out_channels))
        .map_err(shape_error)?;
    let x2 = input
        .to_shape((batch * in_positions, in_channels))
        .map_err(shape_error)?;
    let contributions = x2.dot(&weights);

    let out_positions: usize = out_spatial.iter().product();
    let out_strides = contiguous_strides(&out_spatial);
    let mut out = vec![0.0f32; batch * out_positions * out_channels];
    let mut in_idx = vec![0; n];
    let mut k_idx = vec![0; n];
    for b in 0..batch {
        for p in 0..in_positions {
            unravel(p, &spatial, &mut in_idx);
            let row = contributions.row(b * in_positions + p);
            'kernel: for kp in 0..kernel_positions {
                unravel(kp, &kernel_shape, &mut k_idx);
                let mut flat = 0;
                for d in 0..n {
                    let pos = (in_idx[d] * stride[d] + k_idx[d]) as isize - crop_before[d] as isize;
                    if pos < 0 || pos >= out_spatial[d] as isize {
                        continue 'kernel;
                    }
                    flat += pos as usize * out_strides[d];
                }
                let dst = (b * out_positions + flat) * out_channels;
                for c in 0..out_channels {
                    out[dst + c] += row[kp * out_channels + c];
                }
            }
        }
    }

    let mut out_shape = Vec::with_capacity(n + 2);
    out_shape.push(batch);
    out_shape.extend_from_slice(&out_spatial);
    out_shape.push(out_channels);
    ArrayD::from_shape_vec(IxDyn(&out_shape), out).map_err(shape_error)
}

/// Looks up rows of a `[vocab, dim]` table; the output is `ids.shape + [dim]`.
pub fn embedding(ids: &ArrayD<i32>, table: &ArrayD<f32>) -> Result<ArrayD<f32>, TensorError> {
    let table = table
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(shape_error)?;
    let (vocab, dim) = table.dim();
    let mut out = Vec::with_capacity(ids.len() * dim);
    for &id in ids.iter() {
        if id < 0 || id as usize >= vocab {
            return Err(TensorError::IndexOutOfRange {
                index: i64::from(id),
                len: vocab,
            });
        }
        out.extend(table.row(id as usize).iter().copied());
    }
    let mut shape = ids.shape().to_vec();
    shape.push(dim);
    ArrayD::from_shape_vec(IxDyn(&shape), out).map_err(shape_error)
}
