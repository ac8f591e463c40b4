//! Module implementing N-d convolutions and transposed convolutions.
//!
//! Inputs are channels-last: `[batch, spatial..., channels]`. An unbatched
//! input (`[spatial..., channels]`) is accepted as well and gives an
//! unbatched output.

use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleError, ModuleResult};
use crate::runtime::cpu_backend::Padding;
use crate::tensor::Tensor;
use crate::transform::Context;

/// Configuration shared by [`ConvND`] and [`ConvNDTranspose`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    /// Number of spatial dimensions (1, 2 or 3).
    pub num_spatial_dims: usize,
    /// Number of output channels.
    pub output_channels: usize,
    /// Kernel extent per spatial dimension.
    pub kernel_shape: Vec<usize>,
    /// Stride per spatial dimension.
    pub stride: Vec<usize>,
    pub padding: Padding,
    pub with_bias: bool,
    pub w_init: Option<Initializer>,
    pub b_init: Initializer,
}

impl ConvConfig {
    /// A config with a cubic `kernel_size` kernel, unit stride and `SAME` padding.
    pub fn new(num_spatial_dims: usize, output_channels: usize, kernel_size: usize) -> Self {
        Self {
            num_spatial_dims,
            output_channels,
            kernel_shape: vec![kernel_size; num_spatial_dims],
            stride: vec![1; num_spatial_dims],
            padding: Padding::Same,
            with_bias: true,
            w_init: None,
            b_init: Initializer::zeros(),
        }
    }

    pub fn with_kernel_shape(mut self, kernel_shape: Vec<usize>) -> Self {
        self.kernel_shape = kernel_shape;
        self
    }

    pub fn with_stride(mut self, stride: Vec<usize>) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    fn validate(&self, module: &str) -> ModuleResult<()> {
        let n = self.num_spatial_dims;
        if !(1..=3).contains(&n) {
            return Err(ModuleError::invalid_input(
                module,
                format!("unsupported number of spatial dims: {}", n),
            ));
        }
        if self.kernel_shape.len() != n || self.stride.len() != n {
            return Err(ModuleError::invalid_input(
                module,
                format!(
                    "kernel {:?} and stride {:?} need {} entries",
                    self.kernel_shape, self.stride, n
                ),
            ));
        }
        Ok(())
    }

    fn fan_in(&self, input_channels: usize) -> usize {
        self.kernel_shape.iter().product::<usize>() * input_channels
    }
}

/// Adds a leading batch axis to unbatched inputs; returns whether it did.
fn batched(module: &str, config: &ConvConfig, inputs: &Tensor) -> ModuleResult<(Tensor, bool)> {
    let n = config.num_spatial_dims;
    match inputs.ndim() {
        r if r == n + 2 => Ok((inputs.clone(), false)),
        r if r == n + 1 => Ok((inputs.expand_dims(0)?, true)),
        _ => Err(ModuleError::invalid_input(
            module,
            format!(
                "expected rank {} or {} input, got shape {:?}",
                n + 1,
                n + 2,
                inputs.shape()
            ),
        )),
    }
}

fn add_bias(
    ctx: &mut Context<'_>,
    module: &str,
    config: &ConvConfig,
    out: Tensor,
    unbatched: bool,
) -> ModuleResult<Tensor> {
    let out = if config.with_bias {
        let b = ctx.get_parameter(
            module,
            "b",
            &[config.output_channels],
            out.dtype(),
            &config.b_init,
        )?;
        out.add(&b)?
    } else {
        out
    };
    Ok(if unbatched { out.squeeze(0)? } else { out })
}

/// N-d convolution with a `[k..., in, out]` weight.
#[derive(Debug, Clone)]
pub struct ConvND {
    pub config: ConvConfig,
    name: String,
}

impl ConvND {
    pub fn new(config: ConvConfig) -> Self {
        let name = format!("conv{}_d", config.num_spatial_dims);
        Self { config, name }
    }

    pub fn conv1d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(1, output_channels, kernel_size))
    }

    pub fn conv2d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(2, output_channels, kernel_size))
    }

    pub fn conv3d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(3, output_channels, kernel_size))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Module for ConvND {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        match self.config.num_spatial_dims {
            1 => "Conv1D",
            2 => "Conv2D",
            3 => "Conv3D",
            _ => "ConvND",
        }
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let config = &self.config;
        config.validate(&self.name)?;
        let dtype = require_float(&self.name, inputs)?;
        let (x, unbatched) = batched(&self.name, config, inputs)?;
        let input_channels = x.shape()[config.num_spatial_dims + 1];

        let mut w_shape = config.kernel_shape.clone();
        w_shape.extend([input_channels, config.output_channels]);
        let w_init = config
            .w_init
            .unwrap_or_else(|| Initializer::lecun_truncated(config.fan_in(input_channels)));
        let w = ctx.get_parameter(&self.name, "w", &w_shape, dtype, &w_init)?;

        let out = x.conv(&w, &config.stride, config.padding)?;
        add_bias(ctx, &self.name, config, out, unbatched)
    }
}

/// N-d transposed convolution with a `[k..., out, in]` weight.
///
/// With `SAME` padding the output spatial size is `input * stride`.
#[derive(Debug, Clone)]
pub struct ConvNDTranspose {
    pub config: ConvConfig,
    name: String,
}

impl ConvNDTranspose {
    pub fn new(config: ConvConfig) -> Self {
        let name = format!("conv{}_d_transpose", config.num_spatial_dims);
        Self { config, name }
    }

    pub fn conv1d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(1, output_channels, kernel_size))
    }

    pub fn conv2d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(2, output_channels, kernel_size))
    }

    pub fn conv3d(output_channels: usize, kernel_size: usize) -> Self {
        Self::new(ConvConfig::new(3, output_channels, kernel_size))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Module for ConvNDTranspose {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        match self.config.num_spatial_dims {
            1 => "Conv1DTranspose",
            2 => "Conv2DTranspose",
            3 => "Conv3DTranspose",
            _ => "ConvNDTranspose",
        }
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let config = &self.config;
        config.validate(&self.name)?;
        let dtype = require_float(&self.name, inputs)?;
        let (x, unbatched) = batched(&self.name, config, inputs)?;
        let input_channels = x.shape()[config.num_spatial_dims + 1];

        let mut w_shape = config.kernel_shape.clone();
        w_shape.extend([config.output_channels, input_channels]);
        let w_init = config
            .w_init
            .unwrap_or_else(|| Initializer::lecun_truncated(config.fan_in(input_channels)));
        let w = ctx.get_parameter(&self.name, "w", &w_shape, dtype, &w_init)?;

        let out = x.conv_transpose(&w, &config.stride, config.padding)?;
        add_bias(ctx, &self.name, config, out, unbatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    #[test]
    fn test_conv_same_padding_keeps_spatial_shape() {
        for (conv, shape) in [
            (ConvND::conv1d(3, 3), vec![8, 2, 2]),
            (ConvND::conv2d(3, 3), vec![8, 2, 2, 2]),
            (ConvND::conv3d(3, 3), vec![8, 2, 2, 2, 2]),
        ] {
            let mut ctx = Context::for_init(0);
            let out = conv.forward(&mut ctx, &Tensor::ones(&shape, DType::F32)).unwrap();
            let mut expected = shape.clone();
            *expected.last_mut().unwrap() = 3;
            assert_eq!(out.shape(), expected.as_slice(), "{}", conv.kind());
        }
    }

    #[test]
    fn test_conv_transpose_weight_layout() {
        let conv = ConvNDTranspose::conv2d(3, 3);
        let mut ctx = Context::for_init(0);
        let out = conv
            .forward(&mut ctx, &Tensor::ones(&[8, 2, 2, 2], DType::F32))
            .unwrap();
        assert_eq!(out.shape(), &[8, 2, 2, 3]);
        assert_eq!(conv.kind(), "Conv2DTranspose");
    }

    #[test]
    fn test_strided_transpose_upsamples() {
        let conv = ConvNDTranspose::new(ConvConfig::new(1, 2, 3).with_stride(vec![2]));
        let mut ctx = Context::for_init(0);
        let out = conv.forward(&mut ctx, &Tensor::ones(&[1, 4, 1], DType::F32)).unwrap();
        assert_eq!(out.shape(), &[1, 8, 2]);
    }

    #[test]
    fn test_unbatched_input() {
        let conv = ConvND::conv1d(4, 3).with_name("c");
        let mut ctx = Context::for_init(0);
        let out = conv.forward(&mut ctx, &Tensor::ones(&[5, 2], DType::BF16)).unwrap();
        assert_eq!(out.shape(), &[5, 4]);
        assert_eq!(out.dtype(), DType::BF16);
    }

    #[test]
    fn test_bad_rank_is_rejected() {
        let conv = ConvND::conv2d(3, 3);
        let mut ctx = Context::for_init(0);
        let err = conv.forward(&mut ctx, &Tensor::ones(&[8, 2], DType::F32)).unwrap_err();
        assert!(matches!(err, ModuleError::InvalidInput { .. }));
    }
}
