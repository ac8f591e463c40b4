use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleError, ModuleResult};
use crate::tensor::Tensor;
use crate::transform::Context;

const DEFAULT_EPS: f32 = 1e-5;

/// Normalizes over `axes`, then applies a learned scale and offset over the
/// last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub axes: Vec<usize>,
    pub create_scale: bool,
    pub create_offset: bool,
    pub eps: f32,
    name: String,
}

impl LayerNorm {
    pub fn new(axes: Vec<usize>, create_scale: bool, create_offset: bool) -> Self {
        LayerNorm {
            axes,
            create_scale,
            create_offset,
            eps: DEFAULT_EPS,
            name: "layer_norm".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn normalize(&self, ctx: &mut Context<'_>, x: &Tensor, axes: &[usize]) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, x)?;
        if let Some(&axis) = axes.iter().find(|&&a| a >= x.ndim()) {
            return Err(ModuleError::invalid_input(
                &self.name,
                format!("axis {} out of range for shape {:?}", axis, x.shape()),
            ));
        }
        let param_shape = match x.shape().last() {
            Some(&d) => vec![d],
            None => return Err(ModuleError::invalid_input(&self.name, "scalar input")),
        };

        let mean = x.mean_axes(axes, true)?;
        let var = x.var_axes(axes, true)?;
        let mut out = x.sub(&mean)?.mul(&var.add_scalar(self.eps)?.rsqrt()?)?;
        if self.create_scale {
            let scale = ctx.get_parameter(&self.name, "scale", &param_shape, dtype, &Initializer::ones())?;
            out = out.mul(&scale)?;
        }
        if self.create_offset {
            let offset =
                ctx.get_parameter(&self.name, "offset", &param_shape, dtype, &Initializer::zeros())?;
            out = out.add(&offset)?;
        }
        Ok(out)
    }
}

impl Module for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "LayerNorm"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        self.normalize(ctx, inputs, &self.axes)
    }
}

/// Normalizes every example and channel over its spatial dimensions.
///
/// Inputs are channels-last, so the spatial axes are `1..rank-1`.
#[derive(Debug, Clone)]
pub struct InstanceNorm {
    inner: LayerNorm,
}

impl InstanceNorm {
    pub fn new(create_scale: bool, create_offset: bool) -> Self {
        Self {
            inner: LayerNorm::new(Vec::new(), create_scale, create_offset).with_name("instance_norm"),
        }
    }
}

impl Module for InstanceNorm {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> &'static str {
        "InstanceNorm"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        if inputs.ndim() < 3 {
            return Err(ModuleError::invalid_input(
                &self.inner.name,
                format!("expected [batch, spatial..., channels], got {:?}", inputs.shape()),
            ));
        }
        let axes: Vec<usize> = (1..inputs.ndim() - 1).collect();
        self.inner.normalize(ctx, inputs, &axes)
    }
}
