//! Parameter-free shape modules and `Sequential`.

use crate::nn::module::{Module, ModuleError, ModuleResult};
use crate::tensor::{Tensor, TensorResult};
use crate::transform::Context;

/// Reshapes all but the first `preserve_dims` dimensions.
///
/// One entry of `output_shape` may be `-1`; its size is inferred.
#[derive(Debug, Clone)]
pub struct Reshape {
    pub output_shape: Vec<isize>,
    pub preserve_dims: usize,
    name: String,
}

impl Reshape {
    pub fn new(output_shape: Vec<isize>) -> Self {
        Self {
            output_shape,
            preserve_dims: 1,
            name: "reshape".to_string(),
        }
    }

    pub fn with_preserve_dims(mut self, preserve_dims: usize) -> Self {
        self.preserve_dims = preserve_dims;
        self
    }

    fn resolve(&self, inputs: &Tensor) -> ModuleResult<Vec<usize>> {
        if inputs.ndim() < self.preserve_dims {
            return Err(ModuleError::invalid_input(
                &self.name,
                format!(
                    "input {:?} has fewer than {} dims",
                    inputs.shape(),
                    self.preserve_dims
                ),
            ));
        }
        let (kept, rest) = inputs.shape().split_at(self.preserve_dims);
        let total: usize = rest.iter().product();
        let known: usize = self
            .output_shape
            .iter()
            .filter(|&&d| d >= 0)
            .map(|&d| d as usize)
            .product();
        let inferred = self.output_shape.iter().filter(|&&d| d < 0).count();
        let fill = match inferred {
            0 => None,
            1 if known > 0 && total % known == 0 => Some(total / known),
            _ => {
                return Err(ModuleError::invalid_input(
                    &self.name,
                    format!("cannot reshape {:?} into {:?}", rest, self.output_shape),
                ))
            }
        };
        let mut shape = kept.to_vec();
        shape.extend(
            self.output_shape
                .iter()
                .map(|&d| if d < 0 { fill.unwrap_or(0) } else { d as usize }),
        );
        Ok(shape)
    }
}

impl Module for Reshape {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "Reshape"
    }

    fn forward(&self, _ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let shape = self.resolve(inputs)?;
        Ok(inputs.reshape(&shape)?)
    }
}

/// Flattens everything after the first `preserve_dims` dimensions.
#[derive(Debug, Clone)]
pub struct Flatten {
    inner: Reshape,
}

impl Flatten {
    pub fn new() -> Self {
        let mut inner = Reshape::new(vec![-1]);
        inner.name = "flatten".to_string();
        Self { inner }
    }

    pub fn with_preserve_dims(mut self, preserve_dims: usize) -> Self {
        self.inner.preserve_dims = preserve_dims;
        self
    }
}

impl Default for Flatten {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Flatten {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> &'static str {
        "Flatten"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        // Nothing to flatten.
        if inputs.ndim() <= self.inner.preserve_dims {
            return Ok(inputs.clone());
        }
        self.inner.forward(ctx, inputs)
    }
}

/// A step of a [`Sequential`].
pub enum Layer {
    Module(Box<dyn Module>),
    /// A stateless function such as an activation.
    Fn(fn(&Tensor) -> TensorResult<Tensor>),
}

impl Layer {
    pub fn module(module: impl Module + 'static) -> Self {
        Layer::Module(Box::new(module))
    }
}

/// Runs layers one after another.
pub struct Sequential {
    layers: Vec<Layer>,
    name: String,
}

impl Sequential {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            layers,
            name: "sequential".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    fn run(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        is_training: Option<bool>,
    ) -> ModuleResult<Tensor> {
        let mut out = inputs.clone();
        for layer in &self.layers {
            out = match (layer, is_training) {
                (Layer::Module(module), Some(is_training)) => {
                    module.forward_train(ctx, &out, is_training)?
                }
                (Layer::Module(module), None) => module.forward(ctx, &out)?,
                (Layer::Fn(f), _) => f(&out)?,
            };
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "Sequential"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        self.run(ctx, inputs, None)
    }

    /// Passes `is_training` on to every module layer.
    fn forward_train(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        is_training: bool,
    ) -> ModuleResult<Tensor> {
        self.run(ctx, inputs, Some(is_training))
    }
}
