//! Fully connected layer and learned bias.

use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleError, ModuleResult};
use crate::tensor::Tensor;
use crate::transform::Context;

/// Fully connected layer computing `y = x · w + b`.
///
/// Weights have shape `[in, out]` and are created the first time the layer
/// sees an input, so the input size never has to be declared.
#[derive(Debug, Clone)]
pub struct Linear {
    pub output_size: usize,
    pub with_bias: bool,
    pub w_init: Option<Initializer>,
    pub b_init: Initializer,
    name: String,
}

impl Linear {
    pub fn new(output_size: usize) -> Self {
        Self {
            output_size,
            with_bias: true,
            w_init: None,
            b_init: Initializer::zeros(),
            name: "linear".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    pub fn with_w_init(mut self, init: Initializer) -> Self {
        self.w_init = Some(init);
        self
    }
}

impl Module for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "Linear"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, inputs)?;
        let input_size = *inputs
            .shape()
            .last()
            .ok_or_else(|| ModuleError::invalid_input(&self.name, "input must have rank >= 1"))?;
        let w_init = self
            .w_init
            .unwrap_or_else(|| Initializer::lecun_truncated(input_size));
        let w = ctx.get_parameter(
            &self.name,
            "w",
            &[input_size, self.output_size],
            dtype,
            &w_init,
        )?;
        let out = inputs.matmul(&w)?;
        if !self.with_bias {
            return Ok(out);
        }
        let b = ctx.get_parameter(&self.name, "b", &[self.output_size], dtype, &self.b_init)?;
        Ok(out.add(&b)?)
    }
}

/// Adds a learned bias over every non-batch dimension of the input.
#[derive(Debug, Clone)]
pub struct Bias {
    pub b_init: Initializer,
    name: String,
}

impl Bias {
    pub fn new() -> Self {
        Self {
            b_init: Initializer::zeros(),
            name: "bias".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for Bias {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Bias {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "Bias"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, inputs)?;
        if inputs.ndim() < 2 {
            return Err(ModuleError::invalid_input(
                &self.name,
                "input must have a batch dimension and at least one feature dimension",
            ));
        }
        let b = ctx.get_parameter(&self.name, "b", &inputs.shape()[1..], dtype, &self.b_init)?;
        Ok(inputs.add(&b)?)
    }
}
