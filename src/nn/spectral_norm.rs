//! Spectral normalization of a weight-like input.

use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleError, ModuleResult};
use crate::tensor::Tensor;
use crate::transform::Context;

/// Divides its input by an estimate of its largest singular value.
///
/// Inputs of rank > 2 are treated as a `[-1, last_dim]` matrix. The estimate
/// is refined by `n_steps` power iterations per call, starting from the `u0`
/// vector kept in state; the last estimate is stored as `sigma`.
#[derive(Debug, Clone)]
pub struct SpectralNorm {
    pub eps: f32,
    pub n_steps: usize,
    name: String,
}

impl SpectralNorm {
    pub fn new() -> Self {
        Self {
            eps: 1e-4,
            n_steps: 1,
            name: "spectral_norm".to_string(),
        }
    }

    pub fn with_n_steps(mut self, n_steps: usize) -> Self {
        self.n_steps = n_steps;
        self
    }

    pub fn normalize(
        &self,
        ctx: &mut Context<'_>,
        value: &Tensor,
        update_stats: bool,
    ) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, value)?;
        if value.ndim() < 2 {
            return Err(ModuleError::invalid_input(
                &self.name,
                "spectral normalization needs an input of rank >= 2",
            ));
        }
        let cols = value.shape()[value.ndim() - 1];
        let matrix = value.reshape(&[value.len() / cols.max(1), cols])?;

        let mut u0 = ctx.get_state(
            &self.name,
            "u0",
            &[1, cols],
            dtype,
            &Initializer::RandomNormal {
                stddev: 1.0,
                mean: 0.0,
            },
        )?;
        let matrix_t = matrix.transpose()?;
        let mut v0 = l2_normalize(&u0.matmul(&matrix_t)?, self.eps)?;
        for step in 0..self.n_steps {
            if step > 0 {
                v0 = l2_normalize(&u0.matmul(&matrix_t)?, self.eps)?;
            }
            u0 = l2_normalize(&v0.matmul(&matrix)?, self.eps)?;
        }

        let sigma = v0.matmul(&matrix)?.matmul(&u0.transpose()?)?.reshape(&[])?;
        let normalized = matrix.div(&sigma)?.reshape(value.shape())?;

        if update_stats {
            ctx.set_state(&self.name, "u0", u0);
            ctx.set_state(&self.name, "sigma", sigma);
        }
        Ok(normalized)
    }
}

impl Default for SpectralNorm {
    fn default() -> Self {
        Self::new()
    }
}

fn l2_normalize(x: &Tensor, eps: f32) -> ModuleResult<Tensor> {
    let axes: Vec<usize> = (0..x.ndim()).collect();
    let norm = x.square()?.sum_axes(&axes, true)?.add_scalar(eps)?.rsqrt()?;
    Ok(x.mul(&norm)?)
}

impl Module for SpectralNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "SpectralNorm"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        self.normalize(ctx, inputs, true)
    }
}
