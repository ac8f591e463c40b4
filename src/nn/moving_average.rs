//! Exponential moving averages kept in module state.

use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleResult};
use crate::tensor::{DType, Tensor};
use crate::transform::Context;

/// Tracks `hidden = hidden * decay + value * (1 - decay)`.
///
/// State: an `int32` scalar `counter`, plus `hidden` and `average` with the
/// shape and dtype of the tracked value. With `zero_debias` the average is
/// divided by `1 - decay^counter`, which removes the bias towards the zero
/// initial value.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    pub decay: f32,
    pub zero_debias: bool,
    name: String,
}

impl ExponentialMovingAverage {
    pub fn new(decay: f32) -> Self {
        Self {
            decay,
            zero_debias: true,
            name: "exponential_moving_average".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_zero_debias(mut self, zero_debias: bool) -> Self {
        self.zero_debias = zero_debias;
        self
    }

    /// Folds `value` into the average and returns the new average.
    ///
    /// With `update_stats == false` the result is computed but the state is
    /// left untouched.
    pub fn update(
        &self,
        ctx: &mut Context<'_>,
        value: &Tensor,
        update_stats: bool,
    ) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, value)?;
        let counter = ctx
            .get_state(&self.name, "counter", &[], DType::I32, &Initializer::zeros())?
            .add_int(1)?;
        let hidden = ctx.get_state(&self.name, "hidden", value.shape(), dtype, &Initializer::zeros())?;
        let hidden = hidden
            .mul_scalar(self.decay)?
            .add(&value.mul_scalar(1.0 - self.decay)?)?;

        let average = if self.zero_debias {
            let steps = counter.to_scalar_f32()?;
            hidden.div_scalar(1.0 - self.decay.powf(steps))?
        } else {
            hidden.clone()
        };

        if update_stats {
            ctx.set_state(&self.name, "counter", counter);
            ctx.set_state(&self.name, "hidden", hidden);
            ctx.set_state(&self.name, "average", average.clone());
        }
        Ok(average)
    }

    /// The last stored average, zeros of `shape` before the first update.
    pub fn average(&self, ctx: &mut Context<'_>, shape: &[usize], dtype: DType) -> ModuleResult<Tensor> {
        ctx.get_state(&self.name, "average", shape, dtype, &Initializer::zeros())
    }
}

impl Module for ExponentialMovingAverage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "ExponentialMovingAverage"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        self.update(ctx, inputs, true)
    }
}
