//! The BatchNorm layer.
//!
//! Batch normalization with train/eval modes, running statistics kept in two
//! `ExponentialMovingAverage`s, and learned scale/offset.

use crate::nn::initializers::Initializer;
use crate::nn::module::{require_float, Module, ModuleError, ModuleResult};
use crate::nn::moving_average::ExponentialMovingAverage;
use crate::tensor::Tensor;
use crate::transform::Context;

/// Added to the variance before the square root.
const EPS: f32 = 1e-5;

/// Decay of the running statistics.
const DEFAULT_DECAY_RATE: f32 = 0.999;

/// Batch normalization layer.
///
/// Normalizes over every axis but the last (channels):
/// `y = scale * (x - mean) / sqrt(var + eps) + offset`.
///
/// In training the current batch statistics are used and the moving
/// averages `{name}/~/mean_ema` and `{name}/~/var_ema` are updated;
/// otherwise the accumulated averages are used.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    pub create_scale: bool,
    pub create_offset: bool,
    pub eps: f32,
    /// Use batch statistics even when `is_training == false`.
    pub test_local_stats: bool,
    mean_ema: ExponentialMovingAverage,
    var_ema: ExponentialMovingAverage,
    name: String,
}

impl BatchNorm {
    /// A BatchNorm named `batch_norm` with the default decay.
    pub fn new(create_scale: bool, create_offset: bool) -> Self {
        Self::named("batch_norm", create_scale, create_offset, DEFAULT_DECAY_RATE)
    }

    /// Rebuilds the layer with a different decay rate.
    pub fn with_decay_rate(self, decay_rate: f32) -> Self {
        let mut bn = Self::named(&self.name, self.create_scale, self.create_offset, decay_rate);
        bn.eps = self.eps;
        bn.test_local_stats = self.test_local_stats;
        bn
    }

    pub fn with_name(self, name: &str) -> Self {
        let mut bn = Self::named(name, self.create_scale, self.create_offset, self.mean_ema.decay);
        bn.eps = self.eps;
        bn.test_local_stats = self.test_local_stats;
        bn
    }

    fn named(name: &str, create_scale: bool, create_offset: bool, decay_rate: f32) -> Self {
        Self {
            create_scale,
            create_offset,
            eps: EPS,
            test_local_stats: false,
            mean_ema: ExponentialMovingAverage::new(decay_rate)
                .with_name(format!("{}/~/mean_ema", name)),
            var_ema: ExponentialMovingAverage::new(decay_rate)
                .with_name(format!("{}/~/var_ema", name)),
            name: name.to_string(),
        }
    }
}

impl Module for BatchNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "BatchNorm"
    }

    /// Inference-mode forward pass.
    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        self.forward_train(ctx, inputs, false)
    }

    fn forward_train(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        is_training: bool,
    ) -> ModuleResult<Tensor> {
        let dtype = require_float(&self.name, inputs)?;
        let rank = inputs.ndim();
        if rank < 2 {
            return Err(ModuleError::invalid_input(
                &self.name,
                format!("expected [batch, ..., channels], got {:?}", inputs.shape()),
            ));
        }
        // Every axis but channels.
        let axes: Vec<usize> = (0..rank - 1).collect();
        let mut stats_shape = vec![1; rank];
        stats_shape[rank - 1] = inputs.shape()[rank - 1];

        let (mean, var) = if is_training || self.test_local_stats {
            let mean = inputs.mean_axes(&axes, true)?;
            let mean_of_squares = inputs.square()?.mean_axes(&axes, true)?;
            let var = mean_of_squares.sub(&mean.square()?)?;
            (mean, var)
        } else {
            (
                self.mean_ema.average(ctx, &stats_shape, dtype)?,
                self.var_ema.average(ctx, &stats_shape, dtype)?,
            )
        };

        if is_training {
            self.mean_ema.update(ctx, &mean, true)?;
            self.var_ema.update(ctx, &var, true)?;
        }

        let mut inv = var.add_scalar(self.eps)?.rsqrt()?;
        if self.create_scale {
            let scale =
                ctx.get_parameter(&self.name, "scale", &stats_shape, dtype, &Initializer::ones())?;
            inv = inv.mul(&scale)?;
        }
        let mut out = inputs.sub(&mean)?.mul(&inv)?;
        if self.create_offset {
            let offset =
                ctx.get_parameter(&self.name, "offset", &stats_shape, dtype, &Initializer::zeros())?;
            out = out.add(&offset)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use crate::transform::transform_with_state;
    use crate::tree::{Leaves, Tree};

    #[test]
    fn test_batchnorm_creation() {
        let bn = BatchNorm::new(true, true);
        assert_eq!(bn.name(), "batch_norm");
        assert_eq!(bn.kind(), "BatchNorm");

        let bn = bn.with_name("bn1").with_decay_rate(0.9);
        assert_eq!(bn.name(), "bn1");
        assert_eq!(bn.mean_ema.name(), "bn1/~/mean_ema");
        assert_eq!(bn.var_ema.decay, 0.9);
    }

    #[test]
    fn test_batchnorm_train_updates_running_stats() {
        let bn = BatchNorm::new(true, true);
        let f = transform_with_state(|ctx, x| Ok(Tree::Leaf(bn.forward_train(ctx, x, true)?)));
        let x = Tensor::random_uniform(&[8, 2, 2, 3], 42);
        let (params, state) = f.init(0, &x).unwrap();
        assert_eq!(params.get("batch_norm", "scale").unwrap().shape(), &[1, 1, 1, 3]);
        assert_eq!(
            state.get("batch_norm/~/mean_ema", "counter").unwrap().dtype(),
            DType::I32
        );

        let (out, state) = f.apply(&params, &state, 0, &x).unwrap();
        assert_eq!(out.leaves()[0].shape(), &[8, 2, 2, 3]);
        let counter = state.get("batch_norm/~/var_ema", "counter").unwrap();
        assert_eq!(counter.to_scalar_f32().unwrap(), 2.0);
    }

    #[test]
    fn test_batchnorm_eval_uses_running_stats() {
        let bn = BatchNorm::new(false, false);
        let mut ctx = Context::for_init(0);
        let x = Tensor::full(&[4, 2], 3.0, DType::F32);
        // Moving averages are still zero: mean = 0, var = 0.
        let out = bn.forward(&mut ctx, &x).unwrap();
        let expected = 3.0 / (EPS).sqrt();
        for &v in out.to_f32_array().iter() {
            assert!((v - expected).abs() / expected < 1e-4);
        }
    }
}
