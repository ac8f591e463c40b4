//! Parameter initializers.

use crate::tensor::{DType, Tensor, TensorError, TensorResult};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use rand::Rng;

/// Stddev of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_STDDEV: f32 = 0.879_625_661_034_239_8;

/// Which fan a [`Initializer::VarianceScaling`] divides by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    FanIn,
    FanOut,
    FanAvg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Constant(f32),
    RandomUniform { minval: f32, maxval: f32 },
    RandomNormal { stddev: f32, mean: f32 },
    /// Normal samples outside two standard deviations are redrawn.
    TruncatedNormal { stddev: f32, mean: f32 },
    /// Truncated normal with `stddev = sqrt(scale / fan)`.
    VarianceScaling { scale: f32, mode: FanMode },
}

impl Initializer {
    pub fn zeros() -> Self {
        Initializer::Constant(0.0)
    }

    pub fn ones() -> Self {
        Initializer::Constant(1.0)
    }

    /// Default for dense weights: truncated normal scaled by `1/sqrt(fan_in)`.
    pub fn lecun_truncated(fan_in: usize) -> Self {
        Initializer::TruncatedNormal {
            stddev: 1.0 / (fan_in.max(1) as f32).sqrt(),
            mean: 0.0,
        }
    }

    /// Draws a tensor of `shape` and `dtype`.
    ///
    /// Random initializers only produce floating-point tensors; values are
    /// drawn in `f32` and rounded to `dtype`.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        dtype: DType,
        rng: &mut R,
    ) -> TensorResult<Tensor> {
        let require_float = || {
            if dtype.is_float() {
                Ok(())
            } else {
                Err(TensorError::NotFloat {
                    op: "random initializer",
                    dtype,
                })
            }
        };
        match *self {
            Initializer::Constant(value) => Ok(Tensor::full(shape, value, dtype)),
            Initializer::RandomUniform { minval, maxval } => {
                require_float()?;
                Ok(Tensor::random_uniform_using(shape, minval, maxval, rng).cast(dtype))
            }
            Initializer::RandomNormal { stddev, mean } => {
                require_float()?;
                let data = Tensor::random_normal_using(shape, rng).to_f32_array();
                Ok(Tensor::from_f32_array(data.mapv(|z| z * stddev + mean), dtype))
            }
            Initializer::TruncatedNormal { stddev, mean } => {
                require_float()?;
                let data = truncated_normal(shape, rng).mapv(|z| z * stddev + mean);
                Ok(Tensor::from_f32_array(data, dtype))
            }
            Initializer::VarianceScaling { scale, mode } => {
                require_float()?;
                let (fan_in, fan_out) = compute_fans(shape);
                let fan = match mode {
                    FanMode::FanIn => fan_in,
                    FanMode::FanOut => fan_out,
                    FanMode::FanAvg => (fan_in + fan_out) / 2.0,
                };
                let stddev = (scale / fan.max(1.0)).sqrt() / TRUNCATED_STDDEV;
                let data = truncated_normal(shape, rng).mapv(|z| z * stddev);
                Ok(Tensor::from_f32_array(data, dtype))
            }
        }
    }
}

fn truncated_normal<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |_| loop {
        let z: f32 = rng.sample(StandardNormal);
        if z.abs() <= 2.0 {
            break z;
        }
    })
}

/// `(fan_in, fan_out)` of a weight of `shape`; leading axes of rank > 2
/// shapes form the receptive field.
pub fn compute_fans(shape: &[usize]) -> (f32, f32) {
    match shape {
        [] => (1.0, 1.0),
        [n] => (*n as f32, *n as f32),
        [fan_in, fan_out] => (*fan_in as f32, *fan_out as f32),
        [receptive @ .., fan_in, fan_out] => {
            let field: usize = receptive.iter().product();
            ((fan_in * field) as f32, (fan_out * field) as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_constant_keeps_dtype() {
        let mut rng = StdRng::seed_from_u64(0);
        let t = Initializer::zeros().sample(&[2, 3], DType::I32, &mut rng).unwrap();
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.shape(), &[2, 3]);
    }

    #[test]
    fn test_truncated_normal_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let init = Initializer::TruncatedNormal { stddev: 0.5, mean: 1.0 };
        let t = init.sample(&[1000], DType::F32, &mut rng).unwrap();
        assert!(t.to_f32_array().iter().all(|&v| (0.0..=2.0).contains(&v)));
    }

    #[test]
    fn test_random_init_rejects_integers() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = Initializer::RandomNormal { stddev: 1.0, mean: 0.0 };
        assert!(init.sample(&[2], DType::I32, &mut rng).is_err());
    }

    #[test]
    fn test_sample_in_reduced_precision() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = Initializer::VarianceScaling {
            scale: 1.0,
            mode: FanMode::FanIn,
        };
        let t = init.sample(&[3, 2, 4], DType::BF16, &mut rng).unwrap();
        assert_eq!(t.dtype(), DType::BF16);
    }

    #[test]
    fn test_compute_fans() {
        assert_eq!(compute_fans(&[]), (1.0, 1.0));
        assert_eq!(compute_fans(&[5]), (5.0, 5.0));
        assert_eq!(compute_fans(&[3, 4]), (3.0, 4.0));
        assert_eq!(compute_fans(&[3, 3, 2, 8]), (18.0, 72.0));
    }
}
