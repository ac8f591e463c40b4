//! Small ready-made networks.

use crate::nn::linear::Linear;
use crate::nn::module::{Module, ModuleResult};
use crate::tensor::{Tensor, TensorResult};
use crate::transform::Context;

/// A multi-layer perceptron: `Linear` layers with an activation between them.
///
/// Layer `i` stores its parameters under `{name}/~/linear_{i}`.
pub struct Mlp {
    layers: Vec<Linear>,
    activation: fn(&Tensor) -> TensorResult<Tensor>,
    activate_final: bool,
    name: String,
}

impl Mlp {
    /// An MLP with the given layer widths and ReLU activations.
    pub fn new(output_sizes: &[usize]) -> Self {
        Self::named("mlp", output_sizes)
    }

    pub fn named(name: &str, output_sizes: &[usize]) -> Self {
        let layers = output_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Linear::new(size).with_name(format!("{}/~/linear_{}", name, i)))
            .collect();
        Self {
            layers,
            activation: Tensor::relu,
            activate_final: false,
            name: name.to_string(),
        }
    }

    pub fn with_activation(mut self, activation: fn(&Tensor) -> TensorResult<Tensor>) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_activate_final(mut self, activate_final: bool) -> Self {
        self.activate_final = activate_final;
        self
    }

    pub fn output_size(&self) -> Option<usize> {
        self.layers.last().map(|l| l.output_size)
    }
}

impl Module for Mlp {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "nets.MLP"
    }

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
        let last = self.layers.len().saturating_sub(1);
        let mut out = inputs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            out = layer.forward(ctx, &out)?;
            if i < last || self.activate_final {
                out = (self.activation)(&out)?;
            }
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
    fn test_mlp_layer_names_and_shapes() {
        let mlp = Mlp::new(&[3, 4, 5]);
        assert_eq!(mlp.output_size(), Some(5));
        let f = transform_with_state(|ctx, x| Ok(Tree::Leaf(mlp.forward(ctx, x)?)));
        let x = Tensor::random_uniform(&[8, 3], 0);
        let (params, _) = f.init(0, &x).unwrap();
        let names: Vec<&str> = params.module_names().collect();
        assert_eq!(names, vec!["mlp/~/linear_0", "mlp/~/linear_1", "mlp/~/linear_2"]);
        assert_eq!(params.get("mlp/~/linear_1", "w").unwrap().shape(), &[3, 4]);

        let (out, _) = f.apply(&params, &Default::default(), 0, &x).unwrap();
        assert_eq!(out.leaves()[0].shape(), &[8, 5]);
    }

    #[test]
    fn test_activate_final() {
        let mlp = Mlp::new(&[2])
            .with_activation(Tensor::relu)
            .with_activate_final(true);
        let mut ctx = Context::for_init(0);
        let out = mlp
            .forward(&mut ctx, &Tensor::full(&[4, 3], -1.0, DType::F32))
            .unwrap();
        assert!(out.to_f32_array().iter().all(|&v| v >= 0.0));
    }
}
