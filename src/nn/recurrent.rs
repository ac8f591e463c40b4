//! Recurrent cores.
//!
//! A core maps `(inputs[batch, ...], state)` to `(outputs, next_state)` for a
//! single time step; [`crate::nn::unroll`] runs it over a sequence.

use crate::nn::initializers::{FanMode, Initializer};
use crate::nn::linear::Linear;
use crate::nn::module::{leaf, require_float, require_rank, Module, ModuleError, ModuleResult, RnnCore};
use crate::tensor::{DType, Tensor};
use crate::transform::Context;
use crate::tree::{Leaves, Tree};
use ndarray::{ArrayD, IxDyn};

/// Elman network: `h = relu(in2h(x) + h2h(h_prev))`.
#[derive(Debug, Clone)]
pub struct VanillaRnn {
    pub hidden_size: usize,
    input_to_hidden: Linear,
    hidden_to_hidden: Linear,
    name: String,
}

impl VanillaRnn {
    pub fn new(hidden_size: usize) -> Self {
        Self::named("vanilla_rnn", hidden_size)
    }

    pub fn named(name: &str, hidden_size: usize) -> Self {
        Self {
            hidden_size,
            input_to_hidden: Linear::new(hidden_size).with_name(format!("{}/~/input_to_hidden", name)),
            hidden_to_hidden: Linear::new(hidden_size).with_name(format!("{}/~/hidden_to_hidden", name)),
            name: name.to_string(),
        }
    }
}

impl RnnCore for VanillaRnn {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "VanillaRNN"
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        Ok(Tree::Leaf(Tensor::zeros(&[batch_size, self.hidden_size], DType::F32)))
    }

    fn step(&self, ctx: &mut Context<'_>, inputs: &Tensor, state: &Tree) -> ModuleResult<(Tensor, Tree)> {
        let prev = leaf(&self.name, state)?;
        let out = self
            .input_to_hidden
            .forward(ctx, inputs)?
            .add(&self.hidden_to_hidden.forward(ctx, prev)?)?
            .relu()?;
        Ok((out.clone(), Tree::Leaf(out)))
    }
}

/// Long short-term memory core.
///
/// State is a map with `hidden` and `cell` entries, both `[batch, hidden]`.
/// The forget gate is biased by `+1` at every step.
#[derive(Debug, Clone)]
pub struct Lstm {
    pub hidden_size: usize,
    gates: Linear,
    name: String,
}

impl Lstm {
    pub fn new(hidden_size: usize) -> Self {
        Self::named("lstm", hidden_size)
    }

    pub fn named(name: &str, hidden_size: usize) -> Self {
        Self {
            hidden_size,
            gates: Linear::new(4 * hidden_size).with_name(format!("{}/~/linear", name)),
            name: name.to_string(),
        }
    }
}

impl RnnCore for Lstm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "LSTM"
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        let zeros = || Tree::Leaf(Tensor::zeros(&[batch_size, self.hidden_size], DType::F32));
        Ok(Tree::map([("hidden", zeros()), ("cell", zeros())]))
    }

    fn step(&self, ctx: &mut Context<'_>, inputs: &Tensor, state: &Tree) -> ModuleResult<(Tensor, Tree)> {
        require_rank(&self.name, inputs, 2)?;
        let hidden = state_field(&self.name, state, "hidden")?;
        let cell = state_field(&self.name, state, "cell")?;

        let x_and_h = Tensor::concat(&[inputs.clone(), hidden.clone()], 1)?;
        let gated = self.gates.forward(ctx, &x_and_h)?;
        let h = self.hidden_size;
        let gate = |i: usize| gated.slice_axis(1, i * h, (i + 1) * h);
        let (i, g, f, o) = (gate(0)?, gate(1)?, gate(2)?, gate(3)?);

        let f = f.add_scalar(1.0)?.sigmoid()?;
        let c = f.mul(cell)?.add(&i.sigmoid()?.mul(&g.tanh()?)?)?;
        let h = o.sigmoid()?.mul(&c.tanh()?)?;
        let next = Tree::map([("hidden", Tree::Leaf(h.clone())), ("cell", Tree::Leaf(c))]);
        Ok((h, next))
    }
}

fn state_field<'t>(module: &str, state: &'t Tree, key: &str) -> ModuleResult<&'t Tensor> {
    state
        .field(key)
        .and_then(Tree::as_tensor)
        .ok_or_else(|| ModuleError::invalid_input(module, format!("state has no `{}`", key)))
}

/// Gated recurrent unit.
///
/// Parameters: `w_i [in, 3h]`, `w_h [h, 3h]` and `b [3h]`, split as
/// `(update, reset | candidate)`.
#[derive(Debug, Clone)]
pub struct Gru {
    pub hidden_size: usize,
    pub w_i_init: Initializer,
    pub w_h_init: Initializer,
    pub b_init: Initializer,
    name: String,
}

impl Gru {
    pub fn new(hidden_size: usize) -> Self {
        let scaling = Initializer::VarianceScaling {
            scale: 1.0,
            mode: FanMode::FanIn,
        };
        Self {
            hidden_size,
            w_i_init: scaling,
            w_h_init: scaling,
            b_init: Initializer::zeros(),
            name: "gru".to_string(),
        }
    }
}

impl RnnCore for Gru {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "GRU"
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        Ok(Tree::Leaf(Tensor::zeros(&[batch_size, self.hidden_size], DType::F32)))
    }

    fn step(&self, ctx: &mut Context<'_>, inputs: &Tensor, state: &Tree) -> ModuleResult<(Tensor, Tree)> {
        require_rank(&self.name, inputs, 2)?;
        let dtype = require_float(&self.name, inputs)?;
        let prev = leaf(&self.name, state)?;
        let h = self.hidden_size;
        let input_size = inputs.shape()[1];

        let w_i = ctx.get_parameter(&self.name, "w_i", &[input_size, 3 * h], dtype, &self.w_i_init)?;
        let w_h = ctx.get_parameter(&self.name, "w_h", &[h, 3 * h], dtype, &self.w_h_init)?;
        let b = ctx.get_parameter(&self.name, "b", &[3 * h], dtype, &self.b_init)?;
        let (w_h_zr, w_h_a) = (w_h.slice_axis(1, 0, 2 * h)?, w_h.slice_axis(1, 2 * h, 3 * h)?);
        let (b_zr, b_a) = (b.slice_axis(0, 0, 2 * h)?, b.slice_axis(0, 2 * h, 3 * h)?);

        let gates_x = inputs.matmul(&w_i)?;
        let (zr_x, a_x) = (gates_x.slice_axis(1, 0, 2 * h)?, gates_x.slice_axis(1, 2 * h, 3 * h)?);
        let zr = zr_x.add(&prev.matmul(&w_h_zr)?)?.add(&b_zr)?.sigmoid()?;
        let (z, r) = (zr.slice_axis(1, 0, h)?, zr.slice_axis(1, h, 2 * h)?);
        let a_h = r.mul(prev)?.matmul(&w_h_a)?;
        let a = a_x.add(&a_h)?.add(&b_a)?.tanh()?;

        let next = z.rsub_scalar(1.0)?.mul(prev)?.add(&z.mul(&a)?)?;
        Ok((next.clone(), Tree::Leaf(next)))
    }
}

/// Resets the state of the wrapped core to its initial state wherever
/// `should_reset` is set, before stepping.
pub struct ResetCore {
    core: Box<dyn RnnCore>,
    name: String,
}

impl ResetCore {
    pub fn new(core: Box<dyn RnnCore>) -> Self {
        Self {
            core,
            name: "reset_core".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        "ResetCore"
    }

    pub fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        self.core.initial_state(batch_size)
    }

    /// Steps the wrapped core; `should_reset` is a `[batch]` bool tensor.
    ///
    /// The replacement state is cast to the dtype of each current state
    /// leaf, so resetting never changes the precision of the state.
    pub fn step_with_reset(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        should_reset: &Tensor,
        state: &Tree,
    ) -> ModuleResult<(Tensor, Tree)> {
        if should_reset.dtype() != DType::Bool || should_reset.ndim() != 1 {
            return Err(ModuleError::invalid_input(
                &self.name,
                format!(
                    "should_reset must be a [batch] bool tensor, got {} {:?}",
                    should_reset.dtype(),
                    should_reset.shape()
                ),
            ));
        }
        let batch_size = should_reset.shape()[0];
        let initial = self.core.initial_state(batch_size)?;
        let state = initial
            .try_zip_map(state, |init, current| {
                let mut mask_shape = vec![1; current.ndim()];
                if let Some(first) = mask_shape.first_mut() {
                    *first = batch_size;
                }
                let mask = should_reset.reshape(&mask_shape)?;
                Tensor::select(&mask, &init.cast(current.dtype()), current)
            })?
            .ok_or_else(|| {
                ModuleError::invalid_input(&self.name, "state does not match the core's initial state")
            })?;
        self.core.step(ctx, inputs, &state)
    }

    /// A `[batch]` mask with every entry set to `reset`.
    pub fn uniform_resets(batch_size: usize, reset: bool) -> Tensor {
        Tensor::from_bool_array(ArrayD::from_elem(IxDyn(&[batch_size]), reset))
    }
}

/// Returns the dtypes of every leaf of `state`, in leaf order.
pub fn state_dtypes(state: &Tree) -> Vec<DType> {
    state.leaves().iter().map(|t| t.dtype()).collect()
}
