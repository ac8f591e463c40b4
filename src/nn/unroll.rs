//! Running a recurrent core over a time-major sequence.

use crate::nn::module::{ModuleError, ModuleResult, RnnCore};
use crate::tensor::Tensor;
use crate::transform::Context;
use crate::tree::Tree;
use std::fmt;

/// Signature shared by all unroll strategies:
/// `(ctx, core, inputs[T, B, ...], initial_state) -> (outputs[T, B, ...], final_state)`.
pub type UnrollFn =
    fn(&mut Context<'_>, &dyn RnnCore, &Tensor, &Tree) -> ModuleResult<(Tensor, Tree)>;

/// A named unroll strategy.
#[derive(Clone, Copy)]
pub struct Unroller {
    pub name: &'static str,
    pub unroll: UnrollFn,
}

impl Unroller {
    pub fn run(
        &self,
        ctx: &mut Context<'_>,
        core: &dyn RnnCore,
        inputs: &Tensor,
        initial_state: &Tree,
    ) -> ModuleResult<(Tensor, Tree)> {
        (self.unroll)(ctx, core, inputs, initial_state)
    }
}

impl fmt::Debug for Unroller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unroller").field("name", &self.name).finish()
    }
}

impl PartialEq for Unroller {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Unroller {}

pub const STATIC_UNROLL: Unroller = Unroller {
    name: "static_unroll",
    unroll: static_unroll,
};

pub const DYNAMIC_UNROLL: Unroller = Unroller {
    name: "dynamic_unroll",
    unroll: dynamic_unroll,
};

fn sequence_length(core: &dyn RnnCore, inputs: &Tensor) -> ModuleResult<usize> {
    match inputs.shape().first() {
        Some(&t) if t > 0 => Ok(t),
        _ => Err(ModuleError::invalid_input(
            core.name(),
            format!("expected a non-empty time-major sequence, got {:?}", inputs.shape()),
        )),
    }
}

/// Steps `core` once per time step with an explicit loop.
pub fn static_unroll(
    ctx: &mut Context<'_>,
    core: &dyn RnnCore,
    inputs: &Tensor,
    initial_state: &Tree,
) -> ModuleResult<(Tensor, Tree)> {
    let steps = sequence_length(core, inputs)?;
    let mut state = initial_state.clone();
    let mut outputs = Vec::with_capacity(steps);
    for t in 0..steps {
        let (out, next) = core.step(ctx, &inputs.index_axis(0, t)?, &state)?;
        outputs.push(out);
        state = next;
    }
    Ok((Tensor::stack(&outputs, 0)?, state))
}

/// Steps `core` over the sequence as a scan, threading the state through
/// a fold.
pub fn dynamic_unroll(
    ctx: &mut Context<'_>,
    core: &dyn RnnCore,
    inputs: &Tensor,
    initial_state: &Tree,
) -> ModuleResult<(Tensor, Tree)> {
    let steps = sequence_length(core, inputs)?;
    let (outputs, state) = (0..steps).try_fold(
        (Vec::with_capacity(steps), initial_state.clone()),
        |(mut outputs, state), t| -> ModuleResult<_> {
            let (out, next) = core.step(ctx, &inputs.index_axis(0, t)?, &state)?;
            outputs.push(out);
            Ok((outputs, next))
        },
    )?;
    Ok((Tensor::stack(&outputs, 0)?, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::recurrent::{Lstm, VanillaRnn};
    use crate::tensor::DType;
    use crate::tree::Leaves;

    #[test]
    fn test_unrollers_agree() {
        let core = VanillaRnn::new(4);
        let inputs = Tensor::random_uniform(&[3, 2, 5], 1);
        let state = core.initial_state(2).unwrap();

        let mut ctx = Context::for_init(0);
        let (a, a_state) = STATIC_UNROLL.run(&mut ctx, &core, &inputs, &state).unwrap();
        let (b, b_state) = DYNAMIC_UNROLL.run(&mut ctx, &core, &inputs, &state).unwrap();
        assert_eq!(a.shape(), &[3, 2, 4]);
        assert_eq!(a, b);
        assert_eq!(a_state, b_state);
    }

    #[test]
    fn test_unroll_shares_parameters_across_steps() {
        let core = Lstm::new(2);
        let inputs = Tensor::random_uniform(&[4, 1, 3], 2);
        let state = core.initial_state(1).unwrap();
        let mut ctx = Context::for_init(0);
        let (out, final_state) = static_unroll(&mut ctx, &core, &inputs, &state).unwrap();
        assert_eq!(out.shape(), &[4, 1, 2]);
        assert_eq!(final_state.leaves().len(), 2);
        assert_eq!(out.dtype(), DType::F32);
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        let core = VanillaRnn::new(1);
        let state = core.initial_state(1).unwrap();
        let mut ctx = Context::for_init(0);
        let inputs = Tensor::zeros(&[0, 1, 2], DType::F32);
        assert!(dynamic_unroll(&mut ctx, &core, &inputs, &state).is_err());
        assert_eq!(format!("{:?}", STATIC_UNROLL), "Unroller { name: \"static_unroll\" }");
    }
}
