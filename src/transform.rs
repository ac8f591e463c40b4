//! Turning a forward function into a pair of pure `init`/`apply` functions.
//!
//! Modules never own their parameters. During a forward pass they ask the
//! [`Context`] for them by `(module path, name)`: in [`Mode::Init`] missing
//! entries are created from an [`Initializer`], in [`Mode::Apply`] they must
//! already exist. State works the same way and can additionally be updated
//! with [`Context::set_state`].

use crate::nn::initializers::Initializer;
use crate::nn::module::{ModuleError, ModuleResult};
use crate::tensor::{DType, Tensor};
use crate::tree::{Params, State, Store, Tree};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::borrow::Cow;

/// Whether a forward pass creates or consumes parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Init,
    Apply,
}

/// Per-call frame handed to every module.
pub struct Context<'a> {
    mode: Mode,
    params: Cow<'a, Store>,
    state: Store,
    rng: StdRng,
}

impl<'a> Context<'a> {
    /// A context that creates parameters and state as they are requested.
    pub fn for_init(seed: u64) -> Self {
        Context {
            mode: Mode::Init,
            params: Cow::Owned(Store::new()),
            state: Store::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A context that reads `params` and threads a copy of `state`.
    pub fn for_apply(params: &'a Params, state: &State, seed: u64) -> Self {
        Context {
            mode: Mode::Apply,
            params: Cow::Borrowed(params),
            state: state.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Returns parameter `name` of `module`, creating it during init.
    ///
    /// A parameter requested twice during init (e.g. by a core unrolled over
    /// several steps) is created once and shared.
    pub fn get_parameter(
        &mut self,
        module: &str,
        name: &str,
        shape: &[usize],
        dtype: DType,
        init: &Initializer,
    ) -> ModuleResult<Tensor> {
        if let Some(existing) = self.params.get(module, name) {
            check_shape(module, name, shape, existing)?;
            return Ok(existing.clone());
        }
        match self.mode {
            Mode::Init => {
                let value = init.sample(shape, dtype, &mut self.rng)?;
                log::debug!(
                    "created parameter {}/{} {:?} {}",
                    module,
                    name,
                    shape,
                    dtype
                );
                self.params.to_mut().insert(module, name, value.clone());
                Ok(value)
            }
            Mode::Apply => Err(ModuleError::MissingParameter {
                module: module.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Returns state `name` of `module`, creating it from `init` during init.
    pub fn get_state(
        &mut self,
        module: &str,
        name: &str,
        shape: &[usize],
        dtype: DType,
        init: &Initializer,
    ) -> ModuleResult<Tensor> {
        if let Some(existing) = self.state.get(module, name) {
            check_shape(module, name, shape, existing)?;
            return Ok(existing.clone());
        }
        match self.mode {
            Mode::Init => {
                let value = init.sample(shape, dtype, &mut self.rng)?;
                self.state.insert(module, name, value.clone());
                Ok(value)
            }
            Mode::Apply => Err(ModuleError::MissingState {
                module: module.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Overwrites state `name` of `module`.
    pub fn set_state(&mut self, module: &str, name: &str, value: Tensor) {
        self.state.insert(module, name, value);
    }

    fn finish(self) -> (Params, State) {
        (self.params.into_owned(), self.state)
    }
}

fn check_shape(module: &str, name: &str, expected: &[usize], found: &Tensor) -> ModuleResult<()> {
    if found.shape() != expected {
        return Err(ModuleError::ParameterShape {
            module: module.to_string(),
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: found.shape().to_vec(),
        });
    }
    Ok(())
}

/// A forward function split into `init` and `apply`.
pub struct Transformed<F> {
    f: F,
}

/// Wraps `f` so it can be initialized and applied with explicit state.
pub fn transform_with_state<F>(f: F) -> Transformed<F>
where
    F: Fn(&mut Context<'_>, &Tensor) -> ModuleResult<Tree>,
{
    Transformed { f }
}

impl<F> Transformed<F>
where
    F: Fn(&mut Context<'_>, &Tensor) -> ModuleResult<Tree>,
{
    /// Runs `f` once on `x`, returning the created parameters and state.
    pub fn init(&self, seed: u64, x: &Tensor) -> ModuleResult<(Params, State)> {
        let mut ctx = Context::for_init(seed);
        (self.f)(&mut ctx, x)?;
        let (params, state) = ctx.finish();
        log::debug!(
            "init created {} parameters and {} state entries",
            params.len(),
            state.len()
        );
        Ok((params, state))
    }

    /// Runs `f` on `x` with fixed `params`, returning the output and the
    /// updated state.
    pub fn apply(
        &self,
        params: &Params,
        state: &State,
        seed: u64,
        x: &Tensor,
    ) -> ModuleResult<(Tree, State)> {
        let mut ctx = Context::for_apply(params, state, seed);
        let out = (self.f)(&mut ctx, x)?;
        let (_, state) = ctx.finish();
        Ok((out, state))
    }
}
