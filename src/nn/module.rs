//! Module defining the core `Module` and `RnnCore` traits for all layers.

use crate::tensor::{DType, Tensor, TensorError};
use crate::transform::Context;
use crate::tree::Tree;
use thiserror::Error;

/// Errors raised while building or running a module.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("parameter {module}/{name} does not exist; was the module initialized?")]
    MissingParameter { module: String, name: String },

    #[error("state {module}/{name} does not exist; was the module initialized?")]
    MissingState { module: String, name: String },

    #[error("{module}/{name} has shape {actual:?}, expected {expected:?}")]
    ParameterShape {
        module: String,
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{0} is not a recurrent core")]
    NotRecurrent(String),

    #[error("{0} is a recurrent core and must be wrapped before it can be called")]
    NotCallable(String),

    #[error("{module}: {reason}")]
    InvalidInput { module: String, reason: String },
}

pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

impl ModuleError {
    pub(crate) fn invalid_input(module: &str, reason: impl Into<String>) -> Self {
        ModuleError::InvalidInput {
            module: module.to_string(),
            reason: reason.into(),
        }
    }
}

/// Common interface of all layers.
///
/// A module holds only its configuration. Parameters and state are
/// requested from the [`Context`] under the module's `name()`, so the same
/// module can be initialized and applied any number of times.
pub trait Module {
    /// Path under which parameters and state are stored.
    fn name(&self) -> &str;

    /// Stable identifier of the module type, e.g. `"Linear"` or `"nets.MLP"`.
    fn kind(&self) -> &'static str;

    fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor>;

    /// Forward pass for modules whose behavior depends on the training flag.
    ///
    /// Modules that don't care forward to [`Module::forward`].
    fn forward_train(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        is_training: bool,
    ) -> ModuleResult<Tensor> {
        let _ = is_training;
        self.forward(ctx, inputs)
    }
}

/// A module that is applied one time step at a time.
pub trait RnnCore {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// State for a batch of `batch_size` sequences.
    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree>;

    /// Advances the core by one step, returning `(output, next_state)`.
    fn step(
        &self,
        ctx: &mut Context<'_>,
        inputs: &Tensor,
        state: &Tree,
    ) -> ModuleResult<(Tensor, Tree)>;
}

/// Fails unless `inputs` has a floating-point dtype.
pub(crate) fn require_float(module: &str, inputs: &Tensor) -> ModuleResult<DType> {
    let dtype = inputs.dtype();
    if !dtype.is_float() {
        return Err(ModuleError::invalid_input(
            module,
            format!("expected floating-point input, got {}", dtype),
        ));
    }
    Ok(dtype)
}

/// Fails unless `inputs` has exactly `rank` dimensions.
pub(crate) fn require_rank(module: &str, inputs: &Tensor, rank: usize) -> ModuleResult<()> {
    if inputs.ndim() != rank {
        return Err(ModuleError::invalid_input(
            module,
            format!("expected rank {} input, got shape {:?}", rank, inputs.shape()),
        ));
    }
    Ok(())
}

/// Returns a `Tree` leaf, or an error naming `module`.
pub(crate) fn leaf<'t>(module: &str, tree: &'t Tree) -> ModuleResult<&'t Tensor> {
    tree.as_tensor()
        .ok_or_else(|| ModuleError::invalid_input(module, "expected a single tensor as state"))
}
