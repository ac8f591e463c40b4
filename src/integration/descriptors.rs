//! Registry of module descriptors used by the integration tests.
//!
//! Every entry says how to build a module, what input it expects and (through
//! the [`Instance`] adapters) how to call it. Tests iterate [`ALL_MODULES`]
//! instead of naming modules one by one, so a new module only needs a
//! descriptor to be covered by every integration test.

use crate::nn::{
    BatchNorm, Bias, ConvND, ConvNDTranspose, Embed, Flatten, Gru, InstanceNorm, Layer, LayerNorm,
    Linear, Lstm, Mlp, Module, ModuleError, ModuleResult, ResetCore, RnnCore, Sequential,
    SpectralNorm, Unroller, VanillaRnn, DYNAMIC_UNROLL, STATIC_UNROLL,
};
use crate::tensor::{DType, Tensor};
use crate::transform::Context;
use crate::tree::{Leaves, Tree};
use once_cell::sync::Lazy;
use std::borrow::Cow;

/// Batch size of every registered input shape.
pub const BATCH_SIZE: usize = 8;

/// A built module, possibly wrapped in calling adapters.
pub enum Instance {
    Module(Box<dyn Module>),
    /// A recurrent core; only callable once wrapped in [`Recurrent`].
    Core(Box<dyn RnnCore>),
    Training(Training),
    Recurrent(Recurrent),
}

/// Calls the wrapped instance with `is_training = true`.
pub struct Training {
    wrapped: Box<Instance>,
}

/// Runs the wrapped core over a one-step sequence built from the input.
pub struct Recurrent {
    wrapped: Box<Instance>,
    unroller: Option<Unroller>,
}

/// The innermost, unwrapped value of an [`Instance`].
#[derive(Clone, Copy)]
pub enum Terminal<'a> {
    Module(&'a dyn Module),
    Core(&'a dyn RnnCore),
}

impl Terminal<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Terminal::Module(m) => m.kind(),
            Terminal::Core(c) => c.kind(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Terminal::Module(m) => m.name(),
            Terminal::Core(c) => c.name(),
        }
    }
}

impl Instance {
    pub fn module(module: impl Module + 'static) -> Self {
        Instance::Module(Box::new(module))
    }

    pub fn core(core: impl RnnCore + 'static) -> Self {
        Instance::Core(Box::new(core))
    }

    pub fn training(wrapped: Instance) -> Self {
        Instance::Training(Training {
            wrapped: Box::new(wrapped),
        })
    }

    pub fn recurrent(wrapped: Instance, unroller: Option<Unroller>) -> Self {
        Instance::Recurrent(Recurrent {
            wrapped: Box::new(wrapped),
            unroller,
        })
    }

    /// The directly wrapped instance, `None` for terminals.
    pub fn wrapped(&self) -> Option<&Instance> {
        match self {
            Instance::Module(_) | Instance::Core(_) => None,
            Instance::Training(t) => Some(&*t.wrapped),
            Instance::Recurrent(r) => Some(&*r.wrapped),
        }
    }

    /// Calls the instance on `x`.
    pub fn call(&self, ctx: &mut Context<'_>, x: &Tensor) -> ModuleResult<Tree> {
        self.call_with_mode(ctx, x, None)
    }

    fn call_with_mode(
        &self,
        ctx: &mut Context<'_>,
        x: &Tensor,
        is_training: Option<bool>,
    ) -> ModuleResult<Tree> {
        match self {
            Instance::Module(module) => {
                let out = match is_training {
                    Some(is_training) => module.forward_train(ctx, x, is_training)?,
                    None => module.forward(ctx, x)?,
                };
                Ok(Tree::Leaf(out))
            }
            Instance::Core(core) => Err(ModuleError::NotCallable(core.name().to_string())),
            Instance::Training(training) => training.wrapped.call_with_mode(ctx, x, Some(true)),
            Instance::Recurrent(recurrent) => recurrent.call(ctx, x),
        }
    }
}

impl Recurrent {
    /// Returns `(outputs[1, B, ...], final_state)`.
    ///
    /// The wrapped instance must be a core itself; a core behind further
    /// adapters is rejected.
    ///
    /// The core's initial state is requested once per call; its float leaves
    /// are cast to the dtype of `x`, integer leaves are kept as they are.
    fn call(&self, ctx: &mut Context<'_>, x: &Tensor) -> ModuleResult<Tree> {
        let core: &dyn RnnCore = match &*self.wrapped {
            Instance::Core(core) => &**core,
            other => return Err(ModuleError::NotRecurrent(unwrap(other).name().to_string())),
        };
        let batch_size = *x
            .shape()
            .first()
            .ok_or_else(|| ModuleError::invalid_input(core.name(), "input has no batch axis"))?;
        let initial_state = core.initial_state(batch_size)?.map_leaves(|leaf| {
            if leaf.dtype().is_float() && x.dtype().is_float() {
                leaf.cast(x.dtype())
            } else {
                leaf.clone()
            }
        });

        let (outputs, state) = match self.unroller {
            Some(unroller) => unroller.run(ctx, core, &x.expand_dims(0)?, &initial_state)?,
            None => {
                let (out, state) = core.step(ctx, x, &initial_state)?;
                (out.expand_dims(0)?, state)
            }
        };
        Ok(Tree::Seq(vec![Tree::Leaf(outputs), state]))
    }
}

/// Follows wrapped instances down to the terminal module or core.
pub fn unwrap(instance: &Instance) -> Terminal<'_> {
    let mut current = instance;
    loop {
        match current {
            Instance::Module(module) => return Terminal::Module(&**module),
            Instance::Core(core) => return Terminal::Core(&**core),
            Instance::Training(Training { wrapped })
            | Instance::Recurrent(Recurrent { wrapped, .. }) => current = &**wrapped,
        }
    }
}

/// Builds a fresh instance on every call.
#[derive(Debug, Clone)]
pub enum Factory {
    Module(fn() -> Instance),
    Recurrent(RecurrentFactory),
}

/// Builds the base instance and wraps it in [`Recurrent`].
#[derive(Debug, Clone)]
pub struct RecurrentFactory {
    base: Box<Factory>,
    unroller: Option<Unroller>,
}

impl Factory {
    pub fn create(&self) -> Instance {
        match self {
            Factory::Module(create) => create(),
            Factory::Recurrent(RecurrentFactory { base, unroller }) => {
                Instance::recurrent(base.create(), *unroller)
            }
        }
    }
}

/// How to build a module and what input to feed it.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: Cow<'static, str>,
    pub create: Factory,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ModuleDescriptor {
    pub fn new(name: &'static str, create: fn() -> Instance, shape: &[usize]) -> Self {
        Self {
            name: Cow::Borrowed(name),
            create: Factory::Module(create),
            shape: shape.to_vec(),
            dtype: DType::F32,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// `kind()` of the module this descriptor builds, once unwrapped.
    pub fn terminal_kind(&self) -> &'static str {
        unwrap(&self.create.create()).kind()
    }
}

/// Returns the input unchanged.
fn identity(x: &Tensor) -> crate::tensor::TensorResult<Tensor> {
    Ok(x.clone())
}

/// Convolution, batch norm and relu; a composite whose behavior depends on
/// the training flag.
fn conv_block() -> Sequential {
    Sequential::new(vec![
        Layer::module(ConvND::conv2d(4, 3).with_name("conv_block/~/conv2_d")),
        Layer::module(BatchNorm::new(true, true).with_name("conv_block/~/batch_norm")),
        Layer::Fn(Tensor::relu),
    ])
    .with_name("conv_block")
}

pub static BATCH_MODULES: Lazy<Vec<ModuleDescriptor>> = Lazy::new(|| {
    let b = BATCH_SIZE;
    vec![
        ModuleDescriptor::new(
            "BatchNorm",
            || Instance::training(Instance::module(BatchNorm::new(true, true))),
            &[b, 2, 2, 3],
        ),
        ModuleDescriptor::new("Bias", || Instance::module(Bias::new()), &[b, 3, 3, 3]),
        ModuleDescriptor::new("Conv1D", || Instance::module(ConvND::conv1d(3, 3)), &[b, 2, 2]),
        ModuleDescriptor::new(
            "Conv1DTranspose",
            || Instance::module(ConvNDTranspose::conv1d(3, 3)),
            &[b, 2, 2],
        ),
        ModuleDescriptor::new("Conv2D", || Instance::module(ConvND::conv2d(3, 3)), &[b, 2, 2, 2]),
        ModuleDescriptor::new(
            "Conv2DTranspose",
            || Instance::module(ConvNDTranspose::conv2d(3, 3)),
            &[b, 2, 2, 2],
        ),
        ModuleDescriptor::new(
            "Conv3D",
            || Instance::module(ConvND::conv3d(3, 3)),
            &[b, 2, 2, 2, 2],
        ),
        ModuleDescriptor::new(
            "Conv3DTranspose",
            || Instance::module(ConvNDTranspose::conv3d(3, 3)),
            &[b, 2, 2, 2, 2],
        ),
        ModuleDescriptor::new("Embed", || Instance::module(Embed::new(6, 12)), &[b])
            .with_dtype(DType::I32),
        ModuleDescriptor::new("Flatten", || Instance::module(Flatten::new()), &[b, 3, 3, 3]),
        ModuleDescriptor::new(
            "InstanceNorm",
            || Instance::module(InstanceNorm::new(true, true)),
            &[b, 3, 2],
        ),
        ModuleDescriptor::new(
            "LayerNorm",
            || Instance::module(LayerNorm::new(vec![1], true, true)),
            &[b, 3, 2],
        ),
        ModuleDescriptor::new("SpectralNorm", || Instance::module(SpectralNorm::new()), &[b, 3, 2]),
        ModuleDescriptor::new("Linear", || Instance::module(Linear::new(10)), &[b, 1]),
        ModuleDescriptor::new(
            "Sequential",
            || Instance::module(Sequential::new(vec![Layer::Fn(identity)])),
            &[b, 2, 2],
        ),
        ModuleDescriptor::new("nets.MLP", || Instance::module(Mlp::new(&[3, 4, 5])), &[b, 3]),
        ModuleDescriptor::new(
            "Sequential(Conv2D, BatchNorm)",
            || Instance::training(Instance::module(conv_block())),
            &[b, 3, 3, 2],
        ),
    ]
});

/// Returns its input unchanged and keeps its state; the initial state is
/// ones of shape `[batch, 128, 1]`.
#[derive(Debug, Clone, Default)]
pub struct IdentityCore;

impl RnnCore for IdentityCore {
    fn name(&self) -> &str {
        "identity_core"
    }

    fn kind(&self) -> &'static str {
        "IdentityCore"
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        Ok(Tree::Leaf(Tensor::ones(&[batch_size, 128, 1], DType::F32)))
    }

    fn step(&self, _ctx: &mut Context<'_>, inputs: &Tensor, state: &Tree) -> ModuleResult<(Tensor, Tree)> {
        Ok((inputs.clone(), state.clone()))
    }
}

/// Drives a [`ResetCore`] as a plain core, resetting every sequence at every
/// step.
pub struct ResetCoreAdapter {
    wrapped: ResetCore,
}

impl ResetCoreAdapter {
    pub fn new(wrapped: ResetCore) -> Self {
        Self { wrapped }
    }
}

impl RnnCore for ResetCoreAdapter {
    fn name(&self) -> &str {
        self.wrapped.name()
    }

    fn kind(&self) -> &'static str {
        self.wrapped.kind()
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        self.wrapped.initial_state(batch_size)
    }

    fn step(&self, ctx: &mut Context<'_>, inputs: &Tensor, state: &Tree) -> ModuleResult<(Tensor, Tree)> {
        let batch_size = *inputs
            .shape()
            .first()
            .ok_or_else(|| ModuleError::invalid_input(self.name(), "input has no batch axis"))?;
        let resets = ResetCore::uniform_resets(batch_size, true);
        self.wrapped.step_with_reset(ctx, inputs, &resets, state)
    }
}

pub static RNN_CORES: Lazy<Vec<ModuleDescriptor>> = Lazy::new(|| {
    let shape = [BATCH_SIZE, 128];
    vec![
        ModuleDescriptor::new(
            "ResetCore",
            || {
                Instance::core(ResetCoreAdapter::new(ResetCore::new(Box::new(
                    IdentityCore,
                ))))
            },
            &shape,
        ),
        ModuleDescriptor::new("GRU", || Instance::core(Gru::new(1)), &shape),
        ModuleDescriptor::new("LSTM", || Instance::core(Lstm::new(1)), &shape),
        ModuleDescriptor::new("VanillaRNN", || Instance::core(VanillaRnn::new(8)), &shape),
    ]
});

/// Wraps every descriptor in [`Recurrent`] with `unroller`.
///
/// Names become `Recurrent(<name>)`, or `Recurrent(<name>, <unroller>)` when
/// an unroller is given; shape and dtype are unchanged.
pub fn unroll_descriptors(
    descriptors: &[ModuleDescriptor],
    unroller: Option<Unroller>,
) -> Vec<ModuleDescriptor> {
    descriptors
        .iter()
        .map(|descriptor| {
            let name = match unroller {
                None => format!("Recurrent({})", descriptor.name),
                Some(u) => format!("Recurrent({}, {})", descriptor.name, u.name),
            };
            ModuleDescriptor {
                name: Cow::Owned(name),
                create: Factory::Recurrent(RecurrentFactory {
                    base: Box::new(descriptor.create.clone()),
                    unroller,
                }),
                shape: descriptor.shape.clone(),
                dtype: descriptor.dtype,
            }
        })
        .collect()
}

pub static RECURRENT_MODULES: Lazy<Vec<ModuleDescriptor>> = Lazy::new(|| {
    let mut out = unroll_descriptors(&RNN_CORES, None);
    out.extend(unroll_descriptors(&RNN_CORES, Some(DYNAMIC_UNROLL)));
    out.extend(unroll_descriptors(&RNN_CORES, Some(STATIC_UNROLL)));
    out
});

pub static ALL_MODULES: Lazy<Vec<ModuleDescriptor>> = Lazy::new(|| {
    BATCH_MODULES
        .iter()
        .chain(RECURRENT_MODULES.iter())
        .cloned()
        .collect()
});

/// Module kinds deliberately left out of the registry.
pub const IGNORED_MODULES: &[&str] = &[
    "BatchApply",
    "Module",
    "Reshape",
    "AvgPool",
    "MaxPool",
    "GraphNetwork",
    "EMAParamsTree",
    "SNParamsTree",
    "ExponentialMovingAverage",
    "DeepRNN",
    "RNNCore",
];

/// Looks a descriptor up by its exact name.
pub fn find(name: &str) -> Option<&'static ModuleDescriptor> {
    ALL_MODULES.iter().find(|d| d.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform_with_state;
    use std::collections::HashSet;

    #[test]
    fn test_registry_sizes() {
        assert_eq!(BATCH_MODULES.len(), 17);
        assert_eq!(RNN_CORES.len(), 4);
        assert_eq!(RECURRENT_MODULES.len(), 12);
        assert_eq!(ALL_MODULES.len(), 29);
    }

    #[test]
    fn test_unrolled_names() {
        let names: Vec<&str> = RECURRENT_MODULES.iter().map(|d| d.name.as_ref()).collect();
        assert_eq!(names[0], "Recurrent(ResetCore)");
        assert!(names.contains(&"Recurrent(GRU, dynamic_unroll)"));
        assert!(names.contains(&"Recurrent(VanillaRNN, static_unroll)"));
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_unwrap_reaches_terminal() {
        let nested = Instance::training(Instance::training(Instance::recurrent(
            Instance::core(Lstm::new(1)),
            None,
        )));
        assert!(matches!(unwrap(&nested), Terminal::Core(c) if c.kind() == "LSTM"));
        assert!(nested.wrapped().is_some());

        let plain = Instance::module(Linear::new(1));
        assert_eq!(unwrap(&plain).kind(), "Linear");
        assert!(plain.wrapped().is_none());
    }

    #[test]
    fn test_bare_core_is_not_callable() {
        let instance = Instance::core(Gru::new(1));
        let mut ctx = Context::for_init(0);
        let err = instance.call(&mut ctx, &Tensor::ones(&[2, 3], DType::F32)).unwrap_err();
        assert!(matches!(err, ModuleError::NotCallable(_)));
    }

    #[test]
    fn test_recurrent_over_module_is_rejected() {
        let instance = Instance::recurrent(Instance::module(Linear::new(1)), Some(STATIC_UNROLL));
        let mut ctx = Context::for_init(0);
        let err = instance.call(&mut ctx, &Tensor::ones(&[2, 3], DType::F32)).unwrap_err();
        assert!(matches!(err, ModuleError::NotRecurrent(_)));
    }

    #[test]
    fn test_recurrent_over_wrapped_core_is_rejected() {
        let instance = Instance::recurrent(
            Instance::training(Instance::core(VanillaRnn::new(2))),
            Some(DYNAMIC_UNROLL),
        );
        assert!(matches!(unwrap(&instance), Terminal::Core(_)));
        let mut ctx = Context::for_init(0);
        let err = instance.call(&mut ctx, &Tensor::ones(&[2, 3], DType::F32)).unwrap_err();
        assert_eq!(err, ModuleError::NotRecurrent("vanilla_rnn".to_string()));
    }

    #[test]
    fn test_recurrent_output_has_time_axis() {
        for unroller in [None, Some(DYNAMIC_UNROLL), Some(STATIC_UNROLL)] {
            let instance = Instance::recurrent(Instance::core(VanillaRnn::new(8)), unroller);
            let f = transform_with_state(|ctx, x| instance.call(ctx, x));
            let x = Tensor::random_uniform(&[BATCH_SIZE, 128], 0);
            let (params, state) = f.init(0, &x).unwrap();
            let (out, _) = f.apply(&params, &state, 0, &x).unwrap();
            let outputs = out.get(0).and_then(Tree::as_tensor).unwrap();
            assert_eq!(outputs.shape(), &[1, BATCH_SIZE, 8], "{:?}", unroller);
            let final_state = out.get(1).and_then(Tree::as_tensor).unwrap();
            assert_eq!(final_state.shape(), &[BATCH_SIZE, 8]);
        }
    }

    #[test]
    fn test_reset_core_adapter_keeps_identity() {
        let instance = find("Recurrent(ResetCore, static_unroll)").unwrap().create.create();
        assert_eq!(unwrap(&instance).kind(), "ResetCore");
        let mut ctx = Context::for_init(0);
        let x = Tensor::random_uniform(&[BATCH_SIZE, 128], 1).cast(DType::BF16);
        let out = instance.call(&mut ctx, &x).unwrap();
        let dtypes: Vec<DType> = out.leaves().iter().map(|t| t.dtype()).collect();
        assert_eq!(dtypes, vec![DType::BF16, DType::BF16]);
        assert_eq!(out.leaves()[1].shape(), &[BATCH_SIZE, 128, 1]);
    }

    #[test]
    fn test_terminal_kinds() {
        for d in BATCH_MODULES.iter() {
            let kind = d.terminal_kind();
            assert!(
                d.name == kind || d.name.starts_with(&format!("{}(", kind)),
                "{} builds a {}",
                d.name,
                kind
            );
        }
    }
}
