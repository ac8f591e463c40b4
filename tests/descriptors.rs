//! Properties of the module registry and its calling adapters.

use rustymod::integration::{
    find, sample_input, unroll_descriptors, unwrap, DTypeChecker, Instance, ModuleDescriptor,
    Outcome, Terminal, ALL_MODULES, BATCH_MODULES, BATCH_SIZE, IGNORED_MODULES,
    RECURRENT_MODULES, RNN_CORES,
};
use rustymod::config::ConformanceConfig;
use rustymod::nn::{ModuleResult, RnnCore, MODULE_KINDS, STATIC_UNROLL};
use rustymod::runtime::platform::Device;
use rustymod::tensor::{DType, Tensor};
use rustymod::transform::{transform_with_state, Context};
use rustymod::tree::{Leaves, Tree};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_unwrap_terminates_for_every_descriptor() {
    for descriptor in ALL_MODULES.iter() {
        let instance = descriptor.create.create();
        let terminal = unwrap(&instance);
        assert!(!terminal.kind().is_empty(), "{}", descriptor.name);
    }
}

#[test]
fn test_recurrent_descriptors_unwrap_to_cores() {
    for descriptor in RECURRENT_MODULES.iter() {
        let instance = descriptor.create.create();
        assert!(
            matches!(unwrap(&instance), Terminal::Core(_)),
            "{} should wrap a core",
            descriptor.name
        );
    }
}

#[test]
fn test_descriptor_names_are_distinct() {
    let names: HashSet<&str> = ALL_MODULES.iter().map(|d| d.name.as_ref()).collect();
    assert_eq!(names.len(), ALL_MODULES.len());
}

#[test]
fn test_every_shape_is_batched() {
    for descriptor in ALL_MODULES.iter() {
        assert_eq!(descriptor.shape.first(), Some(&BATCH_SIZE), "{}", descriptor.name);
    }
    for descriptor in RNN_CORES.iter() {
        assert_eq!(descriptor.shape, vec![BATCH_SIZE, 128]);
    }
}

/// Builds a fresh instance, then runs `init` and one `apply` with seed 42.
fn run_fresh(descriptor: &ModuleDescriptor) -> Tree {
    let instance = descriptor.create.create();
    let f = transform_with_state(|ctx, x| instance.call(ctx, x));
    let x = sample_input(&descriptor.shape, 42);
    let (params, state) = f.init(42, &x).unwrap();
    f.apply(&params, &state, 42, &x).unwrap().0
}

#[test]
fn test_unrolled_factories_are_independent() {
    let a = find("Recurrent(GRU, static_unroll)").unwrap();
    let b = find("Recurrent(GRU, dynamic_unroll)").unwrap();

    let a_first = run_fresh(a);
    let b_out = run_fresh(b);
    let a_second = run_fresh(a);
    assert_eq!(a_first, a_second);
    assert!(b_out.same_structure(&a_first));
}

#[test]
fn test_unrolled_descriptors_wrap_their_own_base() {
    for descriptor in RECURRENT_MODULES.iter() {
        let label = descriptor
            .name
            .strip_prefix("Recurrent(")
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap();
        let base = label.split(", ").next().unwrap();
        let instance = descriptor.create.create();
        assert_eq!(unwrap(&instance).kind(), base, "{}", descriptor.name);
    }
}

#[test]
fn test_sample_input_is_deterministic() {
    assert_eq!(sample_input(&[8, 1], 42), sample_input(&[8, 1], 42));
    assert_ne!(sample_input(&[8, 1], 42), sample_input(&[8, 1], 43));
}

#[test]
fn test_ignored_modules_are_not_registered() {
    let kinds: HashSet<&str> = ALL_MODULES.iter().map(|d| d.terminal_kind()).collect();
    for ignored in IGNORED_MODULES {
        assert!(!kinds.contains(ignored), "{} is both ignored and registered", ignored);
    }
}

#[test]
fn test_every_module_kind_is_covered() {
    let kinds: HashSet<&str> = ALL_MODULES.iter().map(|d| d.terminal_kind()).collect();
    let ignored: HashSet<&str> = IGNORED_MODULES.iter().copied().collect();
    let missing: Vec<&str> = MODULE_KINDS
        .iter()
        .copied()
        .filter(|k| !kinds.contains(k) && !ignored.contains(k))
        .collect();
    assert!(missing.is_empty(), "no descriptor for {:?}", missing);
}

#[test]
fn test_batch_modules_are_callable_directly() {
    for descriptor in BATCH_MODULES.iter() {
        if descriptor.dtype != DType::F32 {
            continue;
        }
        let instance = descriptor.create.create();
        let f = transform_with_state(|ctx, x| instance.call(ctx, x));
        let x = sample_input(&descriptor.shape, 0);
        let (params, state) = f.init(0, &x).unwrap();
        let (out, _) = f.apply(&params, &state, 0, &x).unwrap();
        assert!(out.as_tensor().is_some(), "{}", descriptor.name);
    }
}

static INITIAL_STATE_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Echoes its input and counts steps in an `int32` state leaf.
struct CountingCore;

impl RnnCore for CountingCore {
    fn name(&self) -> &str {
        "counting_core"
    }

    fn kind(&self) -> &'static str {
        "CountingCore"
    }

    fn initial_state(&self, batch_size: usize) -> ModuleResult<Tree> {
        INITIAL_STATE_CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(Tree::map([
            ("hidden", Tree::Leaf(Tensor::zeros(&[batch_size, 4], DType::F32))),
            ("steps", Tree::Leaf(Tensor::zeros(&[batch_size], DType::I32))),
        ]))
    }

    fn step(
        &self,
        _ctx: &mut Context<'_>,
        inputs: &Tensor,
        state: &Tree,
    ) -> ModuleResult<(Tensor, Tree)> {
        let hidden = state.field("hidden").and_then(Tree::as_tensor).unwrap().clone();
        let steps = state.field("steps").and_then(Tree::as_tensor).unwrap().add_int(1)?;
        Ok((
            inputs.clone(),
            Tree::map([("hidden", Tree::Leaf(hidden)), ("steps", Tree::Leaf(steps))]),
        ))
    }
}

#[test]
fn test_recurrent_requests_initial_state_once_per_call() {
    let descriptors = unroll_descriptors(
        &[ModuleDescriptor::new(
            "CountingCore",
            || Instance::core(CountingCore),
            &[BATCH_SIZE, 4],
        )],
        Some(STATIC_UNROLL),
    );
    let descriptor = &descriptors[0];
    assert_eq!(descriptor.name, "Recurrent(CountingCore, static_unroll)");

    let instance = descriptor.create.create();
    let f = transform_with_state(|ctx, x| instance.call(ctx, x));
    let x = sample_input(&descriptor.shape, 0).cast(DType::BF16);

    let mut calls = INITIAL_STATE_CALLS.load(Ordering::SeqCst);
    let (params, mut state) = f.init(0, &x).unwrap();
    calls += 1;
    assert_eq!(INITIAL_STATE_CALLS.load(Ordering::SeqCst), calls);

    let mut last = None;
    for application in 1..=2 {
        let (out, next) = f.apply(&params, &state, 0, &x).unwrap();
        calls += 1;
        assert_eq!(INITIAL_STATE_CALLS.load(Ordering::SeqCst), calls, "application {}", application);

        let final_state = out.get(1).unwrap();
        let steps = final_state.field("steps").and_then(Tree::as_tensor).unwrap();
        assert_eq!(steps.dtype(), DType::I32, "application {}", application);
        assert_eq!(steps.as_i32().unwrap().iter().copied().collect::<Vec<_>>(), vec![1; BATCH_SIZE]);
        let hidden = final_state.field("hidden").and_then(Tree::as_tensor).unwrap();
        assert_eq!(hidden.dtype(), DType::BF16);

        state = next;
        last = Some(out);
    }
    let out = last.unwrap();

    let checker = DTypeChecker::new(Device::cpu(), ConformanceConfig::default());
    assert_eq!(checker.check_descriptor(descriptor).unwrap(), Outcome::Passed);
    assert!(out.leaves().iter().all(|t| t.dtype() != DType::F32));
}
