//! Precision conformance check.
//!
//! Runs a registered module under a reduced-precision dtype and verifies
//! that nothing it produces silently widens back to `float32`: parameters
//! and state are initialized in `float32`, cast to the test dtype, and every
//! output and state leaf of two consecutive applications must have exactly
//! the test dtype. `int32` leaves (counters, step indices) are exempt.

use crate::config::ConformanceConfig;
use crate::integration::descriptors::{Factory, ModuleDescriptor};
use crate::nn::ModuleError;
use crate::runtime::platform::Device;
use crate::tensor::{DType, Tensor};
use crate::transform::transform_with_state;
use crate::tree::Leaves;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a check did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The local device has no support for the test dtype.
    UnsupportedPlatform { dtype: DType },
    /// The module takes non-float input (e.g. embedding ids).
    NonFloatInput { dtype: DType },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedPlatform { dtype } => {
                write!(f, "{} is not supported on this platform", dtype)
            }
            SkipReason::NonFloatInput { dtype } => write!(f, "input dtype {} is not float32", dtype),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Skipped(SkipReason),
}

/// Which part of an application's result a leaf belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Part {
    Output,
    State,
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Part::Output => f.write_str("output"),
            Part::State => f.write_str("state"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConformanceError {
    #[error("application {application}: {part} leaf `{path}` has dtype {actual}, expected {expected}")]
    DTypeMismatch {
        application: usize,
        part: Part,
        path: String,
        expected: DType,
        actual: DType,
    },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

type Result<T> = std::result::Result<T, ConformanceError>;

/// A uniform `[0, 1)` float32 sample; equal arguments give identical tensors.
pub fn sample_input(shape: &[usize], seed: u64) -> Tensor {
    Tensor::random_uniform(shape, seed)
}

/// Casts `float32` tensors to `dtype` and leaves everything else alone.
fn cast_f32(t: &Tensor, dtype: DType) -> Tensor {
    if t.dtype() == DType::F32 {
        t.cast(dtype)
    } else {
        t.clone()
    }
}

/// Path reported for a tree that is a single leaf.
const ROOT_PATH: &str = "<root>";

/// Fails on the first leaf that is neither `int32` nor `expected`.
fn check_leaves<L: Leaves>(tree: &L, application: usize, part: Part, expected: DType) -> Result<()> {
    for (path, leaf) in tree.leaves_with_path() {
        let actual = leaf.dtype();
        if actual != DType::I32 && actual != expected {
            return Err(ConformanceError::DTypeMismatch {
                application,
                part,
                path: if path.is_empty() {
                    ROOT_PATH.to_string()
                } else {
                    path
                },
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Runs the check for one module with the default settings and the local
/// device.
pub fn assert_dtype(
    test_dtype: DType,
    create: &Factory,
    shape: &[usize],
    input_dtype: DType,
) -> Result<Outcome> {
    let config = ConformanceConfig::default().with_test_dtype(test_dtype);
    DTypeChecker::new(Device::local(), config).check(create, shape, input_dtype)
}

/// Result of one descriptor in a [`Report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum CaseStatus {
    Passed,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub name: String,
    #[serde(flatten)]
    pub status: CaseStatus,
}

/// Summary of a run over many descriptors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub test_dtype: DType,
    pub seed: u64,
    pub cases: Vec<CaseReport>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Passed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CaseStatus::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&CaseStatus) -> bool) -> usize {
        self.cases.iter().filter(|c| pred(&c.status)).count()
    }
}

/// Checks modules against a device and a [`ConformanceConfig`].
#[derive(Debug, Clone)]
pub struct DTypeChecker {
    device: Device,
    config: ConformanceConfig,
}

impl DTypeChecker {
    pub fn new(device: Device, config: ConformanceConfig) -> Self {
        Self { device, config }
    }

    /// Builds a module with `create` and checks it on an input of `shape`.
    pub fn check(&self, create: &Factory, shape: &[usize], input_dtype: DType) -> Result<Outcome> {
        let test_dtype = self.config.test_dtype;
        if !self.device.supports(test_dtype) {
            return Ok(Outcome::Skipped(SkipReason::UnsupportedPlatform { dtype: test_dtype }));
        }
        if input_dtype != DType::F32 {
            return Ok(Outcome::Skipped(SkipReason::NonFloatInput { dtype: input_dtype }));
        }

        let seed = self.config.seed;
        let instance = create.create();
        let f = transform_with_state(|ctx, x| instance.call(ctx, x));

        let x = sample_input(shape, seed);
        let (params, state) = f.init(seed, &x)?;
        let params = params.map_leaves(|t| cast_f32(t, test_dtype));
        let mut state = state.map_leaves(|t| cast_f32(t, test_dtype));
        let x = x.cast(test_dtype);

        for application in 1..=self.config.applications {
            let (out, next) = f.apply(&params, &state, seed, &x)?;
            check_leaves(&out, application, Part::Output, test_dtype)?;
            check_leaves(&next, application, Part::State, test_dtype)?;
            state = next;
        }
        Ok(Outcome::Passed)
    }

    pub fn check_descriptor(&self, descriptor: &ModuleDescriptor) -> Result<Outcome> {
        self.check(&descriptor.create, &descriptor.shape, descriptor.dtype)
    }

    /// Checks every descriptor selected by the config's filter.
    pub fn run(&self, descriptors: &[ModuleDescriptor]) -> Report {
        let cases = descriptors
            .iter()
            .filter(|d| self.config.selects(&d.name))
            .map(|d| {
                let status = match self.check_descriptor(d) {
                    Ok(Outcome::Passed) => {
                        log::info!("{}: passed under {}", d.name, self.config.test_dtype);
                        CaseStatus::Passed
                    }
                    Ok(Outcome::Skipped(reason)) => {
                        log::warn!("{}: skipped, {}", d.name, reason);
                        CaseStatus::Skipped { reason }
                    }
                    Err(e) => {
                        log::error!("{}: {}", d.name, e);
                        CaseStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                CaseReport {
                    name: d.name.to_string(),
                    status,
                }
            })
            .collect();
        Report {
            test_dtype: self.config.test_dtype,
            seed: self.config.seed,
            cases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::descriptors::{find, Instance, BATCH_MODULES};
    use crate::nn::{Initializer, Module, ModuleResult};
    use crate::transform::Context;
    use crate::tree::{State, Tree};

    /// Adds a float32 constant, which promotes any other float input.
    struct Widening;

    impl Module for Widening {
        fn name(&self) -> &str {
            "widening"
        }

        fn kind(&self) -> &'static str {
            "Widening"
        }

        fn forward(&self, _ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
            Ok(inputs.add(&Tensor::ones(&[1], DType::F32))?)
        }
    }

    /// Keeps a `leak` state leaf in the input dtype for its first two calls
    /// (init and the first application), then writes it as float32.
    struct LateStateWidening;

    impl Module for LateStateWidening {
        fn name(&self) -> &str {
            "late"
        }

        fn kind(&self) -> &'static str {
            "LateStateWidening"
        }

        fn forward(&self, ctx: &mut Context<'_>, inputs: &Tensor) -> ModuleResult<Tensor> {
            let calls = ctx.get_state("late", "calls", &[], DType::I32, &Initializer::Constant(0.0))?;
            let seen = calls.as_i32().map_or(0, |a| a.sum());
            let leak_dtype = if seen >= 2 { DType::F32 } else { inputs.dtype() };
            ctx.set_state("late", "leak", Tensor::zeros(&[1], leak_dtype));
            ctx.set_state("late", "calls", calls.add_int(1)?);
            Ok(inputs.clone())
        }
    }

    fn checker() -> DTypeChecker {
        DTypeChecker::new(Device::cpu(), ConformanceConfig::default())
    }

    #[test]
    fn test_sample_input_is_deterministic() {
        let a = sample_input(&[8, 3], 42);
        let b = sample_input(&[8, 3], 42);
        assert_eq!(a, b);
        assert_eq!(a.dtype(), DType::F32);
        assert!(a.to_f32_array().iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_unsupported_platform_skips() {
        let checker = DTypeChecker::new(
            Device::cpu().with_reduced_precision(false),
            ConformanceConfig::default(),
        );
        let linear = find("Linear").unwrap();
        assert_eq!(
            checker.check_descriptor(linear).unwrap(),
            Outcome::Skipped(SkipReason::UnsupportedPlatform { dtype: DType::BF16 })
        );
    }

    #[test]
    fn test_embed_skips() {
        let embed = find("Embed").unwrap();
        assert_eq!(
            checker().check_descriptor(embed).unwrap(),
            Outcome::Skipped(SkipReason::NonFloatInput { dtype: DType::I32 })
        );
    }

    #[test]
    fn test_mismatch_is_reported_with_path() {
        let mut state = State::new();
        state.insert("counter_module", "count", Tensor::zeros(&[], DType::I32));
        state.insert("leaky", "hidden", Tensor::zeros(&[2], DType::F32));
        let err = check_leaves(&state, 2, Part::State, DType::BF16).unwrap_err();
        assert_eq!(
            err,
            ConformanceError::DTypeMismatch {
                application: 2,
                part: Part::State,
                path: "leaky/hidden".to_string(),
                expected: DType::BF16,
                actual: DType::F32,
            }
        );
        assert!(err.to_string().contains("state leaf `leaky/hidden`"));

        let out = Tree::Leaf(Tensor::zeros(&[2], DType::BF16));
        assert!(check_leaves(&out, 1, Part::Output, DType::BF16).is_ok());
    }

    #[test]
    fn test_widened_output_fails_first_application() {
        let create = Factory::Module(|| Instance::module(Widening));
        let err = checker().check(&create, &[8, 3], DType::F32).unwrap_err();
        assert_eq!(
            err,
            ConformanceError::DTypeMismatch {
                application: 1,
                part: Part::Output,
                path: "<root>".to_string(),
                expected: DType::BF16,
                actual: DType::F32,
            }
        );
        assert!(err.to_string().contains("output leaf `<root>` has dtype"));
    }

    #[test]
    fn test_state_widened_on_second_application_fails() {
        let create = Factory::Module(|| Instance::module(LateStateWidening));
        let err = checker().check(&create, &[8, 3], DType::F32).unwrap_err();
        assert_eq!(
            err,
            ConformanceError::DTypeMismatch {
                application: 2,
                part: Part::State,
                path: "late/leak".to_string(),
                expected: DType::BF16,
                actual: DType::F32,
            }
        );

        let single = DTypeChecker::new(
            Device::cpu(),
            ConformanceConfig::default().with_applications(1),
        );
        assert_eq!(single.check(&create, &[8, 3], DType::F32).unwrap(), Outcome::Passed);
    }

    #[test]
    fn test_assert_dtype_reports_widening() {
        let create = Factory::Module(|| Instance::module(Widening));
        match assert_dtype(DType::F16, &create, &[8, 3], DType::F32) {
            Err(ConformanceError::DTypeMismatch { application, part, expected, .. }) => {
                assert_eq!((application, part, expected), (1, Part::Output, DType::F16));
            }
            Ok(Outcome::Skipped(SkipReason::UnsupportedPlatform { .. })) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_run_report() {
        let checker = DTypeChecker::new(
            Device::cpu(),
            ConformanceConfig::default().with_filter("Conv1D"),
        );
        let report = checker.run(&BATCH_MODULES);
        let names: Vec<&str> = report.cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Conv1D", "Conv1DTranspose"]);
        assert_eq!(report.passed(), 2);
        assert!(report.is_success());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["test_dtype"], "bf16");
        assert_eq!(json["cases"][0]["status"], "passed");
    }
}
