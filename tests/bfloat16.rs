//! Every registered module keeps a reduced-precision dtype through two
//! applications, in its outputs and in its state.

use rstest::rstest;
use rustymod::config::ConformanceConfig;
use rustymod::integration::{
    assert_dtype, find, DTypeChecker, Outcome, SkipReason, ALL_MODULES,
};
use rustymod::runtime::platform::Device;
use rustymod::tensor::DType;

fn checker(dtype: DType) -> DTypeChecker {
    DTypeChecker::new(Device::cpu(), ConformanceConfig::default().with_test_dtype(dtype))
}

#[rstest]
#[case::bfloat16(DType::BF16)]
#[case::float16(DType::F16)]
fn test_all_modules_keep_dtype(#[case] dtype: DType) {
    let checker = checker(dtype);
    let mut failures = Vec::new();
    for descriptor in ALL_MODULES.iter() {
        match checker.check_descriptor(descriptor) {
            Ok(Outcome::Passed) => {}
            Ok(Outcome::Skipped(reason)) => {
                assert_eq!(descriptor.name, "Embed", "unexpected skip: {}", reason);
            }
            Err(e) => failures.push(format!("{}: {}", descriptor.name, e)),
        }
    }
    assert!(failures.is_empty(), "{} failures:\n{}", failures.len(), failures.join("\n"));
}

#[rstest]
#[case("Linear")]
#[case("BatchNorm")]
#[case("Sequential(Conv2D, BatchNorm)")]
#[case("SpectralNorm")]
#[case("Recurrent(LSTM)")]
#[case("Recurrent(GRU, dynamic_unroll)")]
#[case("Recurrent(ResetCore, static_unroll)")]
fn test_single_module_bfloat16(#[case] name: &str) {
    let descriptor = find(name).unwrap();
    let outcome = checker(DType::BF16).check_descriptor(descriptor).unwrap();
    assert_eq!(outcome, Outcome::Passed, "{}", name);
}

#[test]
fn test_embed_is_skipped_for_integer_input() {
    let embed = find("Embed").unwrap();
    let outcome = checker(DType::BF16).check_descriptor(embed).unwrap();
    assert_eq!(outcome, Outcome::Skipped(SkipReason::NonFloatInput { dtype: DType::I32 }));
}

#[test]
fn test_unsupported_device_skips_everything() {
    let checker = DTypeChecker::new(
        Device::cpu().with_reduced_precision(false),
        ConformanceConfig::default(),
    );
    let report = checker.run(&ALL_MODULES);
    assert_eq!(report.cases.len(), ALL_MODULES.len());
    assert_eq!(report.skipped(), ALL_MODULES.len());
    assert!(report.is_success());
}

#[test]
fn test_assert_dtype_on_local_device() {
    let linear = find("Linear").unwrap();
    let outcome = assert_dtype(DType::BF16, &linear.create, &linear.shape, linear.dtype).unwrap();
    assert!(matches!(
        outcome,
        Outcome::Passed | Outcome::Skipped(SkipReason::UnsupportedPlatform { .. })
    ));
}

#[test]
fn test_three_applications() {
    let checker = DTypeChecker::new(
        Device::cpu(),
        ConformanceConfig::default().with_applications(3).with_filter("Norm"),
    );
    let report = checker.run(&ALL_MODULES);
    assert!(report.passed() >= 4, "{:?}", report);
    assert!(report.is_success(), "{:?}", report);
}
