//! Integration-test scaffolding.
//!
//! - `descriptors`: the registry of modules, the calling adapters and `unwrap`
//! - `conformance`: the reduced-precision dtype check run over the registry

pub mod conformance;
pub mod descriptors;

pub use conformance::{
    assert_dtype, sample_input, CaseReport, CaseStatus, ConformanceError, DTypeChecker, Outcome,
    Part, Report, SkipReason,
};
pub use descriptors::{
    find, unroll_descriptors, unwrap, Factory, Instance, ModuleDescriptor, Terminal, ALL_MODULES,
    BATCH_MODULES, BATCH_SIZE, IGNORED_MODULES, RECURRENT_MODULES, RNN_CORES,
};
