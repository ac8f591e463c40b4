//! Command-line entry point: lists the module registry and runs the
//! reduced-precision conformance check over it.

use clap::{Parser, Subcommand};
use rustymod::config::{ConformanceConfig, FILTER_ENV, SEED_ENV, TEST_DTYPE_ENV};
use rustymod::integration::{CaseStatus, DTypeChecker, ALL_MODULES, IGNORED_MODULES};
use rustymod::runtime::platform::Device;
use rustymod::tensor::DType;
use std::process::ExitCode;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "RustyMod: module registry and dtype conformance", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every registered module with its input shape and dtype
    List {
        /// Also print the module kinds left out of the registry
        #[arg(long)]
        ignored: bool,
    },
    /// Check that modules keep the test dtype in outputs and state
    Check {
        /// Reduced-precision dtype to check under (bf16 or f16)
        #[arg(long, env = TEST_DTYPE_ENV, default_value = "bf16")]
        dtype: DType,
        #[arg(long, env = SEED_ENV, default_value_t = 42)]
        seed: u64,
        /// Only check modules whose name contains this substring
        #[arg(long, env = FILTER_ENV)]
        filter: Option<String>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        /// Treat the device as lacking reduced-precision support
        #[arg(long)]
        no_reduced_precision: bool,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::List { ignored } => {
            for d in ALL_MODULES.iter() {
                println!(
                    "{:<40} {:<18} {:<10} {:?}",
                    d.name,
                    d.terminal_kind(),
                    d.dtype.to_string(),
                    d.shape
                );
            }
            if ignored {
                println!("\nignored: {}", IGNORED_MODULES.join(", "));
            }
            ExitCode::SUCCESS
        }
        Command::Check {
            dtype,
            seed,
            filter,
            json,
            no_reduced_precision,
        } => {
            if !dtype.is_float() {
                eprintln!("--dtype must be a floating-point dtype, got {}", dtype);
                return ExitCode::from(2);
            }
            let mut config = match ConformanceConfig::from_env() {
                Ok(config) => config.with_test_dtype(dtype).with_seed(seed),
                Err(e) => {
                    eprintln!("{}", e);
                    return ExitCode::from(2);
                }
            };
            if let Some(filter) = filter {
                config = config.with_filter(filter);
            }
            let device = if no_reduced_precision {
                Device::local().with_reduced_precision(false)
            } else {
                Device::local()
            };

            let report = DTypeChecker::new(device, config).run(&ALL_MODULES);
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(s) => println!("{}", s),
                    Err(e) => {
                        eprintln!("failed to serialize report: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                for case in &report.cases {
                    match &case.status {
                        CaseStatus::Passed => println!("PASS  {}", case.name),
                        CaseStatus::Skipped { reason } => println!("SKIP  {} ({})", case.name, reason),
                        CaseStatus::Failed { error } => println!("FAIL  {}: {}", case.name, error),
                    }
                }
                println!(
                    "\n{} passed, {} skipped, {} failed ({})",
                    report.passed(),
                    report.skipped(),
                    report.failed(),
                    report.test_dtype
                );
            }
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
