//! Half precision GEMM micro-benchmark.
//!
//! A run sets up an [`OperationRunner`](runner::OperationRunner) (three
//! device buffers plus a GEMM handle), warms it up, then times a fixed
//! number of back-to-back GEMM calls between two device markers and turns
//! the elapsed time into microseconds per call and TFLOP/s.
#[macro_use]
extern crate lazy_static;

pub mod backend;
pub mod config;
pub mod cpu;
pub mod error;
pub mod generator;
pub mod gpu;
pub mod runner;
pub mod timing;

use backend::Backend;
use config::{Args, BenchmarkConfig, SetupOptions};
use error::Result;
use log::info;
use runner::OperationRunner;
use std::io::Write;
use timing::{Measurement, HEADER};

pub mod prelude {
    pub use super::backend::{Backend, DeviceMatrix, EventTimer, GemmProblem, MatrixRole};
    pub use super::benchmark;
    pub use super::config::{Args, BenchmarkConfig, SetupOptions};
    pub use super::cpu::CpuBackend;
    pub use super::error::{BenchError, Result};
    pub use super::gpu::GpuBackend;
    pub use super::runner::OperationRunner;
    pub use super::timing::{measure, Measurement, TimingSample};
}

/// Sets up a runner for `config`, runs warmup and measurement, and tears
/// the runner down again before returning.
pub fn benchmark<B: Backend>(
    backend: &B,
    config: &BenchmarkConfig,
    options: &SetupOptions,
) -> Result<Measurement> {
    info!(
        "benchmarking m={} n={} k={} on {} ({} warmup, {} timed)",
        config.m(),
        config.n(),
        config.k(),
        backend.name(),
        config.warmup_iterations(),
        config.measured_iterations()
    );
    let mut runner = OperationRunner::setup(backend, config, options)?;
    timing::measure(&mut runner)
}

/// Validates the whole plan in `args`, then connects to a backend and
/// writes one result line per shape to `out`. `connect` is not called when
/// the plan is invalid.
pub fn run<B, F, W>(args: &Args, connect: F, out: &mut W) -> Result<()>
where
    B: Backend,
    F: FnOnce() -> Result<B>,
    W: Write,
{
    let plan = args.plan()?;
    let options = args.setup_options();
    let backend = connect()?;
    if args.header {
        writeln!(out, "{}", HEADER)?;
    }
    for config in &plan {
        let measurement = benchmark(&backend, config, &options)?;
        writeln!(out, "{}", measurement)?;
        out.flush()?;
    }
    Ok(())
}
