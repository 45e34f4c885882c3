//! Owns the three operand buffers and the GEMM handle for one problem.
use crate::backend::{Backend, DeviceMatrix, GemmProblem, MatrixRole};
use crate::config::{BenchmarkConfig, SetupOptions};
use crate::error::Result;
use crate::generator::{self, RangeReport};
use half::f16;
use log::debug;

/// A ready GEMM: A and B filled, C allocated, handle bound.
///
/// Buffers and handle are never handed out, and all of them are released
/// together when the runner is dropped.
pub struct OperationRunner<'b, B: Backend> {
    backend: &'b B,
    config: BenchmarkConfig,
    problem: GemmProblem,
    handle: B::Handle,
    a: B::Matrix,
    b: B::Matrix,
    c: B::Matrix,
    input_ranges: Option<(RangeReport, RangeReport)>,
}

impl<'b, B: Backend> OperationRunner<'b, B> {
    /// Allocates A (m×k), B (k×n) and C (m×n), fills A and B with the
    /// seeded generator and waits for the fill to land. Anything allocated
    /// before a failure is released on return.
    pub fn setup(backend: &'b B, config: &BenchmarkConfig, options: &SetupOptions) -> Result<Self> {
        let problem = GemmProblem::from(config);
        let mut a = backend.allocate(problem.shape(MatrixRole::A))?;
        let mut b = backend.allocate(problem.shape(MatrixRole::B))?;
        let c = backend.allocate(problem.shape(MatrixRole::C))?;

        generator::fill(backend, &mut a, options.seed)?;
        generator::fill(backend, &mut b, options.seed)?;
        backend.synchronize()?;

        let input_ranges = if options.verify {
            Some((
                generator::verify(backend, &a)?,
                generator::verify(backend, &b)?,
            ))
        } else {
            None
        };

        let handle = backend.create_handle(&problem, &a, &b, &c)?;
        debug!(
            "runner ready on {}: m={} n={} k={}",
            backend.name(),
            problem.m,
            problem.n,
            problem.k
        );
        Ok(OperationRunner {
            backend,
            config: *config,
            problem,
            handle,
            a,
            b,
            c,
            input_ranges,
        })
    }

    /// Issues `C = A^T · B`. With beta = 0 the previous contents of C never
    /// leak into the result. Does not wait for the device.
    pub fn execute(&mut self) -> Result<()> {
        self.backend
            .gemm(&mut self.handle, &self.a, &self.b, &mut self.c)
    }

    pub fn synchronize(&self) -> Result<()> {
        self.backend.synchronize()
    }

    pub fn backend(&self) -> &'b B {
        self.backend
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn problem(&self) -> &GemmProblem {
        &self.problem
    }

    /// Range reports of A and B, when setup verified them.
    pub fn input_ranges(&self) -> Option<(RangeReport, RangeReport)> {
        self.input_ranges
    }

    /// Host copy of one operand.
    pub fn read(&self, role: MatrixRole) -> Result<Vec<f16>> {
        let matrix = match role {
            MatrixRole::A => &self.a,
            MatrixRole::B => &self.b,
            MatrixRole::C => &self.c,
        };
        self.backend.read_back(matrix)
    }
}

impl<'b, B: Backend> Drop for OperationRunner<'b, B> {
    fn drop(&mut self) {
        debug!(
            "releasing runner on {}: {} + {} + {} elements",
            self.backend.name(),
            self.a.len(),
            self.b.len(),
            self.c.len()
        );
    }
}
