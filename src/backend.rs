//! The narrow interface between the harness and a compute device.
//!
//! A [`Backend`] owns nothing the harness cares about except the device
//! itself: matrices and the GEMM handle are created through it and then
//! owned by an [`OperationRunner`](crate::runner::OperationRunner).
use crate::config::BenchmarkConfig;
use crate::error::{BenchError, Result};
use half::f16;
use std::{fmt, mem::size_of, time::Instant};

/// Which operand of `C = op(A) · op(B)` a matrix plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixRole {
    A,
    B,
    C,
}

impl fmt::Display for MatrixRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatrixRole::A => "A",
            MatrixRole::B => "B",
            MatrixRole::C => "C",
        };
        f.write_str(name)
    }
}

/// Logical shape of an operand: A is m×k, B is k×n, C is m×n.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixShape {
    pub role: MatrixRole,
    pub rows: usize,
    pub cols: usize,
}

impl MatrixShape {
    pub fn elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Size in bytes of the half precision storage.
    pub fn bytes(&self) -> u64 {
        (self.elements() * size_of::<f16>()) as u64
    }
}

/// A device resident buffer of half precision elements.
pub trait DeviceMatrix {
    fn shape(&self) -> MatrixShape;

    fn len(&self) -> usize {
        self.shape().elements()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One GEMM call: `C = alpha · A^T · B + beta · C`, column-major, with A
/// stored k×m (lda = k), B stored k×n (ldb = k) and C stored m×n (ldc = m).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub beta: f32,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
}

impl GemmProblem {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        GemmProblem {
            m,
            n,
            k,
            alpha: 1.0,
            beta: 0.0,
            lda: k,
            ldb: k,
            ldc: m,
        }
    }

    pub fn shape(&self, role: MatrixRole) -> MatrixShape {
        let (rows, cols) = match role {
            MatrixRole::A => (self.m, self.k),
            MatrixRole::B => (self.k, self.n),
            MatrixRole::C => (self.m, self.n),
        };
        MatrixShape { role, rows, cols }
    }

    /// Element strides `(row, col)` of the logical operand inside its
    /// storage. `op(A)[i, l]` lives at `i * lda + l` because A is transposed.
    pub fn strides(&self, role: MatrixRole) -> (usize, usize) {
        match role {
            MatrixRole::A => (self.lda, 1),
            MatrixRole::B => (1, self.ldb),
            MatrixRole::C => (1, self.ldc),
        }
    }

    /// Floating point operations of one call: `m·n·(2k - 1)`.
    pub fn flops(&self) -> f64 {
        self.m as f64 * self.n as f64 * (2.0 * self.k as f64 - 1.0)
    }
}

impl From<&BenchmarkConfig> for GemmProblem {
    fn from(config: &BenchmarkConfig) -> Self {
        GemmProblem::new(config.m(), config.n(), config.k())
    }
}

/// Start/stop markers on the device's execution stream.
pub trait EventTimer {
    fn record_start(&mut self) -> Result<()>;
    fn record_stop(&mut self) -> Result<()>;
    /// Blocks until the stop marker has been reached and returns the time
    /// between both markers.
    fn elapsed_ms(&mut self) -> Result<f32>;
}

pub trait Backend {
    type Matrix: DeviceMatrix;
    /// Bound session with the compute kernel, one per runner.
    type Handle;
    type Timer: EventTimer;

    fn name(&self) -> String;

    fn allocate(&self, shape: MatrixShape) -> Result<Self::Matrix>;

    /// Fills every element with a value drawn uniformly from [-1, 1]. The
    /// fill may still be in flight when this returns.
    fn fill_uniform(&self, matrix: &mut Self::Matrix, seed: u64) -> Result<()>;

    /// Copies the matrix back to the host, waiting for pending work.
    fn read_back(&self, matrix: &Self::Matrix) -> Result<Vec<f16>>;

    fn create_handle(
        &self,
        problem: &GemmProblem,
        a: &Self::Matrix,
        b: &Self::Matrix,
        c: &Self::Matrix,
    ) -> Result<Self::Handle>;

    /// Issues one GEMM. May return before the device has finished.
    fn gemm(
        &self,
        handle: &mut Self::Handle,
        a: &Self::Matrix,
        b: &Self::Matrix,
        c: &mut Self::Matrix,
    ) -> Result<()>;

    /// Device-wide barrier.
    fn synchronize(&self) -> Result<()>;

    fn create_timer(&self) -> Result<Self::Timer>;
}

/// Markers taken from the host monotonic clock.
///
/// Only meaningful when everything queued before `record_stop` has already
/// completed, so device backends must block before stopping it.
#[derive(Debug, Default)]
pub struct HostTimer {
    start: Option<Instant>,
    stop: Option<Instant>,
}

impl HostTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventTimer for HostTimer {
    fn record_start(&mut self) -> Result<()> {
        self.start = Some(Instant::now());
        self.stop = None;
        Ok(())
    }

    fn record_stop(&mut self) -> Result<()> {
        self.stop = Some(Instant::now());
        Ok(())
    }

    fn elapsed_ms(&mut self) -> Result<f32> {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => {
                Ok(stop.saturating_duration_since(start).as_secs_f32() * 1e3)
            }
            _ => Err(BenchError::Timer(
                "elapsed time requested before both markers were recorded".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_follow_operand_roles() {
        let problem = GemmProblem::new(3, 5, 7);
        assert_eq!(problem.shape(MatrixRole::A).elements(), 21);
        assert_eq!(problem.shape(MatrixRole::B).elements(), 35);
        assert_eq!(problem.shape(MatrixRole::C).elements(), 15);
        assert_eq!(problem.shape(MatrixRole::C).bytes(), 30);
    }

    #[test]
    fn transposed_a_is_row_strided() {
        let problem = GemmProblem::new(3, 5, 7);
        assert_eq!(problem.strides(MatrixRole::A), (7, 1));
        assert_eq!(problem.strides(MatrixRole::B), (1, 7));
        assert_eq!(problem.strides(MatrixRole::C), (1, 3));
    }

    #[test]
    fn flop_count_skips_final_add() {
        assert_eq!(GemmProblem::new(2, 2, 2).flops(), 12.0);
        assert_eq!(GemmProblem::new(1, 1, 1).flops(), 1.0);
    }

    #[test]
    fn host_timer_needs_both_markers() {
        let mut timer = HostTimer::new();
        assert!(timer.elapsed_ms().is_err());
        timer.record_start().unwrap();
        assert!(timer.elapsed_ms().is_err());
        timer.record_stop().unwrap();
        assert!(timer.elapsed_ms().unwrap() >= 0.0);
    }
}
