//! Warmup, timed measurement and the derived throughput figures.
use crate::backend::{Backend, EventTimer, GemmProblem};
use crate::config::BenchmarkConfig;
use crate::error::{BenchError, Result};
use crate::runner::OperationRunner;
use log::debug;
use std::fmt;

/// Batch column of the result line. Every run here is a single GEMM.
pub const BATCH: usize = 1;

pub const HEADER: &str = "M\tN\tK\tBatch\tTime(us)\tTFLOPS";

/// Device time between the start and stop markers of one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSample {
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub iterations: usize,
    pub sample: TimingSample,
    pub average_us: f64,
    pub tflops: f64,
}

impl Measurement {
    /// `average_us = elapsed_ms * 1000 / iterations`, and
    /// `tflops = m * n * (2k - 1) / 1e6 / average_us`. The elapsed time
    /// must be positive and finite.
    pub fn derive(config: &BenchmarkConfig, sample: TimingSample) -> Result<Self> {
        let iterations = config.measured_iterations();
        if !sample.elapsed_ms.is_finite() || sample.elapsed_ms <= 0.0 {
            return Err(BenchError::Timer(format!(
                "invalid elapsed time {} ms",
                sample.elapsed_ms
            )));
        }
        let average_us = sample.elapsed_ms * 1e3 / iterations as f64;
        let tflops = GemmProblem::from(config).flops() / 1e6 / average_us;
        Ok(Measurement {
            m: config.m(),
            n: config.n(),
            k: config.k(),
            iterations,
            sample,
            average_us,
            tflops,
        })
    }
}

/// Tab separated: `m n k batch average_us tflops`.
impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{:.6}\t{:.6}",
            self.m, self.n, self.k, BATCH, self.average_us, self.tflops
        )
    }
}

/// Runs `iterations` untimed GEMMs back to back, then waits for the device.
pub fn warmup<B: Backend>(runner: &mut OperationRunner<'_, B>, iterations: usize) -> Result<()> {
    for _ in 0..iterations {
        runner.execute()?;
    }
    runner.synchronize()
}

/// Brackets `iterations` back-to-back GEMMs with start and stop markers on
/// the same stream. No call waits on its predecessor.
pub fn time<B: Backend>(
    runner: &mut OperationRunner<'_, B>,
    iterations: usize,
) -> Result<TimingSample> {
    let mut timer = runner.backend().create_timer()?;
    timer.record_start()?;
    for _ in 0..iterations {
        runner.execute()?;
    }
    timer.record_stop()?;
    let elapsed_ms = timer.elapsed_ms()?;
    Ok(TimingSample {
        elapsed_ms: f64::from(elapsed_ms),
    })
}

/// Full protocol: warmup, barrier, timed phase, derived figures.
pub fn measure<B: Backend>(runner: &mut OperationRunner<'_, B>) -> Result<Measurement> {
    let config = *runner.config();
    warmup(runner, config.warmup_iterations())?;
    let sample = time(runner, config.measured_iterations())?;
    debug!(
        "{} iterations took {:.3} ms",
        config.measured_iterations(),
        sample.elapsed_ms
    );
    Measurement::derive(&config, sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tiny_problem_line() {
        let config = BenchmarkConfig::new(2, 2, 2, 0, 1).unwrap();
        let measurement = Measurement::derive(&config, TimingSample { elapsed_ms: 1.0 }).unwrap();
        assert_eq!(measurement.average_us, 1000.0);
        assert_eq!(measurement.tflops, 2.0 * 2.0 * 3.0 / 1e6 / 1000.0);
        assert_eq!(measurement.to_string(), "2\t2\t2\t1\t1000.000000\t0.000000");
    }

    #[test]
    fn average_divides_by_iterations() {
        let config = BenchmarkConfig::new(1024, 1024, 1024, 20, 50).unwrap();
        let measurement = Measurement::derive(&config, TimingSample { elapsed_ms: 25.0 }).unwrap();
        assert!((measurement.average_us - 500.0).abs() < 1e-9);
        let expected = 1024.0 * 1024.0 * 2047.0 / 1e6 / 500.0;
        assert!((measurement.tflops - expected).abs() / expected < 1e-12);
        assert_eq!(
            measurement.to_string(),
            format!("1024\t1024\t1024\t1\t500.000000\t{:.6}", expected)
        );
    }

    #[test]
    fn zero_elapsed_rejected() {
        let config = BenchmarkConfig::new(1024, 1024, 1024, 20, 50).unwrap();
        let err = Measurement::derive(&config, TimingSample { elapsed_ms: 0.0 }).unwrap_err();
        assert!(matches!(err, BenchError::Timer(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn negative_or_nan_elapsed_rejected() {
        let config = BenchmarkConfig::new(2, 2, 2, 0, 1).unwrap();
        for elapsed_ms in [-1.0, -0.0, f64::NAN, f64::INFINITY] {
            let err = Measurement::derive(&config, TimingSample { elapsed_ms }).unwrap_err();
            assert!(matches!(err, BenchError::Timer(_)));
        }
    }

    #[test]
    fn header_has_six_columns() {
        assert_eq!(HEADER.split('\t').count(), 6);
    }

    proptest! {
        #[test]
        fn throughput_matches_formula(
            m in 1usize..20_000,
            n in 1usize..20_000,
            k in 1usize..20_000,
            iterations in 1usize..1000,
            elapsed_ms in 0.001f64..10_000.0,
        ) {
            let config = BenchmarkConfig::new(m, n, k, 0, iterations).unwrap();
            let measurement = Measurement::derive(&config, TimingSample { elapsed_ms }).unwrap();
            let expected = m as f64 * n as f64 * (2.0 * k as f64 - 1.0)
                / 1e6
                / (elapsed_ms * 1000.0 / iterations as f64);
            prop_assert!((measurement.tflops - expected).abs() <= expected * 1e-6);
            prop_assert!(measurement.tflops.is_finite());
        }
    }
}
