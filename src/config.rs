//! Command line surface and the validated benchmark configuration.
use crate::error::{BenchError, Result};
use crate::generator::DEFAULT_SEED;
use clap::{Parser, ValueEnum};
use std::{mem::size_of, str::FromStr};

/// Problem size and iteration counts of one benchmark run.
///
/// Only obtainable through [`BenchmarkConfig::new`], so every instance has
/// positive dimensions and at least one measured iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkConfig {
    m: usize,
    n: usize,
    k: usize,
    warmup_iterations: usize,
    measured_iterations: usize,
}

impl BenchmarkConfig {
    pub fn new(
        m: usize,
        n: usize,
        k: usize,
        warmup_iterations: usize,
        measured_iterations: usize,
    ) -> Result<Self> {
        for (name, value) in [("m", m), ("n", n), ("k", k)] {
            if value == 0 {
                return Err(BenchError::Config(format!("{} must be positive", name)));
            }
        }
        if measured_iterations == 0 {
            return Err(BenchError::Config(
                "at least one measured iteration is required".into(),
            ));
        }
        for (name, rows, cols) in [("A", m, k), ("B", k, n), ("C", m, n)] {
            let fits = rows
                .checked_mul(cols)
                .and_then(|elements| elements.checked_mul(size_of::<u16>()))
                .map_or(false, |bytes| bytes <= isize::MAX as usize);
            if !fits {
                return Err(BenchError::Config(format!(
                    "matrix {} ({}x{}) is too large to address",
                    name, rows, cols
                )));
            }
        }
        Ok(BenchmarkConfig {
            m,
            n,
            k,
            warmup_iterations,
            measured_iterations,
        })
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn warmup_iterations(&self) -> usize {
        self.warmup_iterations
    }

    pub fn measured_iterations(&self) -> usize {
        self.measured_iterations
    }
}

/// How a runner prepares its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOptions {
    /// Seed shared by the A and B fills.
    pub seed: u64,
    /// Read A and B back after the fill and check their value range.
    pub verify: bool,
}

impl Default for SetupOptions {
    fn default() -> Self {
        SetupOptions {
            seed: DEFAULT_SEED,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// wgpu device (Vulkan, Metal, DX12)
    Gpu,
    /// Host reference implementation
    Cpu,
}

/// Fixed shape lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Square shapes plus GEMMs common in transformer layers
    ModelSizes,
}

impl Preset {
    pub fn shapes(&self) -> &'static [(usize, usize, usize)] {
        match self {
            Preset::ModelSizes => &[
                (1024, 1024, 1024),
                (2048, 2048, 2048),
                (4096, 4096, 4096),
                (8192, 8192, 8192),
                (16384, 16384, 16384),
                (1024, 2145, 1024),
                (6144, 12288, 12288),
                (802816, 192, 192),
                (802816, 192, 768),
            ],
        }
    }
}

/// `START:END:STEP`, applied to all three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepRange {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl SweepRange {
    /// `start, start + step, ...` below `end`, always closed by `end`.
    pub fn values(&self) -> Vec<usize> {
        let mut values: Vec<usize> = (self.start..self.end).step_by(self.step).collect();
        if values.last().map_or(true, |&last| last < self.end) {
            values.push(self.end);
        }
        values
    }

    /// Shapes where at least two of the three dimensions sit at `end`, so
    /// each dimension is swept while the other two stay at the maximum.
    pub fn shmoo(&self) -> Vec<(usize, usize, usize)> {
        let values = self.values();
        let mut shapes = Vec::new();
        for &m in &values {
            for &n in &values {
                for &k in &values {
                    let pinned = [m, n, k].iter().filter(|&&d| d == self.end).count();
                    if pinned >= 2 {
                        shapes.push((m, n, k));
                    }
                }
            }
        }
        shapes
    }
}

impl FromStr for SweepRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("expected START:END:STEP, got {:?}", s));
        }
        let mut numbers = [0usize; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .trim()
                .parse()
                .map_err(|e| format!("invalid sweep bound {:?}: {}", part, e))?;
        }
        let [start, end, step] = numbers;
        if start == 0 || step == 0 {
            return Err("sweep start and step must be positive".into());
        }
        if end < start {
            return Err(format!("sweep end {} is below start {}", end, start));
        }
        Ok(SweepRange { start, end, step })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gemm-bench",
    version,
    about = "Measures half precision GEMM throughput (C = A^T * B)",
    allow_negative_numbers = true
)]
pub struct Args {
    /// Rows of A^T and C
    #[arg(short, default_value_t = 1024, conflicts_with_all = ["sweep", "preset"])]
    pub m: i64,

    /// Columns of B and C
    #[arg(short, default_value_t = 1024, conflicts_with_all = ["sweep", "preset"])]
    pub n: i64,

    /// Shared (reduction) dimension
    #[arg(short, default_value_t = 1024, conflicts_with_all = ["sweep", "preset"])]
    pub k: i64,

    /// Untimed iterations before measuring
    #[arg(short, long, default_value_t = 20)]
    pub warmup: i64,

    /// Timed iterations
    #[arg(short, long = "iter", default_value_t = 50)]
    pub iter: i64,

    #[arg(long, value_enum, default_value_t = BackendKind::Gpu, env = "GEMM_BENCH_BACKEND")]
    pub backend: BackendKind,

    /// Seed of the input fill
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Skip reading A and B back to check their value range
    #[arg(long)]
    pub no_verify: bool,

    /// Print a column header before the results
    #[arg(long)]
    pub header: bool,

    /// Sweep all dimensions over START:END:STEP
    #[arg(long, value_name = "START:END:STEP", conflicts_with = "preset")]
    pub sweep: Option<SweepRange>,

    /// Run a fixed list of shapes
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,
}

fn count(name: &str, value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| BenchError::Config(format!("{} must not be negative, got {}", name, value)))
}

impl Args {
    /// Every configuration this invocation should run, in order.
    pub fn plan(&self) -> Result<Vec<BenchmarkConfig>> {
        let warmup = count("warmup", self.warmup)?;
        let iterations = count("iter", self.iter)?;
        let shapes = if let Some(sweep) = &self.sweep {
            sweep.shmoo()
        } else if let Some(preset) = self.preset {
            preset.shapes().to_vec()
        } else {
            vec![(count("m", self.m)?, count("n", self.n)?, count("k", self.k)?)]
        };
        shapes
            .into_iter()
            .map(|(m, n, k)| BenchmarkConfig::new(m, n, k, warmup, iterations))
            .collect()
    }

    pub fn setup_options(&self) -> SetupOptions {
        SetupOptions {
            seed: self.seed,
            verify: !self.no_verify,
        }
    }
}
