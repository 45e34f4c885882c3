//! These tests need a wgpu adapter and return early without one.
use gemm_bench::backend::{Backend, MatrixRole};
use gemm_bench::config::{BenchmarkConfig, SetupOptions};
use gemm_bench::gpu::GpuBackend;
use gemm_bench::runner::OperationRunner;
use gemm_bench::timing;
use half::f16;

fn backend() -> Option<GpuBackend> {
    match GpuBackend::new() {
        Ok(backend) => Some(backend),
        Err(err) => {
            eprintln!("skipping GPU test: {}", err);
            None
        }
    }
}

#[test]
fn odd_shapes_match_host_reference() {
    let Some(backend) = backend() else { return };
    // odd sizes put element pairs across column boundaries
    let (m, n, k) = (7, 5, 9);
    let config = BenchmarkConfig::new(m, n, k, 0, 1).unwrap();
    let mut runner = OperationRunner::setup(&backend, &config, &SetupOptions::default()).unwrap();
    runner.execute().unwrap();
    runner.synchronize().unwrap();

    let a = runner.read(MatrixRole::A).unwrap();
    let b = runner.read(MatrixRole::B).unwrap();
    let c = runner.read(MatrixRole::C).unwrap();
    assert_eq!(c.len(), m * n);
    for j in 0..n {
        for i in 0..m {
            let want: f32 = (0..k)
                .map(|l| a[l + i * k].to_f32() * b[l + j * k].to_f32())
                .sum();
            let got = c[i + j * m].to_f32();
            assert!(
                (got - want).abs() <= 1e-2 + want.abs() * 2e-3,
                "C[{}, {}]: got {}, expected {}",
                i,
                j,
                got,
                want
            );
        }
    }
}

#[test]
fn device_fill_is_deterministic_and_bounded() {
    let Some(backend) = backend() else { return };
    let config = BenchmarkConfig::new(33, 17, 65, 0, 1).unwrap();
    let options = SetupOptions::default();
    let first = OperationRunner::setup(&backend, &config, &options).unwrap();
    let second = OperationRunner::setup(&backend, &config, &options).unwrap();

    let (a, b) = first.input_ranges().unwrap();
    assert!(a.is_clean() && b.is_clean());
    let left: Vec<u16> = first.read(MatrixRole::A).unwrap().iter().map(|v| v.to_bits()).collect();
    let right: Vec<u16> = second.read(MatrixRole::A).unwrap().iter().map(|v| v.to_bits()).collect();
    assert_eq!(left, right);
    assert!(left.iter().any(|&bits| bits != left[0]));
}

#[test]
fn measurement_on_device() {
    let Some(backend) = backend() else { return };
    let config = BenchmarkConfig::new(64, 64, 64, 2, 3).unwrap();
    let mut runner = OperationRunner::setup(&backend, &config, &SetupOptions::default()).unwrap();
    let measurement = timing::measure(&mut runner).unwrap();
    assert!(measurement.sample.elapsed_ms > 0.0);
    assert!(measurement.average_us.is_finite());
    let c = runner.read(MatrixRole::C).unwrap();
    assert!(c.iter().all(|v: &f16| v.is_finite()));
    assert!(backend.synchronize().is_ok());
}
