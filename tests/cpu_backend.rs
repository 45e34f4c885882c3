use gemm_bench::backend::{Backend, GemmProblem, MatrixRole};
use gemm_bench::config::{BenchmarkConfig, SetupOptions};
use gemm_bench::cpu::CpuBackend;
use gemm_bench::generator;
use gemm_bench::runner::OperationRunner;
use gemm_bench::timing;
use half::f16;

/// `C[i + j*m] = sum_l A[l + i*k] * B[l + j*k]` in f32.
fn reference(a: &[f16], b: &[f16], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for j in 0..n {
        for i in 0..m {
            c[i + j * m] = (0..k)
                .map(|l| a[l + i * k].to_f32() * b[l + j * k].to_f32())
                .sum();
        }
    }
    c
}

fn assert_close(actual: &[f16], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (index, (got, want)) in actual.iter().zip(expected).enumerate() {
        let got = got.to_f32();
        let tolerance = 1e-2 + want.abs() * 2e-3;
        assert!(
            (got - want).abs() <= tolerance,
            "element {}: got {}, expected {}",
            index,
            got,
            want
        );
    }
}

#[test]
fn runner_matches_reference_gemm() {
    let backend = CpuBackend::new();
    let (m, n, k) = (13, 7, 29);
    let config = BenchmarkConfig::new(m, n, k, 0, 1).unwrap();
    let mut runner = OperationRunner::setup(&backend, &config, &SetupOptions::default()).unwrap();
    runner.execute().unwrap();
    runner.synchronize().unwrap();

    let a = runner.read(MatrixRole::A).unwrap();
    let b = runner.read(MatrixRole::B).unwrap();
    let c = runner.read(MatrixRole::C).unwrap();
    assert_close(&c, &reference(&a, &b, m, n, k));
}

#[test]
fn output_ignores_previous_contents_of_c() {
    let backend = CpuBackend::new();
    let problem = GemmProblem::new(6, 5, 4);
    let mut a = backend.allocate(problem.shape(MatrixRole::A)).unwrap();
    let mut b = backend.allocate(problem.shape(MatrixRole::B)).unwrap();
    let mut clean = backend.allocate(problem.shape(MatrixRole::C)).unwrap();
    let mut dirty = backend.allocate(problem.shape(MatrixRole::C)).unwrap();
    generator::fill(&backend, &mut a, 1).unwrap();
    generator::fill(&backend, &mut b, 2).unwrap();
    generator::fill(&backend, &mut dirty, 3).unwrap();

    let mut handle = backend.create_handle(&problem, &a, &b, &clean).unwrap();
    backend.gemm(&mut handle, &a, &b, &mut clean).unwrap();
    backend.gemm(&mut handle, &a, &b, &mut dirty).unwrap();
    assert_eq!(clean.as_slice(), dirty.as_slice());

    // again, on top of its own output
    backend.gemm(&mut handle, &a, &b, &mut clean).unwrap();
    assert_eq!(clean.as_slice(), dirty.as_slice());
}

#[test]
fn inputs_are_reproducible_across_runners() {
    let backend = CpuBackend::new();
    let config = BenchmarkConfig::new(9, 11, 17, 0, 1).unwrap();
    let options = SetupOptions::default();
    let first = OperationRunner::setup(&backend, &config, &options).unwrap();
    let second = OperationRunner::setup(&backend, &config, &options).unwrap();
    for role in [MatrixRole::A, MatrixRole::B] {
        let left: Vec<u16> = first.read(role).unwrap().iter().map(|v| v.to_bits()).collect();
        let right: Vec<u16> = second.read(role).unwrap().iter().map(|v| v.to_bits()).collect();
        assert_eq!(left, right);
    }
}

#[test]
fn generated_inputs_stay_in_range() {
    let backend = CpuBackend::new();
    let config = BenchmarkConfig::new(64, 48, 80, 0, 1).unwrap();
    let runner = OperationRunner::setup(&backend, &config, &SetupOptions::default()).unwrap();
    let (a, b) = runner.input_ranges().unwrap();
    assert!(a.is_clean() && b.is_clean());
    assert_eq!(a.checked, 64 * 80);
    assert_eq!(b.checked, 80 * 48);
}

#[test]
fn full_benchmark_produces_finite_figures() {
    let backend = CpuBackend::new();
    let config = BenchmarkConfig::new(32, 32, 32, 2, 4).unwrap();
    let measurement = gemm_bench::benchmark(&backend, &config, &SetupOptions::default()).unwrap();
    assert!(measurement.average_us.is_finite());
    assert!(measurement.sample.elapsed_ms > 0.0);

    let line = measurement.to_string();
    let fields: Vec<&str> = line.split('\t').collect();
    assert_eq!(fields.len(), 6);
    assert_eq!(&fields[..4], &["32", "32", "32", "1"]);
}

#[test]
fn repeated_execute_keeps_result() {
    let backend = CpuBackend::new();
    let config = BenchmarkConfig::new(5, 4, 3, 0, 1).unwrap();
    let mut runner = OperationRunner::setup(&backend, &config, &SetupOptions::default()).unwrap();
    runner.execute().unwrap();
    let once = runner.read(MatrixRole::C).unwrap();
    timing::warmup(&mut runner, 7).unwrap();
    assert_eq!(runner.read(MatrixRole::C).unwrap(), once);
}
