use clap::Parser;
use gemm_bench::config::{Args, BackendKind};
use gemm_bench::cpu::CpuBackend;
use gemm_bench::error::Result;
use gemm_bench::gpu::GpuBackend;
use std::io;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("gemm-bench: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run(args: &Args) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.backend {
        BackendKind::Gpu => gemm_bench::run(args, GpuBackend::new, &mut out),
        BackendKind::Cpu => gemm_bench::run(args, || Ok(CpuBackend::new()), &mut out),
    }
}
