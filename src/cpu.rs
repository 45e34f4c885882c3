//! Host reference backend: f16 storage in host memory, f32 GEMM through
//! `matrixmultiply`.
use crate::backend::{Backend, DeviceMatrix, GemmProblem, HostTimer, MatrixRole, MatrixShape};
use crate::error::{BenchError, Result};
use half::{f16, slice::HalfFloatSliceExt};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

#[derive(Debug)]
pub struct HostMatrix {
    shape: MatrixShape,
    data: Vec<f16>,
}

impl HostMatrix {
    pub fn as_slice(&self) -> &[f16] {
        &self.data
    }
}

impl DeviceMatrix for HostMatrix {
    fn shape(&self) -> MatrixShape {
        self.shape
    }
}

/// f32 copies of A and B taken when the handle is bound, plus the f32
/// accumulator for C.
#[derive(Debug)]
pub struct Workspace {
    problem: GemmProblem,
    a: Vec<f32>,
    b: Vec<f32>,
    c: Vec<f32>,
}

fn check_len(problem: &GemmProblem, role: MatrixRole, matrix: &HostMatrix) -> Result<()> {
    let expected = problem.shape(role).elements();
    if matrix.data.len() != expected {
        return Err(BenchError::Backend(format!(
            "matrix {} holds {} elements, problem needs {}",
            role,
            matrix.data.len(),
            expected
        )));
    }
    Ok(())
}

fn zeroed(shape: MatrixShape) -> Result<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(shape.elements())
        .map_err(|e| BenchError::Allocation {
            role: shape.role,
            bytes: (shape.elements() * std::mem::size_of::<f32>()) as u64,
            reason: e.to_string(),
        })?;
    buf.resize(shape.elements(), 0.0);
    Ok(buf)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    type Matrix = HostMatrix;
    type Handle = Workspace;
    type Timer = HostTimer;

    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn allocate(&self, shape: MatrixShape) -> Result<HostMatrix> {
        let mut data = Vec::new();
        data.try_reserve_exact(shape.elements())
            .map_err(|e| BenchError::Allocation {
                role: shape.role,
                bytes: shape.bytes(),
                reason: e.to_string(),
            })?;
        data.resize(shape.elements(), f16::ZERO);
        Ok(HostMatrix { shape, data })
    }

    fn fill_uniform(&self, matrix: &mut HostMatrix, seed: u64) -> Result<()> {
        let between = Uniform::new_inclusive(-1.0f32, 1.0f32);
        let rng = StdRng::seed_from_u64(seed);
        for (slot, value) in matrix.data.iter_mut().zip(rng.sample_iter(between)) {
            *slot = f16::from_f32(value);
        }
        Ok(())
    }

    fn read_back(&self, matrix: &HostMatrix) -> Result<Vec<f16>> {
        Ok(matrix.data.clone())
    }

    fn create_handle(
        &self,
        problem: &GemmProblem,
        a: &HostMatrix,
        b: &HostMatrix,
        c: &HostMatrix,
    ) -> Result<Workspace> {
        for (role, matrix) in [(MatrixRole::A, a), (MatrixRole::B, b), (MatrixRole::C, c)] {
            check_len(problem, role, matrix)?;
        }
        let mut workspace = Workspace {
            problem: *problem,
            a: zeroed(problem.shape(MatrixRole::A))?,
            b: zeroed(problem.shape(MatrixRole::B))?,
            c: zeroed(problem.shape(MatrixRole::C))?,
        };
        // operands are fixed once filled
        a.data.convert_to_f32_slice(&mut workspace.a);
        b.data.convert_to_f32_slice(&mut workspace.b);
        Ok(workspace)
    }

    fn gemm(
        &self,
        handle: &mut Workspace,
        _a: &HostMatrix,
        _b: &HostMatrix,
        c: &mut HostMatrix,
    ) -> Result<()> {
        let problem = handle.problem;
        check_len(&problem, MatrixRole::C, c)?;
        if problem.beta != 0.0 {
            c.data.convert_to_f32_slice(&mut handle.c);
        }
        let (rsa, csa) = problem.strides(MatrixRole::A);
        let (rsb, csb) = problem.strides(MatrixRole::B);
        let (rsc, csc) = problem.strides(MatrixRole::C);
        // SAFETY: the strides address exactly m×k, k×n and m×n elements,
        // which the workspace vectors hold by construction.
        unsafe {
            matrixmultiply::sgemm(
                problem.m,
                problem.k,
                problem.n,
                problem.alpha,
                handle.a.as_ptr(),
                rsa as isize,
                csa as isize,
                handle.b.as_ptr(),
                rsb as isize,
                csb as isize,
                problem.beta,
                handle.c.as_mut_ptr(),
                rsc as isize,
                csc as isize,
            );
        }
        c.data.convert_from_f32_slice(&handle.c);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn create_timer(&self) -> Result<HostTimer> {
        Ok(HostTimer::new())
    }
}
