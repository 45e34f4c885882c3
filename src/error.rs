use crate::backend::MatrixRole;
use thiserror::Error;

/// Everything that can stop a benchmark run.
///
/// Range violations in generated inputs are not errors; they are logged by
/// [`crate::generator::verify`] and the run continues.
#[derive(Debug, Clone, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no suitable GPU adapter found")]
    NoAdapter,

    #[error("failed to request device: {0}")]
    DeviceRequest(String),

    #[error("allocation of {bytes} bytes for matrix {role} failed: {reason}")]
    Allocation {
        role: MatrixRole,
        bytes: u64,
        reason: String,
    },

    #[error("gemm backend failure: {0}")]
    Backend(String),

    #[error("buffer mapping failed: {0}")]
    BufferMap(String),

    #[error("timer failure: {0}")]
    Timer(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl BenchError {
    /// Process exit status for this error. Configuration errors are kept
    /// apart from runtime failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Config(_) => 2,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        BenchError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
