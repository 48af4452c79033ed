use thiserror::Error;

use crate::faer_ndarray::FaerLinalgError;

/// Error type shared by every decomposition method.
///
/// Numerical trouble on the incremental paths (downdate losing positive
/// definiteness, a non-positive extension pivot) is deliberately *not*
/// represented here: those cases are recovered internally by falling back to
/// a full refactorization and never cross the `update()` boundary.
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not yet implemented: {0}")]
    NotYetImplemented(String),

    #[error("dense factorization kernel failed: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("triangular solve encountered a zero pivot at row {index}")]
    SingularTriangularSystem { index: usize },
}
