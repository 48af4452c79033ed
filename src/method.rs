//! Common contract implemented by every decomposition method.

use std::rc::Rc;

use itertools::Itertools;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::cholesky::CholeskyMethod;
use crate::error::SolverError;
use crate::proxy::DesignProxy;
use crate::qr::QrMethod;
use crate::svd::SvdMethod;

/// Tuning knobs shared by the decomposition methods.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MethodSettings {
    /// Basis sizes below this always refactor fully on column addition; the
    /// incremental extension only pays off once the factor is large enough.
    pub small_basis_threshold: usize,
}

impl Default for MethodSettings {
    fn default() -> Self {
        Self {
            small_basis_threshold: 8,
        }
    }
}

/// A least-squares solver that maintains a factorization of the weighted
/// design (or its Gram matrix) across incremental changes to the active
/// column and row sets.
///
/// State machine: the factorization is either absent ("stale") or exactly
/// consistent with the current indices and row filter. Every query method
/// revalidates first, so receivers are `&mut self` even for conceptually
/// read-only quantities.
pub trait LeastSquaresMethod {
    /// The shared design evaluator this method solves against.
    fn proxy(&self) -> &Rc<DesignProxy>;

    /// Active columns, in insertion order (the column order of the factorization).
    fn current_indices(&self) -> &[usize];

    /// Revise the factorization for a change to the active columns
    /// (`row_update = false`) or active rows (`row_update = true`).
    ///
    /// With `added` and `removed` both empty this is a freshness probe: a
    /// no-op when a factorization exists, a full build otherwise.
    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row_update: bool,
    ) -> Result<(), SolverError>;

    /// Wholesale reassignment of the active columns, discarding the
    /// factorization. Use this for non-monotonic basis changes that no
    /// incremental path covers (e.g. restoring a saved index set).
    fn reset_indices(&mut self, indices: &[usize]) -> Result<(), SolverError>;

    /// Discard the factorization; the next access rebuilds from scratch.
    fn trash_decomposition(&mut self);

    /// Minimize `||Psi a - rhs||^2` over the active columns and rows.
    /// `rhs` has one entry per active row.
    fn solve(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError>;

    /// Solve the normal equations `(Psi^T Psi) a = rhs`, where `rhs` is
    /// already aggregated into Gram space (one entry per active column).
    fn solve_normal(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError>;

    /// `(Psi^T Psi)^-1` as a full symmetric matrix.
    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError>;

    /// Diagonal of the Gram inverse, without materializing the full inverse.
    fn gram_inverse_diag(&mut self) -> Result<Array1<f64>, SolverError>;

    /// Trace of the Gram inverse (model-complexity term in CV criteria).
    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError>;

    /// The hat (projection) matrix `Psi (Psi^T Psi)^-1 Psi^T`.
    fn hat(&mut self) -> Result<Array2<f64>, SolverError>;

    /// Leverage values: the diagonal of the hat matrix, one per active row.
    fn hat_diag(&mut self) -> Result<Array1<f64>, SolverError>;

    /// Per-observation weights of the underlying problem.
    fn weight(&self) -> &Array1<f64> {
        self.proxy().weight()
    }
}

/// Construct a method by name (`"Cholesky"`, `"QR"` or `"SVD"`) behind the
/// common interface.
pub fn build_method(
    name: &str,
    proxy: Rc<DesignProxy>,
    indices: Vec<usize>,
    settings: MethodSettings,
) -> Result<Box<dyn LeastSquaresMethod>, SolverError> {
    match name {
        "Cholesky" => Ok(Box::new(CholeskyMethod::new(proxy, indices, settings)?)),
        "QR" => Ok(Box::new(QrMethod::new(proxy, indices)?)),
        "SVD" => Ok(Box::new(SvdMethod::new(proxy, indices)?)),
        other => Err(SolverError::InvalidArgument(format!(
            "unknown decomposition method `{other}` (expected Cholesky, QR or SVD)"
        ))),
    }
}

/// Merge conserved and added indices into the new active set, rejecting
/// duplicates (order is semantically meaningful and must stay unambiguous).
pub(crate) fn merged_indices(
    conserved: &[usize],
    added: &[usize],
) -> Result<Vec<usize>, SolverError> {
    let merged: Vec<usize> = conserved.iter().chain(added.iter()).copied().collect();
    if let Some(dup) = merged.iter().duplicates().next() {
        return Err(SolverError::InvalidArgument(format!(
            "index {dup} appears more than once in the updated active set"
        )));
    }
    Ok(merged)
}

pub(crate) fn validate_columns(
    proxy: &DesignProxy,
    indices: &[usize],
) -> Result<(), SolverError> {
    for &idx in indices {
        if idx >= proxy.column_count() {
            return Err(SolverError::InvalidArgument(format!(
                "column index {idx} is out of range for a design with {} columns",
                proxy.column_count()
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_rows(proxy: &DesignProxy, indices: &[usize]) -> Result<(), SolverError> {
    for &idx in indices {
        if idx >= proxy.row_count() {
            return Err(SolverError::InvalidArgument(format!(
                "row index {idx} is out of range for a design with {} rows",
                proxy.row_count()
            )));
        }
    }
    Ok(())
}

/// Check the observation-space right-hand side and scale it by the per-row
/// square-root weights when weighting is non-uniform.
pub(crate) fn weighted_rhs(
    proxy: &DesignProxy,
    rhs: &Array1<f64>,
) -> Result<Array1<f64>, SolverError> {
    let rows = proxy.active_rows();
    if rhs.len() != rows.len() {
        return Err(SolverError::InvalidArgument(format!(
            "right-hand side has {} entries but {} rows are active",
            rhs.len(),
            rows.len()
        )));
    }
    if proxy.has_uniform_weight() {
        Ok(rhs.clone())
    } else {
        let weight_sqrt = proxy.weight_sqrt();
        Ok(Array1::from_shape_fn(rows.len(), |i| {
            rhs[i] * weight_sqrt[rows[i]]
        }))
    }
}

/// Raised on the (unreachable after a successful revalidation) paths that
/// read a factorization which is not there.
pub(crate) fn stale_decomposition() -> SolverError {
    SolverError::InvalidArgument(
        "decomposition is stale; update() must succeed before querying".into(),
    )
}
