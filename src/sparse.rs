//! Sparse refinement: re-solve the problem over evolving column subsets and
//! keep the best-scoring one.
//!
//! The wrapper owns a fitted decomposition method over a "master" column
//! set. On `solve` it hands the method to an external basis-sequence search,
//! scores every visited sub-basis with a caller-supplied fitting criterion,
//! tracks the minimum, then restores the method and returns the best
//! sub-basis coefficients scattered over the master basis (zero for columns
//! the search did not select).

use std::rc::Rc;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::SolverError;
use crate::method::LeastSquaresMethod;
use crate::proxy::DesignProxy;

/// Contract for the external search that proposes candidate sub-bases.
///
/// `advance` mutates the wrapped method's active columns through `update`
/// (or `reset_indices` for non-monotonic moves); the wrapper never inspects
/// how candidates are generated.
pub trait BasisSequenceSearch {
    fn initialize(
        &mut self,
        method: &mut dyn LeastSquaresMethod,
        target: &Array1<f64>,
    ) -> Result<(), SolverError>;

    /// Whether the search still has additions or removals to propose.
    fn has_pending(&self) -> bool;

    fn advance(&mut self, method: &mut dyn LeastSquaresMethod) -> Result<(), SolverError>;
}

/// Caller-supplied fitting/error criterion evaluated at each sub-basis.
pub type FittingCriterion =
    dyn FnMut(&mut dyn LeastSquaresMethod, &Array1<f64>) -> Result<f64, SolverError>;

/// Stopping-policy knobs for the sub-basis search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SparseSettings {
    /// Stop once the current error exceeds this multiple of the best error
    /// seen so far. Must be >= 1.
    pub maximum_error_factor: f64,
    /// Stop once the best error drops below this value. The default of zero
    /// never triggers (fit errors are non-negative).
    pub error_threshold: f64,
}

impl Default for SparseSettings {
    fn default() -> Self {
        Self {
            maximum_error_factor: 1.1,
            error_threshold: 0.0,
        }
    }
}

pub struct SparseRefinement<S: BasisSequenceSearch> {
    method: Box<dyn LeastSquaresMethod>,
    search: S,
    criterion: Box<FittingCriterion>,
    settings: SparseSettings,
}

impl<S: BasisSequenceSearch> SparseRefinement<S> {
    pub fn new(
        method: Box<dyn LeastSquaresMethod>,
        search: S,
        criterion: Box<FittingCriterion>,
        settings: SparseSettings,
    ) -> Result<Self, SolverError> {
        if settings.maximum_error_factor < 1.0 {
            return Err(SolverError::InvalidArgument(format!(
                "maximum error factor must be >= 1, got {}",
                settings.maximum_error_factor
            )));
        }
        Ok(Self {
            method,
            search,
            criterion,
            settings,
        })
    }

    /// Drive the search, scoring every visited sub-basis. Returns the
    /// best-scoring index set. Stopping policy, checked in this exact order
    /// at every step: strictly improving errors are accepted and the search
    /// continues; an error above `maximum_error_factor * best` stops it; a
    /// best error below `error_threshold` stops it; otherwise continue.
    fn run_search(&mut self, rhs: &Array1<f64>) -> Result<Vec<usize>, SolverError> {
        self.search.initialize(self.method.as_mut(), rhs)?;
        let mut best_error = f64::INFINITY;
        let mut best_indices = self.method.current_indices().to_vec();

        while self.search.has_pending() {
            let error = (self.criterion)(self.method.as_mut(), rhs)?;
            if error < best_error {
                best_error = error;
                best_indices = self.method.current_indices().to_vec();
            } else if error > self.settings.maximum_error_factor * best_error {
                log::info!(
                    "sub-basis search stopped: error {error:.6e} exceeds {} x best {best_error:.6e}",
                    self.settings.maximum_error_factor
                );
                break;
            } else if !(best_error >= self.settings.error_threshold) {
                log::info!(
                    "sub-basis search stopped: best error {best_error:.6e} is below threshold {:.6e}",
                    self.settings.error_threshold
                );
                break;
            }
            self.search.advance(self.method.as_mut())?;
        }

        log::info!(
            "sub-basis search kept {} of the candidate columns (best error {best_error:.6e})",
            best_indices.len()
        );
        Ok(best_indices)
    }
}

impl<S: BasisSequenceSearch> LeastSquaresMethod for SparseRefinement<S> {
    fn proxy(&self) -> &Rc<DesignProxy> {
        self.method.proxy()
    }

    fn current_indices(&self) -> &[usize] {
        self.method.current_indices()
    }

    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row_update: bool,
    ) -> Result<(), SolverError> {
        self.method.update(added, conserved, removed, row_update)
    }

    fn reset_indices(&mut self, indices: &[usize]) -> Result<(), SolverError> {
        self.method.reset_indices(indices)
    }

    fn trash_decomposition(&mut self) {
        self.method.trash_decomposition();
    }

    /// Search for the best sub-basis and return its coefficients expressed
    /// over the master basis (the wrapped method's index set at call time),
    /// with zeros for unselected columns. The wrapped method is restored to
    /// the master set on every exit path.
    fn solve(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        let master = self.method.current_indices().to_vec();

        let best_indices = match self.run_search(rhs) {
            Ok(best) => best,
            Err(e) => {
                let _ = self.method.reset_indices(&master);
                return Err(e);
            }
        };

        self.method.reset_indices(&best_indices)?;
        let sub_coeffs = match self.method.solve(rhs) {
            Ok(coeffs) => coeffs,
            Err(e) => {
                let _ = self.method.reset_indices(&master);
                return Err(e);
            }
        };
        self.method.reset_indices(&master)?;

        let mut full = Array1::zeros(master.len());
        for (pos, idx) in best_indices.iter().enumerate() {
            match master.iter().position(|m| m == idx) {
                Some(slot) => full[slot] = sub_coeffs[pos],
                None => log::warn!(
                    "search selected column {idx} which is not part of the master basis; dropping it"
                ),
            }
        }
        Ok(full)
    }

    fn solve_normal(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        self.method.solve_normal(rhs)
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        self.method.gram_inverse()
    }

    fn gram_inverse_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.method.gram_inverse_diag()
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        self.method.gram_inverse_trace()
    }

    fn hat(&mut self) -> Result<Array2<f64>, SolverError> {
        self.method.hat()
    }

    fn hat_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.method.hat_diag()
    }
}

/// Corrected leave-one-out error: the mean squared leave-one-out residual,
/// inflated by the usual small-sample complexity correction
/// `(1 + trace((Psi^T Psi)^-1)) * n / (n - p)`.
///
/// Suitable as the fitting criterion for [`SparseRefinement`]; an empty
/// basis is scored as the raw target energy (no division by zero).
pub fn corrected_leave_one_out(
    method: &mut dyn LeastSquaresMethod,
    target: &Array1<f64>,
) -> Result<f64, SolverError> {
    let coeffs = method.solve(target)?;
    let indices = method.current_indices().to_vec();
    let proxy = method.proxy().clone();

    let b = crate::method::weighted_rhs(&proxy, target)?;
    let psi = proxy.compute_weighted_design(&indices);
    let fitted = psi.dot(&coeffs);
    let leverage = method.hat_diag()?;

    let n = b.len();
    let p = indices.len();
    let mut sum = 0.0;
    for i in 0..n {
        let denom = 1.0 - leverage[i];
        if denom <= f64::EPSILON {
            // An interpolated observation makes LOO meaningless; score the
            // sub-basis as unusable rather than dividing by ~zero.
            return Ok(f64::INFINITY);
        }
        let residual = (b[i] - fitted[i]) / denom;
        sum += residual * residual;
    }
    let loo = sum / n as f64;

    if n <= p {
        return Ok(f64::INFINITY);
    }
    let trace = method.gram_inverse_trace()?;
    let correction = (1.0 + trace) * n as f64 / (n - p) as f64;
    Ok(loo * correction)
}
