//! Cholesky decomposition method.
//!
//! Maintains the lower factor `L` of the weighted Gram matrix
//! `G = Psi^T Psi = L L^T` over the active columns and rows. This is the
//! only method with genuinely incremental paths: a single-column basis
//! extension appends one row to `L`, and row changes are applied as one
//! rank-1 update per added observation followed by one rank-1 downdate per
//! removed observation (adds first: they can only improve definiteness,
//! which keeps the factor safe going into the riskier downdates).
//!
//! Every incremental path has a full-refactorization fallback; numerical
//! trouble on those paths is logged and recovered, never raised.

use std::rc::Rc;

use ndarray::{Array1, Array2, s};

use crate::error::SolverError;
use crate::faer_ndarray::FaerCholesky;
use crate::method::{self, LeastSquaresMethod, MethodSettings};
use crate::proxy::DesignProxy;
use crate::triangular;

pub struct CholeskyMethod {
    proxy: Rc<DesignProxy>,
    current_indices: Vec<usize>,
    settings: MethodSettings,
    /// Lower factor of the weighted Gram matrix; `None` means stale.
    lower: Option<Array2<f64>>,
}

impl CholeskyMethod {
    pub fn new(
        proxy: Rc<DesignProxy>,
        indices: Vec<usize>,
        settings: MethodSettings,
    ) -> Result<Self, SolverError> {
        method::validate_columns(&proxy, &indices)?;
        let current_indices = method::merged_indices(&indices, &[])?;
        Ok(Self {
            proxy,
            current_indices,
            settings,
            lower: None,
        })
    }

    fn full_factorize(&mut self) -> Result<(), SolverError> {
        if self.current_indices.is_empty() {
            self.lower = Some(Array2::zeros((0, 0)));
            return Ok(());
        }
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let gram = psi.t().dot(&psi);
        self.lower = Some(gram.cholesky_lower()?);
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), SolverError> {
        if self.lower.is_none() {
            self.full_factorize()?;
        }
        Ok(())
    }

    /// Extend the factor by one column. Returns `Ok(None)` when the new
    /// diagonal pivot would not be strictly positive (linearly dependent or
    /// numerically degenerate column), in which case the caller refactors.
    fn extend_one_column(
        &self,
        lower: &Array2<f64>,
        new_column: usize,
    ) -> Result<Option<Array2<f64>>, SolverError> {
        let existing = self.proxy.compute_weighted_design(&self.current_indices);
        let added = self.proxy.compute_weighted_design(&[new_column]);
        let x = added.column(0);

        let diag = x.dot(&x);
        let cross = existing.t().dot(&x);
        let r = triangular::solve_lower(lower.view(), cross.view())?;
        let rk_sq = r.dot(&r);

        let pivot_sq = diag - rk_sq;
        if !(pivot_sq > 0.0) || !pivot_sq.is_finite() {
            return Ok(None);
        }

        let k = lower.nrows();
        let mut extended = Array2::zeros((k + 1, k + 1));
        extended.slice_mut(s![..k, ..k]).assign(lower);
        for j in 0..k {
            extended[(k, j)] = r[j];
        }
        extended[(k, k)] = pivot_sq.sqrt();
        Ok(Some(extended))
    }

    fn update_columns(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
    ) -> Result<(), SolverError> {
        if !removed.is_empty() {
            return Err(SolverError::NotYetImplemented(
                "column removal under the Cholesky method; reassign via reset_indices or use the QR/SVD methods"
                    .into(),
            ));
        }
        let merged = method::merged_indices(conserved, added)?;
        method::validate_columns(&self.proxy, &merged)?;
        if merged == self.current_indices && self.lower.is_some() {
            return Ok(());
        }

        // Incremental extension only applies when the existing factor
        // matches the conserved prefix exactly and the basis is large enough
        // for the bookkeeping to pay off.
        let incremental = added.len() == 1
            && conserved == self.current_indices.as_slice()
            && merged.len() >= self.settings.small_basis_threshold;
        if incremental {
            if let Some(existing) = self.lower.take() {
                if let Some(extended) = self.extend_one_column(&existing, added[0])? {
                    self.current_indices = merged;
                    self.lower = Some(extended);
                    return Ok(());
                }
                log::info!(
                    "incremental Cholesky extension with column {} rejected (non-positive pivot); refactorizing {} columns",
                    added[0],
                    merged.len()
                );
            }
        }

        self.current_indices = merged;
        self.lower = None;
        self.full_factorize()
    }

    fn update_rows(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
    ) -> Result<(), SolverError> {
        method::validate_rows(&self.proxy, added)?;
        method::validate_rows(&self.proxy, conserved)?;
        method::validate_rows(&self.proxy, removed)?;
        let new_rows = method::merged_indices(conserved, added)?;

        if conserved.is_empty() {
            // Full replacement of the active row set: nothing to reuse.
            self.proxy.set_row_filter(&new_rows);
            self.lower = None;
            return self.full_factorize();
        }
        let Some(mut lower) = self.lower.take() else {
            self.proxy.set_row_filter(&new_rows);
            return self.full_factorize();
        };

        // Row contribution vectors come from the unfiltered weighted design.
        let whole = {
            let _guard = self.proxy.whole_rows();
            self.proxy.compute_weighted_design(&self.current_indices)
        };

        for &row in added {
            let mut v = whole.row(row).to_owned();
            if let Err(failure) = triangular::cholupdate(&mut lower, &mut v) {
                log::warn!(
                    "rank-1 update for added row {row} failed at pivot {}; refactorizing over {} rows",
                    failure.index,
                    new_rows.len()
                );
                self.proxy.set_row_filter(&new_rows);
                return self.full_factorize();
            }
        }
        for &row in removed {
            let mut v = whole.row(row).to_owned();
            if let Err(failure) = triangular::choldowndate(&mut lower, &mut v) {
                log::warn!(
                    "rank-1 downdate for removed row {row} lost positive definiteness at pivot {}; refactorizing over {} rows",
                    failure.index,
                    new_rows.len()
                );
                self.proxy.set_row_filter(&new_rows);
                return self.full_factorize();
            }
        }

        self.proxy.set_row_filter(&new_rows);
        self.lower = Some(lower);
        Ok(())
    }
}

impl LeastSquaresMethod for CholeskyMethod {
    fn proxy(&self) -> &Rc<DesignProxy> {
        &self.proxy
    }

    fn current_indices(&self) -> &[usize] {
        &self.current_indices
    }

    fn update(
        &mut self,
        added: &[usize],
        conserved: &[usize],
        removed: &[usize],
        row_update: bool,
    ) -> Result<(), SolverError> {
        if added.is_empty() && removed.is_empty() {
            return self.refresh();
        }
        if row_update {
            self.update_rows(added, conserved, removed)
        } else {
            self.update_columns(added, conserved, removed)
        }
    }

    fn reset_indices(&mut self, indices: &[usize]) -> Result<(), SolverError> {
        method::validate_columns(&self.proxy, indices)?;
        let merged = method::merged_indices(indices, &[])?;
        self.current_indices = merged;
        self.lower = None;
        Ok(())
    }

    fn trash_decomposition(&mut self) {
        self.lower = None;
    }

    fn solve(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let b = method::weighted_rhs(&self.proxy, rhs)?;
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let c = psi.t().dot(&b);
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let y = triangular::solve_lower(lower.view(), c.view())?;
        triangular::solve_upper(lower.t(), y.view())
    }

    fn solve_normal(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        if rhs.len() != self.current_indices.len() {
            return Err(SolverError::InvalidArgument(format!(
                "normal-equation right-hand side has {} entries but the basis has {} columns",
                rhs.len(),
                self.current_indices.len()
            )));
        }
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let y = triangular::solve_lower(lower.view(), rhs.view())?;
        triangular::solve_upper(lower.t(), y.view())
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let inv = triangular::invert_lower(lower.view())?;
        Ok(inv.t().dot(&inv))
    }

    fn gram_inverse_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let inv = triangular::invert_lower(lower.view())?;
        let k = inv.ncols();
        Ok(Array1::from_shape_fn(k, |j| {
            inv.column(j).iter().map(|v| v * v).sum()
        }))
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let inv = triangular::invert_lower(lower.view())?;
        Ok(inv.iter().map(|v| v * v).sum())
    }

    fn hat(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let m = triangular::solve_lower_mat(lower.view(), psi.t())?;
        Ok(m.t().dot(&m))
    }

    fn hat_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let lower = self.lower.as_ref().ok_or_else(method::stale_decomposition)?;
        let m = triangular::solve_lower_mat(lower.view(), psi.t())?;
        let n = m.ncols();
        Ok(Array1::from_shape_fn(n, |i| {
            m.column(i).iter().map(|v| v * v).sum()
        }))
    }
}
