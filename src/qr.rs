//! QR decomposition method.
//!
//! Stores the economy factors `Q` (active rows x rank) and `R` (rank x
//! columns) of the weighted design. Any non-trivial change to the active
//! columns or rows refactors from scratch; the only thing this method skips
//! is refactoring a set it has already factored. In exchange the hat matrix
//! is simply `Q Q^T` and the Gram inverse comes from `R^-1 R^-T`.

use std::rc::Rc;

use ndarray::{Array1, Array2, s};

use crate::error::SolverError;
use crate::faer_ndarray::FaerQr;
use crate::method::{self, LeastSquaresMethod};
use crate::proxy::DesignProxy;
use crate::triangular;

struct QrFactors {
    q: Array2<f64>,
    r: Array2<f64>,
}

pub struct QrMethod {
    proxy: Rc<DesignProxy>,
    current_indices: Vec<usize>,
    factors: Option<QrFactors>,
}

impl QrMethod {
    pub fn new(proxy: Rc<DesignProxy>, indices: Vec<usize>) -> Result<Self, SolverError> {
        method::validate_columns(&proxy, &indices)?;
        let current_indices = method::merged_indices(&indices, &[])?;
        Ok(Self {
            proxy,
            current_indices,
            factors: None,
        })
    }

    fn full_factorize(&mut self) -> Result<(), SolverError> {
        let n = self.proxy.active_row_count();
        let k = self.current_indices.len();
        if k == 0 {
            self.factors = Some(QrFactors {
                q: Array2::zeros((n, 0)),
                r: Array2::zeros((0, 0)),
            });
            return Ok(());
        }
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let (q_full, r_full) = psi.qr();
        let rank = n.min(k);
        self.factors = Some(QrFactors {
            q: q_full.slice(s![.., ..rank]).to_owned(),
            r: r_full.slice(s![..rank, ..]).to_owned(),
        });
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), SolverError> {
        if self.factors.is_none() {
            self.full_factorize()?;
        }
        Ok(())
    }

    /// The square `R` factor, defined only for determined systems
    /// (active rows >= active columns).
    fn square_r(factors: &QrFactors, basis_size: usize) -> Result<&Array2<f64>, SolverError> {
        if factors.r.nrows() != basis_size {
            return Err(SolverError::InvalidArgument(format!(
                "Gram matrix is singular: {} active rows cannot determine {} columns",
                factors.q.nrows(),
                basis_size
            )));
        }
        Ok(&factors.r)
    }
}

impl LeastSquaresMethod for QrMethod {
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
            method::validate_rows(&self.proxy, added)?;
            method::validate_rows(&self.proxy, conserved)?;
            let new_rows = method::merged_indices(conserved, added)?;
            self.proxy.set_row_filter(&new_rows);
            self.factors = None;
            self.full_factorize()
        } else {
            let merged = method::merged_indices(conserved, added)?;
            method::validate_columns(&self.proxy, &merged)?;
            if removed.iter().any(|r| merged.contains(r)) {
                return Err(SolverError::InvalidArgument(
                    "a removed column also appears in the conserved or added set".into(),
                ));
            }
            if merged == self.current_indices && self.factors.is_some() {
                return Ok(());
            }
            self.current_indices = merged;
            self.factors = None;
            self.full_factorize()
        }
    }

    fn reset_indices(&mut self, indices: &[usize]) -> Result<(), SolverError> {
        method::validate_columns(&self.proxy, indices)?;
        let merged = method::merged_indices(indices, &[])?;
        self.current_indices = merged;
        self.factors = None;
        Ok(())
    }

    fn trash_decomposition(&mut self) {
        self.factors = None;
    }

    fn solve(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let b = method::weighted_rhs(&self.proxy, rhs)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let c = factors.q.t().dot(&b);
        let rank = factors.r.nrows();
        let r_square = factors.r.slice(s![.., ..rank]);
        let y = triangular::solve_upper(r_square, c.view())?;
        let mut coeffs = Array1::zeros(k);
        coeffs.slice_mut(s![..rank]).assign(&y);
        Ok(coeffs)
    }

    fn solve_normal(&mut self, rhs: &Array1<f64>) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        if rhs.len() != k {
            return Err(SolverError::InvalidArgument(format!(
                "normal-equation right-hand side has {} entries but the basis has {k} columns",
                rhs.len()
            )));
        }
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let r = Self::square_r(factors, k)?;
        let y = triangular::solve_lower(r.t(), rhs.view())?;
        triangular::solve_upper(r.view(), y.view())
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let r = Self::square_r(factors, k)?;
        let r_inv = triangular::invert_upper(r.view())?;
        Ok(r_inv.dot(&r_inv.t()))
    }

    fn gram_inverse_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let r = Self::square_r(factors, k)?;
        let r_inv = triangular::invert_upper(r.view())?;
        Ok(Array1::from_shape_fn(k, |j| {
            r_inv.row(j).iter().map(|v| v * v).sum()
        }))
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let r = Self::square_r(factors, k)?;
        let r_inv = triangular::invert_upper(r.view())?;
        Ok(r_inv.iter().map(|v| v * v).sum())
    }

    fn hat(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        // Economy form: H = Q Q^T, no Gram inverse needed.
        Ok(factors.q.dot(&factors.q.t()))
    }

    fn hat_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let n = factors.q.nrows();
        Ok(Array1::from_shape_fn(n, |i| {
            factors.q.row(i).iter().map(|v| v * v).sum()
        }))
    }
}
