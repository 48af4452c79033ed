//! Design evaluator: weighted design extraction over active column and row
//! subsets.
//!
//! `DesignProxy` owns the master design matrix (rows = observations, columns
//! = basis functions) together with the per-observation weights. The
//! decomposition methods hold a shared `Rc<DesignProxy>` and ask it for the
//! weighted design restricted to whichever columns and rows are currently
//! active. The active-row filter is interior-mutable state: row updates
//! install a new filter, and the incremental paths temporarily need the
//! unfiltered view to extract the rows being added or removed.
//!
//! Single-threaded by contract; the `RefCell` is not `Sync` on purpose.

use std::cell::RefCell;

use ndarray::{Array1, Array2};

use crate::error::SolverError;

#[derive(Debug)]
pub struct DesignProxy {
    design: Array2<f64>,
    weight: Array1<f64>,
    weight_sqrt: Array1<f64>,
    uniform_weight: bool,
    /// Active observation rows; empty means all rows.
    row_filter: RefCell<Vec<usize>>,
}

impl DesignProxy {
    /// Wrap a master design matrix with optional per-row weights.
    ///
    /// `None` (or an all-equal weight vector) means uniform weighting, in
    /// which case every weighting multiplication downstream is skipped.
    pub fn new(design: Array2<f64>, weights: Option<Array1<f64>>) -> Result<Self, SolverError> {
        let rows = design.nrows();
        let (weight, uniform_weight) = match weights {
            Some(weight) => {
                if weight.len() != rows {
                    return Err(SolverError::InvalidArgument(format!(
                        "weight vector has {} entries but the design has {} rows",
                        weight.len(),
                        rows
                    )));
                }
                if weight.iter().any(|&w| w < 0.0 || !w.is_finite()) {
                    return Err(SolverError::InvalidArgument(
                        "weights must be finite and non-negative".into(),
                    ));
                }
                let uniform = rows == 0 || weight.iter().all(|&w| w == weight[0]);
                (weight, uniform)
            }
            None => (Array1::ones(rows), true),
        };
        let weight_sqrt = weight.mapv(f64::sqrt);
        Ok(Self {
            design,
            weight,
            weight_sqrt,
            uniform_weight,
            row_filter: RefCell::new(Vec::new()),
        })
    }

    /// Total number of observations in the master design.
    pub fn row_count(&self) -> usize {
        self.design.nrows()
    }

    /// Number of basis functions in the master design.
    pub fn column_count(&self) -> usize {
        self.design.ncols()
    }

    /// Number of currently active rows.
    pub fn active_row_count(&self) -> usize {
        let filter = self.row_filter.borrow();
        if filter.is_empty() {
            self.design.nrows()
        } else {
            filter.len()
        }
    }

    /// The currently active rows, in filter order.
    pub fn active_rows(&self) -> Vec<usize> {
        let filter = self.row_filter.borrow();
        if filter.is_empty() {
            (0..self.design.nrows()).collect()
        } else {
            filter.clone()
        }
    }

    pub fn row_filter(&self) -> Vec<usize> {
        self.row_filter.borrow().clone()
    }

    pub fn set_row_filter(&self, rows: &[usize]) {
        *self.row_filter.borrow_mut() = rows.to_vec();
    }

    /// Temporarily clear the row filter; the previous filter is restored
    /// when the guard drops, on every exit path.
    pub fn whole_rows(&self) -> AllRowsGuard<'_> {
        let saved = std::mem::take(&mut *self.row_filter.borrow_mut());
        AllRowsGuard { proxy: self, saved }
    }

    pub fn weight(&self) -> &Array1<f64> {
        &self.weight
    }

    pub fn weight_sqrt(&self) -> &Array1<f64> {
        &self.weight_sqrt
    }

    pub fn has_uniform_weight(&self) -> bool {
        self.uniform_weight
    }

    /// The weighted design restricted to `columns` and to the active rows:
    /// entry `(i, j)` is `sqrt(w[row_i]) * design[row_i, columns[j]]` (the
    /// square-root scaling is skipped under uniform weights).
    pub fn compute_weighted_design(&self, columns: &[usize]) -> Array2<f64> {
        let rows = self.active_rows();
        let mut out = Array2::zeros((rows.len(), columns.len()));
        for (i, &row) in rows.iter().enumerate() {
            let scale = if self.uniform_weight {
                1.0
            } else {
                self.weight_sqrt[row]
            };
            for (j, &col) in columns.iter().enumerate() {
                out[(i, j)] = scale * self.design[(row, col)];
            }
        }
        out
    }
}

/// Scope guard returned by [`DesignProxy::whole_rows`].
pub struct AllRowsGuard<'a> {
    proxy: &'a DesignProxy,
    saved: Vec<usize>,
}

impl Drop for AllRowsGuard<'_> {
    fn drop(&mut self) {
        *self.proxy.row_filter.borrow_mut() = std::mem::take(&mut self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn proxy_3x2() -> DesignProxy {
        let design = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0]];
        DesignProxy::new(design, None).unwrap()
    }

    #[test]
    fn uniform_weights_skip_scaling() {
        let proxy = proxy_3x2();
        assert!(proxy.has_uniform_weight());
        let psi = proxy.compute_weighted_design(&[0, 1]);
        assert_eq!(psi, array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0]]);
    }

    #[test]
    fn non_uniform_weights_scale_rows_by_sqrt() {
        let design = array![[1.0, 2.0], [3.0, 4.0]];
        let proxy = DesignProxy::new(design, Some(array![4.0, 9.0])).unwrap();
        assert!(!proxy.has_uniform_weight());
        let psi = proxy.compute_weighted_design(&[0, 1]);
        assert_eq!(psi, array![[2.0, 4.0], [9.0, 12.0]]);
    }

    #[test]
    fn row_filter_selects_and_orders_rows() {
        let proxy = proxy_3x2();
        proxy.set_row_filter(&[2, 0]);
        assert_eq!(proxy.active_row_count(), 2);
        let psi = proxy.compute_weighted_design(&[1]);
        assert_eq!(psi, array![[2.0], [0.0]]);
    }

    #[test]
    fn whole_rows_guard_restores_filter_on_every_exit() {
        let proxy = proxy_3x2();
        proxy.set_row_filter(&[1]);
        {
            let _guard = proxy.whole_rows();
            assert_eq!(proxy.active_row_count(), 3);
        }
        assert_eq!(proxy.row_filter(), vec![1]);

        // Early return path: the guard must still restore.
        fn early_exit(proxy: &DesignProxy) -> Result<(), SolverError> {
            let _guard = proxy.whole_rows();
            Err(SolverError::InvalidArgument("forced".into()))
        }
        assert!(early_exit(&proxy).is_err());
        assert_eq!(proxy.row_filter(), vec![1]);
    }

    #[test]
    fn negative_weights_are_rejected() {
        let design = array![[1.0], [1.0]];
        let err = DesignProxy::new(design, Some(array![1.0, -0.5])).unwrap_err();
        assert!(matches!(err, SolverError::InvalidArgument(_)));
    }

    #[test]
    fn weight_length_mismatch_is_rejected() {
        let design = array![[1.0], [1.0]];
        let err = DesignProxy::new(design, Some(array![1.0])).unwrap_err();
        assert!(matches!(err, SolverError::InvalidArgument(_)));
    }
}
