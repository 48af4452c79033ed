//! SVD decomposition method.
//!
//! Stores the thin factors `U` (active rows x r), the singular values and
//! `Vt` (r x columns) of the weighted design. Solves go through the
//! pseudo-inverse: singular values at or below a relative cutoff are treated
//! as zero, so rank-deficient systems yield the minimum-norm solution
//! instead of blowing up. Like QR, every non-trivial index change is a full
//! refactorization.

use std::rc::Rc;

use ndarray::{Array1, Array2};

use crate::error::SolverError;
use crate::faer_ndarray::FaerSvd;
use crate::method::{self, LeastSquaresMethod};
use crate::proxy::DesignProxy;

struct SvdFactors {
    u: Array2<f64>,
    singular: Array1<f64>,
    vt: Array2<f64>,
}

impl SvdFactors {
    /// Relative cutoff below which a singular value is treated as zero,
    /// matching the usual LAPACK-style `rcond` default.
    fn cutoff(&self) -> f64 {
        let s_max = self.singular.iter().cloned().fold(0.0_f64, f64::max);
        let dim = self.u.nrows().max(self.vt.ncols());
        s_max * dim as f64 * f64::EPSILON
    }
}

pub struct SvdMethod {
    proxy: Rc<DesignProxy>,
    current_indices: Vec<usize>,
    factors: Option<SvdFactors>,
}

impl SvdMethod {
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
            self.factors = Some(SvdFactors {
                u: Array2::zeros((n, 0)),
                singular: Array1::zeros(0),
                vt: Array2::zeros((0, 0)),
            });
            return Ok(());
        }
        let psi = self.proxy.compute_weighted_design(&self.current_indices);
        let (u, singular, vt) = psi.thin_svd()?;
        self.factors = Some(SvdFactors { u, singular, vt });
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), SolverError> {
        if self.factors.is_none() {
            self.full_factorize()?;
        }
        Ok(())
    }
}

impl LeastSquaresMethod for SvdMethod {
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
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        let c = factors.u.t().dot(&b);
        let mut scaled = Array1::zeros(c.len());
        for i in 0..c.len() {
            if factors.singular[i] > cutoff {
                scaled[i] = c[i] / factors.singular[i];
            }
        }
        Ok(factors.vt.t().dot(&scaled))
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
        let cutoff = factors.cutoff();
        let c = factors.vt.dot(rhs);
        let mut scaled = Array1::zeros(c.len());
        for i in 0..c.len() {
            let s = factors.singular[i];
            if s > cutoff {
                scaled[i] = c[i] / (s * s);
            }
        }
        Ok(factors.vt.t().dot(&scaled))
    }

    fn gram_inverse(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        let mut inv = Array2::zeros((k, k));
        for i in 0..factors.singular.len() {
            let s = factors.singular[i];
            if s <= cutoff {
                continue;
            }
            let s2 = s * s;
            for a in 0..k {
                for b in 0..k {
                    inv[(a, b)] += factors.vt[(i, a)] * factors.vt[(i, b)] / s2;
                }
            }
        }
        Ok(inv)
    }

    fn gram_inverse_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let k = self.current_indices.len();
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        let mut diag = Array1::zeros(k);
        for i in 0..factors.singular.len() {
            let s = factors.singular[i];
            if s <= cutoff {
                continue;
            }
            let s2 = s * s;
            for j in 0..k {
                diag[j] += factors.vt[(i, j)] * factors.vt[(i, j)] / s2;
            }
        }
        Ok(diag)
    }

    fn gram_inverse_trace(&mut self) -> Result<f64, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        Ok(factors
            .singular
            .iter()
            .filter(|&&s| s > cutoff)
            .map(|&s| 1.0 / (s * s))
            .sum())
    }

    fn hat(&mut self) -> Result<Array2<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        let n = factors.u.nrows();
        let mut hat = Array2::zeros((n, n));
        for i in 0..factors.singular.len() {
            if factors.singular[i] <= cutoff {
                continue;
            }
            for a in 0..n {
                for b in 0..n {
                    hat[(a, b)] += factors.u[(a, i)] * factors.u[(b, i)];
                }
            }
        }
        Ok(hat)
    }

    fn hat_diag(&mut self) -> Result<Array1<f64>, SolverError> {
        self.update(&[], &self.current_indices.clone(), &[], false)?;
        let factors = self
            .factors
            .as_ref()
            .ok_or_else(method::stale_decomposition)?;
        let cutoff = factors.cutoff();
        let n = factors.u.nrows();
        let mut diag = Array1::zeros(n);
        for i in 0..factors.singular.len() {
            if factors.singular[i] <= cutoff {
                continue;
            }
            for row in 0..n {
                diag[row] += factors.u[(row, i)] * factors.u[(row, i)];
            }
        }
        Ok(diag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_proxy(rows: usize, cols: usize, seed: u64) -> Rc<DesignProxy> {
        let mut rng = StdRng::seed_from_u64(seed);
        let design = Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0));
        Rc::new(DesignProxy::new(design, None).unwrap())
    }

    #[test]
    fn solves_the_textbook_system() {
        let design = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0]];
        let proxy = Rc::new(DesignProxy::new(design, None).unwrap());
        let mut method = SvdMethod::new(proxy, vec![0, 1]).unwrap();
        let coeffs = method.solve(&array![1.0, 2.0, 2.1]).unwrap();
        assert!((coeffs[0] - 1.15).abs() < 1e-10);
        assert!((coeffs[1] - 0.55).abs() < 1e-10);
    }

    #[test]
    fn rank_deficient_system_yields_finite_coefficients() {
        // Two identical columns: the pseudo-inverse splits the weight
        // between them instead of producing NaN.
        let design = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let proxy = Rc::new(DesignProxy::new(design, None).unwrap());
        let mut method = SvdMethod::new(proxy, vec![0, 1]).unwrap();
        let coeffs = method.solve(&array![2.0, 4.0, 6.0]).unwrap();
        assert!(coeffs.iter().all(|v| v.is_finite()));
        assert!((coeffs[0] - 1.0).abs() < 1e-10);
        assert!((coeffs[1] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn gram_inverse_trace_matches_diag_sum() {
        let proxy = random_proxy(18, 4, 9);
        let mut method = SvdMethod::new(proxy, vec![0, 1, 2, 3]).unwrap();
        let trace = method.gram_inverse_trace().unwrap();
        let diag = method.gram_inverse_diag().unwrap();
        assert!((trace - diag.sum()).abs() < 1e-10);
    }

    #[test]
    fn hat_diag_matches_hat_matrix() {
        let proxy = random_proxy(9, 3, 10);
        let mut method = SvdMethod::new(proxy, vec![0, 1, 2]).unwrap();
        let hat = method.hat().unwrap();
        let diag = method.hat_diag().unwrap();
        for i in 0..9 {
            assert!((hat[(i, i)] - diag[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn row_replacement_refactorizes_against_the_new_rows() {
        let proxy = random_proxy(10, 2, 11);
        let mut method = SvdMethod::new(proxy.clone(), vec![0, 1]).unwrap();
        method.update(&[], &[0, 1], &[], false).unwrap();
        method.update(&[5, 6, 7], &[], &(0..5).collect::<Vec<_>>(), true).unwrap();
        assert_eq!(proxy.row_filter(), vec![5, 6, 7]);

        let mut rng = StdRng::seed_from_u64(12);
        let rhs = Array1::from_shape_fn(3, |_| rng.gen_range(-1.0..1.0));
        let coeffs = method.solve(&rhs).unwrap();

        let scratch_proxy = random_proxy(10, 2, 11);
        scratch_proxy.set_row_filter(&[5, 6, 7]);
        let mut scratch = SvdMethod::new(scratch_proxy, vec![0, 1]).unwrap();
        let expected = scratch.solve(&rhs).unwrap();
        for i in 0..2 {
            assert!((coeffs[i] - expected[i]).abs() < 1e-10);
        }
    }
}
