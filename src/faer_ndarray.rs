//! Conversion layer between `ndarray` containers and `faer` factorizations.
//!
//! The decomposition methods store their state as plain `Array1`/`Array2`
//! values and only drop into `faer` for the expensive full factorizations:
//! Cholesky of the Gram matrix, QR and SVD of the weighted design. Views are
//! borrowed without copying whenever the memory layout allows it.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers;
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = if let Some(slice) = array.as_slice_memory_order() {
            if array.is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                let (rows, cols) = array.dim();
                let owned = Mat::from_fn(rows, cols, |i, j| array[(i, j)]);
                FaerStorage::Owned(owned)
            }
        } else {
            let (rows, cols) = array.dim();
            let owned = Mat::from_fn(rows, cols, |i, j| array[(i, j)]);
            FaerStorage::Owned(owned)
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub trait FaerCholesky {
    fn cholesky_lower(&self) -> Result<Array2<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky_lower(&self) -> Result<Array2<f64>, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(Side::Lower)
            .map_err(FaerLinalgError::Cholesky)?;
        let lower = factor.L();
        Ok(mat_to_array(lower.as_ref()))
    }
}

/// QR factorization of an n x k matrix: `Q` is the full n x n orthogonal
/// factor, `R` is the min(n, k) x k block faer computes. Callers slice `Q`
/// to the economy form they need.
pub trait FaerQr {
    fn qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    fn qr(&self) -> (Array2<f64>, Array2<f64>) {
        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let q = qr.compute_Q();
        let r = qr.R();
        (mat_to_array(q.as_ref()), mat_to_array(r))
    }
}

/// Thin SVD: `self = U . diag(s) . Vt` with `U`: n x r, `Vt`: r x k,
/// r = min(n, k).
pub trait FaerSvd {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();
        let rank = rows.min(cols);

        let mut singular = Diag::<f64>::zeros(rank);
        let mut u_storage = Mat::<f64>::zeros(rows, rows);
        let mut v_storage = Mat::<f64>::zeros(cols, cols);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Full,
            ComputeSvdVectors::Full,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            faer_mat,
            singular.as_mut(),
            Some(u_storage.as_mut()),
            Some(v_storage.as_mut()),
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

        let singular_values = diag_to_array(singular.as_ref());
        let u_thin = Array2::from_shape_fn((rows, rank), |(i, j)| u_storage[(i, j)]);
        // faer hands back V, not Vt; transpose while slicing to rank.
        let vt_thin = Array2::from_shape_fn((rank, cols), |(i, j)| v_storage[(j, i)]);

        Ok((u_thin, singular_values, vt_thin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn cholesky_lower_reconstructs_gram() {
        let mut rng = StdRng::seed_from_u64(7);
        let design = random_matrix(20, 5, &mut rng);
        let gram = design.t().dot(&design);

        let lower = gram.cholesky_lower().unwrap();
        let rebuilt = lower.dot(&lower.t());
        for i in 0..5 {
            for j in 0..5 {
                assert!((rebuilt[(i, j)] - gram[(i, j)]).abs() < 1e-10);
            }
            for j in (i + 1)..5 {
                assert_eq!(lower[(i, j)], 0.0, "upper triangle must stay zero");
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_input() {
        let indefinite = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(matches!(
            indefinite.cholesky_lower(),
            Err(FaerLinalgError::Cholesky(_))
        ));
    }

    #[test]
    fn qr_reconstructs_input() {
        let mut rng = StdRng::seed_from_u64(11);
        let design = random_matrix(12, 4, &mut rng);
        let (q, r) = design.qr();
        assert_eq!(q.dim(), (12, 12));
        assert_eq!(r.dim(), (4, 4));
        let rebuilt = q.slice(ndarray::s![.., ..4]).dot(&r);
        for i in 0..12 {
            for j in 0..4 {
                assert!((rebuilt[(i, j)] - design[(i, j)]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn thin_svd_reconstructs_input() {
        let mut rng = StdRng::seed_from_u64(13);
        let design = random_matrix(15, 6, &mut rng);
        let (u, s, vt) = design.thin_svd().unwrap();
        assert_eq!(u.dim(), (15, 6));
        assert_eq!(s.len(), 6);
        assert_eq!(vt.dim(), (6, 6));

        let mut rebuilt = Array2::<f64>::zeros((15, 6));
        for k in 0..6 {
            for i in 0..15 {
                for j in 0..6 {
                    rebuilt[(i, j)] += u[(i, k)] * s[k] * vt[(k, j)];
                }
            }
        }
        for i in 0..15 {
            for j in 0..6 {
                assert!((rebuilt[(i, j)] - design[(i, j)]).abs() < 1e-10);
            }
        }
    }
}
