//! Dense triangular kernels: substitution solves, triangular inversion and
//! rank-1 Cholesky update/downdate.
//!
//! These operate on factors the decomposition methods own as `Array2<f64>`,
//! entry by entry, which is what the incremental paths need and what no
//! high-level backend solver exposes. All loops are O(n^2) or O(n^3) in the
//! basis size, which is small by contract.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::SolverError;

/// Signals that a rank-1 revision lost positive definiteness at `index`.
///
/// This is an internal recovery signal: the methods respond by falling back
/// to a full refactorization, it is never surfaced to callers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RankOneFailure {
    pub index: usize,
}

fn check_solve_dims(l: ArrayView2<f64>, b_len: usize) -> Result<(), SolverError> {
    if l.ncols() != l.nrows() || b_len != l.nrows() {
        return Err(SolverError::InvalidArgument(format!(
            "triangular solve dimension mismatch: matrix is {}x{}, right-hand side has {} rows",
            l.nrows(),
            l.ncols(),
            b_len
        )));
    }
    Ok(())
}

/// Solve `L x = b` by forward substitution, `L` lower-triangular.
pub fn solve_lower(l: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, SolverError> {
    check_solve_dims(l, b.len())?;
    let n = l.nrows();
    let mut x = b.to_owned();
    for i in 0..n {
        let mut acc = x[i];
        for j in 0..i {
            acc -= l[(i, j)] * x[j];
        }
        let pivot = l[(i, i)];
        if pivot == 0.0 {
            return Err(SolverError::SingularTriangularSystem { index: i });
        }
        x[i] = acc / pivot;
    }
    Ok(x)
}

/// Solve `U x = b` by back substitution, `U` upper-triangular.
pub fn solve_upper(u: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, SolverError> {
    check_solve_dims(u, b.len())?;
    let n = u.nrows();
    let mut x = b.to_owned();
    for i in (0..n).rev() {
        let mut acc = x[i];
        for j in (i + 1)..n {
            acc -= u[(i, j)] * x[j];
        }
        let pivot = u[(i, i)];
        if pivot == 0.0 {
            return Err(SolverError::SingularTriangularSystem { index: i });
        }
        x[i] = acc / pivot;
    }
    Ok(x)
}

/// Solve `L X = B` column by column.
pub fn solve_lower_mat(
    l: ArrayView2<f64>,
    b: ArrayView2<f64>,
) -> Result<Array2<f64>, SolverError> {
    check_solve_dims(l, b.nrows())?;
    let n = l.nrows();
    let mut x = Array2::zeros((n, b.ncols()));
    for (col, b_col) in b.columns().into_iter().enumerate() {
        let solved = solve_lower(l, b_col)?;
        x.column_mut(col).assign(&solved);
    }
    Ok(x)
}

/// Explicit inverse of a lower-triangular matrix, by forward substitution
/// against the columns of the identity.
pub fn invert_lower(l: ArrayView2<f64>) -> Result<Array2<f64>, SolverError> {
    let n = l.nrows();
    let mut inv = Array2::zeros((n, n));
    let mut unit = Array1::zeros(n);
    for col in 0..n {
        unit.fill(0.0);
        unit[col] = 1.0;
        let solved = solve_lower(l, unit.view())?;
        inv.column_mut(col).assign(&solved);
    }
    Ok(inv)
}

/// Explicit inverse of an upper-triangular matrix.
pub fn invert_upper(u: ArrayView2<f64>) -> Result<Array2<f64>, SolverError> {
    let n = u.nrows();
    let mut inv = Array2::zeros((n, n));
    let mut unit = Array1::zeros(n);
    for col in 0..n {
        unit.fill(0.0);
        unit[col] = 1.0;
        let solved = solve_upper(u, unit.view())?;
        inv.column_mut(col).assign(&solved);
    }
    Ok(inv)
}

/// In-place rank-1 Cholesky revision: given lower-triangular `L` with
/// `P = L L^T`, rewrite `L` so that `P' = L L^T + sign * v v^T`.
///
/// Direct LINPACK `dchud`/`dchdd` formulation. `v` is consumed as workspace.
/// Fails when the rotation argument `L[j,j]^2 + sign * v[j]^2` is not
/// strictly positive, which for a downdate means the revised matrix would no
/// longer be positive definite (or cancellation has destroyed the pivot).
/// On failure `L` is left partially revised and must be discarded.
fn rank_one_revision(
    l: &mut Array2<f64>,
    v: &mut Array1<f64>,
    sign: f64,
) -> Result<(), RankOneFailure> {
    let n = l.nrows();
    debug_assert_eq!(l.ncols(), n);
    debug_assert_eq!(v.len(), n);
    for j in 0..n {
        let ljj = l[(j, j)];
        let vj = v[j];
        let arg = ljj * ljj + sign * vj * vj;

        if !(arg > 0.0) || !arg.is_finite() || ljj == 0.0 {
            return Err(RankOneFailure { index: j });
        }

        let r = arg.sqrt();
        let c = r / ljj;
        let s = vj / ljj;
        l[(j, j)] = r;

        for i in (j + 1)..n {
            l[(i, j)] = (l[(i, j)] + sign * s * v[i]) / c;
            v[i] = c * v[i] - s * l[(i, j)];
        }
    }
    Ok(())
}

/// Rank-1 update: `P' = L L^T + v v^T`.
pub(crate) fn cholupdate(l: &mut Array2<f64>, v: &mut Array1<f64>) -> Result<(), RankOneFailure> {
    rank_one_revision(l, v, 1.0)
}

/// Rank-1 downdate: `P' = L L^T - v v^T`.
pub(crate) fn choldowndate(
    l: &mut Array2<f64>,
    v: &mut Array1<f64>,
) -> Result<(), RankOneFailure> {
    rank_one_revision(l, v, -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faer_ndarray::FaerCholesky;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
        let mut worst = 0.0_f64;
        for (x, y) in a.iter().zip(b.iter()) {
            worst = worst.max((x - y).abs());
        }
        worst
    }

    #[test]
    fn forward_substitution_matches_known_system() {
        let l = array![[2.0, 0.0, 0.0], [1.0, 3.0, 0.0], [-1.0, 2.0, 4.0]];
        let x = array![1.5, -0.5, 2.0];
        let b = l.dot(&x);
        let solved = solve_lower(l.view(), b.view()).unwrap();
        for i in 0..3 {
            assert!((solved[i] - x[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn back_substitution_matches_known_system() {
        let u = array![[3.0, -1.0, 2.0], [0.0, 2.0, 1.0], [0.0, 0.0, 5.0]];
        let x = array![0.5, 2.0, -1.0];
        let b = u.dot(&x);
        let solved = solve_upper(u.view(), b.view()).unwrap();
        for i in 0..3 {
            assert!((solved[i] - x[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let l = array![[2.0, 0.0], [1.0, 3.0]];
        let short = array![1.0];
        assert!(matches!(
            solve_lower(l.view(), short.view()),
            Err(SolverError::InvalidArgument(_))
        ));
        assert!(matches!(
            solve_upper(l.view(), short.view()),
            Err(SolverError::InvalidArgument(_))
        ));
        let wide_rhs = array![[1.0, 2.0]];
        assert!(matches!(
            solve_lower_mat(l.view(), wide_rhs.view()),
            Err(SolverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_pivot_is_reported_with_its_index() {
        let l = array![[1.0, 0.0], [2.0, 0.0]];
        let b = array![1.0, 1.0];
        match solve_lower(l.view(), b.view()) {
            Err(SolverError::SingularTriangularSystem { index }) => assert_eq!(index, 1),
            other => panic!("expected singular pivot, got {other:?}"),
        }
    }

    #[test]
    fn inverse_of_lower_triangle_roundtrips() {
        let l = array![[2.0, 0.0, 0.0], [1.0, 3.0, 0.0], [-1.0, 2.0, 4.0]];
        let inv = invert_lower(l.view()).unwrap();
        let identity = l.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((identity[(i, j)] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn rank_one_update_matches_refactorization() {
        let mut rng = StdRng::seed_from_u64(3);
        let design = Array2::from_shape_fn((10, 4), |_| rng.gen_range(-1.0..1.0));
        let row = Array1::from_shape_fn(4, |_| rng.gen_range(-1.0..1.0));

        let gram = design.t().dot(&design);
        let mut lower = gram.cholesky_lower().unwrap();

        let mut workspace = row.clone();
        cholupdate(&mut lower, &mut workspace).unwrap();

        let outer = Array2::from_shape_fn((4, 4), |(i, j)| row[i] * row[j]);
        let expected = (&gram + &outer).cholesky_lower().unwrap();
        assert!(max_abs_diff(&lower, &expected) < 1e-10);
    }

    #[test]
    fn downdate_reverses_update() {
        let mut rng = StdRng::seed_from_u64(5);
        let design = Array2::from_shape_fn((12, 3), |_| rng.gen_range(-1.0..1.0));
        let row = Array1::from_shape_fn(3, |_| rng.gen_range(-1.0..1.0));

        let gram = design.t().dot(&design);
        let original = gram.cholesky_lower().unwrap();
        let mut lower = original.clone();

        let mut workspace = row.clone();
        cholupdate(&mut lower, &mut workspace).unwrap();
        let mut workspace = row.clone();
        choldowndate(&mut lower, &mut workspace).unwrap();

        assert!(max_abs_diff(&lower, &original) < 1e-10);
    }

    #[test]
    fn downdate_fails_when_definiteness_is_lost() {
        // P = I (2x2); removing v = (2, 0) would leave P' with a negative
        // leading entry.
        let mut lower = Array2::eye(2);
        let mut v = array![2.0, 0.0];
        let failure = choldowndate(&mut lower, &mut v).unwrap_err();
        assert_eq!(failure.index, 0);
    }
}
