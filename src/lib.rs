//! Incremental least-squares decomposition methods.
//!
//! This crate fits and re-fits linear regression models of the form
//! `minimize ||Psi a - y||^2` (optionally row-weighted) while the set of
//! active basis columns or active observation rows changes repeatedly, as
//! happens during sparse model-selection and cross-validation searches.
//!
//! Three interchangeable decomposition methods maintain a factorization of
//! the weighted design (or its Gram matrix) across such changes:
//!
//! - [`cholesky::CholeskyMethod`]: Gram-matrix Cholesky factor with
//!   incremental single-column extension and rank-1 row update/downdate.
//! - [`qr::QrMethod`]: economy QR of the weighted design.
//! - [`svd::SvdMethod`]: thin SVD with pseudo-inverse regularization.
//!
//! All three implement the [`method::LeastSquaresMethod`] contract: lazy
//! revalidation on every query, least-squares and normal-equation solves,
//! and derived quantities (Gram inverse, its diagonal and trace, hat matrix
//! and leverage diagonal) needed by cross-validation criteria.
//!
//! [`sparse::SparseRefinement`] wraps one method and re-solves the problem
//! over evolving column subsets proposed by an external basis-sequence
//! search, returning the best-scoring sub-basis solution expressed over the
//! master basis.

pub mod cholesky;
pub mod error;
pub mod faer_ndarray;
pub mod method;
pub mod proxy;
pub mod qr;
pub mod sparse;
pub mod svd;
pub mod triangular;

pub use cholesky::CholeskyMethod;
pub use error::SolverError;
pub use method::{LeastSquaresMethod, MethodSettings, build_method};
pub use proxy::DesignProxy;
pub use qr::QrMethod;
pub use sparse::{BasisSequenceSearch, SparseRefinement, SparseSettings, corrected_leave_one_out};
pub use svd::SvdMethod;
