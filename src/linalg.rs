//! Small dense linear-algebra helpers around the normal equations.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::{Array1, Array2};
use ndarray_inverse::Inverse;

use crate::{DiffimError, Result};

/// Systems with a larger condition number are treated as singular.
const MAX_SOLVABLE_CONDITION: f64 = 1e14;

/// Which method produced a normal-equations solution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolvedBy {
    Cholesky,
    Inverse,
    PseudoInverse,
}

fn to_dmatrix(m: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[[i, j]])
}

fn to_dvector(b: &Array1<f64>) -> DVector<f64> {
    DVector::from_iterator(b.len(), b.iter().copied())
}

fn check_square(m: &Array2<f64>, b: &Array1<f64>) -> Result<()> {
    if m.nrows() != m.ncols() || m.nrows() != b.len() {
        return Err(DiffimError::DimensionMismatch(format!(
            "normal equations {:?} with right-hand side of length {}",
            m.dim(),
            b.len()
        )));
    }
    Ok(())
}

/// Solve the symmetric system `m x = b`.
///
/// Cholesky first; if `m` is not safely positive definite, an explicit
/// inverse. A singular or non-finite system is `IllConditionedFit`.
pub fn solve_normal_equations(m: &Array2<f64>, b: &Array1<f64>) -> Result<(Array1<f64>, SolvedBy)> {
    check_square(m, b)?;
    if m.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err(DiffimError::IllConditionedFit(
            "non-finite entries in normal equations".to_string(),
        ));
    }

    if let Some(chol) = to_dmatrix(m).cholesky() {
        let diag = chol.l_dirty().diagonal();
        let (lo, hi) = diag
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), v| (lo.min(v.abs()), hi.max(v.abs())));
        if hi > 0.0 && (hi / lo).powi(2) < MAX_SOLVABLE_CONDITION {
            let x = chol.solve(&to_dvector(b));
            if x.iter().all(|v| v.is_finite()) {
                return Ok((Array1::from_iter(x.iter().copied()), SolvedBy::Cholesky));
            }
        }
    }

    let cond = condition_number(m);
    if cond > MAX_SOLVABLE_CONDITION {
        return Err(DiffimError::IllConditionedFit(format!(
            "normal equations are singular (condition number {:.3e})",
            cond
        )));
    }
    let inverse = m.inv().ok_or_else(|| {
        DiffimError::IllConditionedFit("normal equations matrix is singular".to_string())
    })?;
    let x = inverse.dot(b);
    if x.iter().all(|v| v.is_finite()) {
        Ok((x, SolvedBy::Inverse))
    } else {
        Err(DiffimError::IllConditionedFit(
            "normal equations solution is not finite".to_string(),
        ))
    }
}

/// Eigenvalues (descending) and matching eigenvectors (as columns) of a
/// symmetric matrix.
pub fn symmetric_eigen(m: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let eigen = SymmetricEigen::new(to_dmatrix(m));
    let n = eigen.eigenvalues.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = Array1::from_iter(order.iter().map(|&i| eigen.eigenvalues[i]));
    let vectors = Array2::from_shape_fn((n, n), |(r, c)| eigen.eigenvectors[(r, order[c])]);
    (values, vectors)
}

/// Minimum-norm solution of `m x = b`, discarding eigen-directions whose
/// eigenvalue is below `rcond` times the largest.
pub fn pseudo_solve(m: &Array2<f64>, b: &Array1<f64>, rcond: f64) -> Result<Array1<f64>> {
    check_square(m, b)?;
    let (values, vectors) = symmetric_eigen(m);
    let cutoff = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())) * rcond;

    let projected = vectors.t().dot(b);
    let scaled = Array1::from_iter(projected.iter().zip(values.iter()).map(|(p, &l)| {
        if l.abs() > cutoff && l.abs() > 0.0 {
            p / l
        } else {
            0.0
        }
    }));
    let x = vectors.dot(&scaled);
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(DiffimError::IllConditionedFit(
            "pseudo-inverse solution is not finite".to_string(),
        ))
    }
}

/// ratio of largest to smallest absolute eigenvalue
pub fn condition_number(m: &Array2<f64>) -> f64 {
    let (values, _) = symmetric_eigen(m);
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, 0.0_f64), |(lo, hi), v| (lo.min(v.abs()), hi.max(v.abs())));
    if lo > 0.0 {
        hi / lo
    } else {
        f64::INFINITY
    }
}
