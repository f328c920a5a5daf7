//! Dense solves for the Newton steps and covariance matrices.
//!
//! The models keep their matrices in `ndarray`; the factorisation is
//! nalgebra's partial-pivoting LU. A pivot below a tolerance relative to the
//! largest entry counts as singular.

use nalgebra::{DMatrix, DVector, Dyn, LU};
use ndarray::{Array1, Array2};

const PIVOT_EPS: f64 = 1e-12;

fn to_nalgebra(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

/// LU factors of a square matrix, `None` when it is (numerically) singular.
fn factorize(a: &Array2<f64>) -> Option<LU<f64, Dyn, Dyn>> {
    if a.nrows() != a.ncols() || a.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1.0);
    let lu = to_nalgebra(a).lu();
    if lu.u().diagonal().iter().any(|p| p.abs() < PIVOT_EPS * scale) {
        return None;
    }
    Some(lu)
}

/// Invert a square matrix, `None` when it is (numerically) singular.
pub fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if n == 0 && a.ncols() == 0 {
        return Some(Array2::zeros((0, 0)));
    }
    let inv = factorize(a)?.try_inverse()?;
    Some(Array2::from_shape_fn((n, n), |(i, j)| inv[(i, j)]))
}

/// Solve `a x = b`.
pub fn solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    if a.nrows() != b.len() {
        return None;
    }
    if b.is_empty() {
        return Some(Array1::zeros(0));
    }
    let rhs = DVector::from_iterator(b.len(), b.iter().copied());
    let x = factorize(a)?.solve(&rhs)?;
    x.iter()
        .all(|v| v.is_finite())
        .then(|| x.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_invert_recovers_identity() {
        let a = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 2.0]];
        let inv = invert(&a).expect("invertible");
        let id = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((id[[i, j]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_matrix_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(invert(&a).is_none());
    }

    #[test]
    fn test_near_singular_matrix_is_rejected() {
        let a = array![[1.0, 1.0], [1.0, 1.0 + 1e-15]];
        assert!(invert(&a).is_none());
        assert!(solve(&a, &array![1.0, 2.0]).is_none());
    }

    #[test]
    fn test_solve_needs_pivoting() {
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let b = array![2.0, 3.0];
        let x = solve(&a, &b).expect("solvable");
        assert_eq!(x, array![3.0, 2.0]);
    }
}
