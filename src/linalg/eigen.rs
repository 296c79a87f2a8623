//! Symmetric eigendecomposition.

use crate::error::{Error, Result};
use crate::linalg::faer_bridge::{array_to_mat, diag_to_array, mat_to_array};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView2};

/// Full decomposition as returned by faer: ascending eigenvalues, eigenvectors in columns.
fn full_eigh(a: ArrayView2<'_, f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            found: a.ncols(),
        });
    }
    if n == 0 {
        return Ok((Array1::zeros(0), Array2::zeros((0, 0))));
    }
    let mat = array_to_mat(a);
    let evd = mat
        .as_ref()
        .self_adjoint_eigen(Side::Lower)
        .map_err(|_| Error::EigenFailed)?;
    Ok((diag_to_array(evd.S()), mat_to_array(evd.U())))
}

/// The `k` largest-magnitude eigenpairs of a symmetric matrix.
///
/// Eigenvalues come back in descending order; row `i` of the returned matrix
/// is the unit eigenvector for eigenvalue `i`.
///
/// # Errors
///
/// [`Error::EigenCountExceedsDimension`] when `k > n`.
pub fn eigen_decompose(a: ArrayView2<'_, f64>, k: usize) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if k > n {
        return Err(Error::EigenCountExceedsDimension {
            requested: k,
            dim: n,
        });
    }
    let (values, vectors) = full_eigh(a)?;

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| {
        values[j]
            .abs()
            .partial_cmp(&values[i].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(k);
    order.sort_by(|&i, &j| {
        values[j]
            .partial_cmp(&values[i])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let eigenvalues = Array1::from_iter(order.iter().map(|&i| values[i]));
    let mut eigenvectors = Array2::zeros((k, n));
    for (row, &i) in order.iter().enumerate() {
        eigenvectors.row_mut(row).assign(&vectors.column(i));
    }
    Ok((eigenvalues, eigenvectors))
}

/// Inverse of a symmetric matrix through its eigenbasis, with every eigenvalue
/// clamped to at least `floor` so the result always exists.
pub fn inverse_via_eigen(a: ArrayView2<'_, f64>, floor: f64) -> Result<Array2<f64>> {
    let (values, vectors) = full_eigh(a)?;
    let n = values.len();
    let mut inv = Array2::zeros((n, n));
    for (k, &lambda) in values.iter().enumerate() {
        let v = vectors.column(k);
        let scale = 1.0 / lambda.max(floor);
        for i in 0..n {
            let vi = v[i] * scale;
            for j in 0..n {
                inv[(i, j)] += vi * v[j];
            }
        }
    }
    Ok(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_eigen_descending_and_orthonormal() {
        let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.5], [0.0, 0.5, 1.0]];
        let (vals, vecs) = eigen_decompose(a.view(), 3).unwrap();
        assert!(vals[0] >= vals[1] && vals[1] >= vals[2]);
        let gram = vecs.dot(&vecs.t());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-10);
            }
        }
        // A v = λ v
        for k in 0..3 {
            let av = a.dot(&vecs.row(k));
            for i in 0..3 {
                assert_abs_diff_eq!(av[i], vals[k] * vecs[(k, i)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_eigen_truncated_keeps_largest() {
        let a = array![[1.0, 0.0, 0.0], [0.0, 9.0, 0.0], [0.0, 0.0, 4.0]];
        let (vals, vecs) = eigen_decompose(a.view(), 2).unwrap();
        assert_eq!(vals.len(), 2);
        assert_abs_diff_eq!(vals[0], 9.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vals[1], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vecs[(0, 1)].abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_eigen_count_exceeds_dimension() {
        let a = Array2::<f64>::eye(2);
        assert_eq!(
            eigen_decompose(a.view(), 3),
            Err(Error::EigenCountExceedsDimension {
                requested: 3,
                dim: 2
            })
        );
    }

    #[test]
    fn test_inverse_via_eigen() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let inv = inverse_via_eigen(a.view(), 1e-12).unwrap();
        let id = a.dot(&inv);
        assert_abs_diff_eq!(id[(0, 0)], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(id[(0, 1)], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(id[(1, 1)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_inverse_floors_singular_direction() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        let inv = inverse_via_eigen(a.view(), 0.5).unwrap();
        assert!(inv.iter().all(|v| v.is_finite()));
    }
}
