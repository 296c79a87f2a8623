//! Cholesky factorization and incremental updates.
//!
//! # Why incremental?
//!
//! A Gaussian evaluated on a sample with missing coordinates needs the Cholesky
//! factor of its covariance restricted to the observed dimensions. Two samples
//! whose missing patterns differ in a handful of bits have factors that differ
//! by a handful of rows:
//!
//! ```text
//! observed {0,1,2,4}  --remove 4-->  {0,1,2}  --append 5-->  {0,1,2,5}
//!   O(n³) from scratch                O(n²)                    O(n²)
//! ```
//!
//! [`update_factor_from_previous`] walks from one factor to the next with
//! cost proportional to the symmetric difference of the two index sets.
//!
//! # Factor layout
//!
//! An [`IndexedFactor`] keeps the lower-triangular `L` together with the
//! feature dimension each of its rows stands for. Appended dimensions go to the
//! end, so `dims` is generally *not* sorted.

use crate::error::{Error, Result};
use crate::linalg::faer_bridge::{array_to_mat, mat_to_array};
use faer::Side;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

/// Factor `a = L Lᵀ` and return the lower-triangular `L`.
///
/// # Errors
///
/// [`Error::NotPositiveDefinite`] when `a` is not positive definite.
pub fn cholesky_factor(a: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(Error::DimensionMismatch {
            expected: n,
            found: a.ncols(),
        });
    }
    if n == 0 {
        return Ok(Array2::zeros((0, 0)));
    }

    let mat = array_to_mat(a);
    let llt = mat
        .as_ref()
        .llt(Side::Lower)
        .map_err(|_| Error::NotPositiveDefinite { dim: n })?;
    let mut lower = mat_to_array(llt.L());
    // faer leaves the strict upper triangle unspecified
    for i in 0..n {
        for j in (i + 1)..n {
            lower[(i, j)] = 0.0;
        }
    }
    Ok(lower)
}

/// Solve `L z = b` by forward substitution.
pub fn solve_lower(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut z = b.to_owned();
    for i in 0..n {
        let mut acc = z[i];
        for k in 0..i {
            acc -= l[(i, k)] * z[k];
        }
        z[i] = acc / l[(i, i)];
    }
    z
}

/// Solve `Lᵀ x = b` by backward substitution.
pub fn solve_upper_transposed(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut x = b.to_owned();
    for i in (0..n).rev() {
        let mut acc = x[i];
        for k in (i + 1)..n {
            acc -= l[(k, i)] * x[k];
        }
        x[i] = acc / l[(i, i)];
    }
    x
}

/// Grow `l` by one row/column.
///
/// `new_row` holds the covariances between the new dimension and the existing
/// ones (in factor order), followed by the new dimension's variance. O(n²).
pub fn cholesky_append_dimension(l: &mut Array2<f64>, new_row: ArrayView1<'_, f64>) -> Result<()> {
    let n = l.nrows();
    if new_row.len() != n + 1 {
        return Err(Error::DimensionMismatch {
            expected: n + 1,
            found: new_row.len(),
        });
    }

    let y = solve_lower(l.view(), new_row.slice(s![..n]));
    let d2 = new_row[n] - y.dot(&y);
    if d2.is_nan() || d2 <= 0.0 {
        return Err(Error::NotPositiveDefinite { dim: n + 1 });
    }

    let mut grown = Array2::zeros((n + 1, n + 1));
    grown.slice_mut(s![..n, ..n]).assign(l);
    grown.slice_mut(s![n, ..n]).assign(&y);
    grown[(n, n)] = d2.sqrt();
    *l = grown;
    Ok(())
}

/// Drop row/column `index` from `l`. O(n²).
///
/// Removing the row leaves the trailing block `L₃₃` with an extra column
/// `l₃₂`; the new trailing factor is the rank-one update `L₃₃L₃₃ᵀ + l₃₂l₃₂ᵀ`.
pub fn cholesky_remove_dimension(l: &mut Array2<f64>, index: usize) -> Result<()> {
    let n = l.nrows();
    if index >= n {
        return Err(Error::InvalidParameter {
            name: "index",
            message: "dimension index out of range for factor",
        });
    }

    let mut x = l.slice(s![index + 1.., index]).to_owned();
    let mut trailing = l.slice(s![index + 1.., index + 1..]).to_owned();
    rank_one_update(&mut trailing, &mut x);

    let mut shrunk = Array2::zeros((n - 1, n - 1));
    shrunk
        .slice_mut(s![..index, ..index])
        .assign(&l.slice(s![..index, ..index]));
    shrunk
        .slice_mut(s![index.., ..index])
        .assign(&l.slice(s![index + 1.., ..index]));
    shrunk.slice_mut(s![index.., index..]).assign(&trailing);
    *l = shrunk;
    Ok(())
}

/// In place: `l ← chol(l lᵀ + x xᵀ)`. `x` is consumed as scratch.
fn rank_one_update(l: &mut Array2<f64>, x: &mut Array1<f64>) {
    let m = l.nrows();
    for k in 0..m {
        let lkk = l[(k, k)];
        let r = lkk.hypot(x[k]);
        let c = r / lkk;
        let s = x[k] / lkk;
        l[(k, k)] = r;
        for i in (k + 1)..m {
            l[(i, k)] = (l[(i, k)] + s * x[i]) / c;
            x[i] = c * x[i] - s * l[(i, k)];
        }
    }
}

/// A Cholesky factor of a covariance restricted to a subset of dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedFactor {
    lower: Array2<f64>,
    dims: Vec<usize>,
}

impl IndexedFactor {
    /// Factor over no dimensions.
    pub fn empty() -> Self {
        Self {
            lower: Array2::zeros((0, 0)),
            dims: Vec::new(),
        }
    }

    /// Factor `full[dims, dims]` from scratch.
    pub fn from_scratch(full: ArrayView2<'_, f64>, dims: &[usize]) -> Result<Self> {
        let sub = Array2::from_shape_fn((dims.len(), dims.len()), |(i, j)| {
            full[(dims[i], dims[j])]
        });
        Ok(Self {
            lower: cholesky_factor(sub.view())?,
            dims: dims.to_vec(),
        })
    }

    /// Feature dimension of each factor row.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// The lower-triangular factor.
    pub fn lower(&self) -> ArrayView2<'_, f64> {
        self.lower.view()
    }

    /// Number of dimensions covered.
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    /// True when the factor covers no dimension.
    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// `log det(L Lᵀ)`.
    pub fn log_det(&self) -> f64 {
        2.0 * self.lower.diag().iter().map(|v| v.ln()).sum::<f64>()
    }

    /// `L⁻¹ b`, with `b` given in factor order.
    pub fn solve_lower(&self, b: ArrayView1<'_, f64>) -> Array1<f64> {
        solve_lower(self.lower.view(), b)
    }

    /// `(L Lᵀ)⁻¹ b`, with `b` given in factor order.
    pub fn solve(&self, b: ArrayView1<'_, f64>) -> Array1<f64> {
        let z = solve_lower(self.lower.view(), b);
        solve_upper_transposed(self.lower.view(), z.view())
    }

    /// `diffᵀ (L Lᵀ)⁻¹ diff`, with `diff` given in factor order.
    pub fn mahalanobis(&self, diff: ArrayView1<'_, f64>) -> f64 {
        let z = self.solve_lower(diff);
        z.dot(&z)
    }

    /// Move this factor to cover `target` (sorted ascending) instead.
    ///
    /// Dimensions not in `target` are removed, then the new ones are appended in
    /// ascending order. Equal index sets leave the factor untouched.
    pub fn retarget(&mut self, target: &[usize], full: ArrayView2<'_, f64>) -> Result<()> {
        let d = full.nrows();
        let mut wanted = vec![false; d];
        for &dim in target {
            if dim >= d {
                return Err(Error::DimensionMismatch {
                    expected: d,
                    found: dim + 1,
                });
            }
            wanted[dim] = true;
        }

        let mut pos = self.dims.len();
        while pos > 0 {
            pos -= 1;
            if !wanted[self.dims[pos]] {
                cholesky_remove_dimension(&mut self.lower, pos)?;
                let _ = self.dims.remove(pos);
            }
        }

        let mut present = vec![false; d];
        for &dim in &self.dims {
            present[dim] = true;
        }
        for &dim in target {
            if present[dim] {
                continue;
            }
            let mut row = Array1::zeros(self.dims.len() + 1);
            for (k, &other) in self.dims.iter().enumerate() {
                row[k] = full[(dim, other)];
            }
            row[self.dims.len()] = full[(dim, dim)];
            cholesky_append_dimension(&mut self.lower, row.view())?;
            self.dims.push(dim);
            present[dim] = true;
        }
        Ok(())
    }
}

/// Derive the factor of `full[target, target]` from one valid on `prev.dims()`.
///
/// Cost is proportional to the symmetric difference of the two index sets
/// (times n²), never to a from-scratch O(n³) factorization.
pub fn update_factor_from_previous(
    prev: &IndexedFactor,
    target: &[usize],
    full: ArrayView2<'_, f64>,
) -> Result<IndexedFactor> {
    let mut next = prev.clone();
    next.retarget(target, full)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use proptest::prelude::*;

    fn spd(d: usize, seed: u64) -> Array2<f64> {
        // A Aᵀ + d I with a deterministic pseudo-random A.
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let a = Array2::from_shape_fn((d, d), |_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
        });
        a.dot(&a.t()) + Array2::<f64>::eye(d) * d as f64 * 0.1
    }

    fn reconstruct(f: &IndexedFactor) -> Array2<f64> {
        f.lower().dot(&f.lower().t())
    }

    fn submatrix(full: &Array2<f64>, dims: &[usize]) -> Array2<f64> {
        Array2::from_shape_fn((dims.len(), dims.len()), |(i, j)| full[(dims[i], dims[j])])
    }

    #[test]
    fn test_cholesky_factor_reconstructs() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]];
        let l = cholesky_factor(a.view()).unwrap();
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
        assert_eq!(l[(0, 1)], 0.0);
        assert_eq!(l[(1, 2)], 0.0);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            cholesky_factor(a.view()),
            Err(Error::NotPositiveDefinite { dim: 2 })
        ));
    }

    #[test]
    fn test_append_matches_from_scratch() {
        let full = spd(5, 7);
        let mut f = IndexedFactor::from_scratch(full.view(), &[0, 2]).unwrap();
        f.retarget(&[0, 2, 3], full.view()).unwrap();
        let scratch = IndexedFactor::from_scratch(full.view(), &[0, 2, 3]).unwrap();
        for (x, y) in f.lower().iter().zip(scratch.lower().iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_remove_middle_dimension() {
        let full = spd(6, 3);
        let mut l = cholesky_factor(full.view()).unwrap();
        cholesky_remove_dimension(&mut l, 2).unwrap();
        let expected = submatrix(&full, &[0, 1, 3, 4, 5]);
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
        for i in 0..5 {
            assert!(l[(i, i)] > 0.0);
        }
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut l = Array2::<f64>::eye(2);
        assert!(cholesky_remove_dimension(&mut l, 2).is_err());
    }

    #[test]
    fn test_append_rejects_dependent_dimension() {
        let mut l = Array2::<f64>::eye(1);
        // variance equals the explained part: zero residual
        let row = array![1.0, 1.0];
        assert!(cholesky_append_dimension(&mut l, row.view()).is_err());
    }

    #[test]
    fn test_update_identity_round_trip() {
        let full = spd(4, 11);
        let f = IndexedFactor::from_scratch(full.view(), &[1, 3]).unwrap();
        let g = update_factor_from_previous(&f, &[1, 3], full.view()).unwrap();
        assert_eq!(f, g);
    }

    #[test]
    fn test_mahalanobis_and_log_det() {
        let full = array![[2.0, 0.0], [0.0, 8.0]];
        let f = IndexedFactor::from_scratch(full.view(), &[0, 1]).unwrap();
        assert_abs_diff_eq!(f.log_det(), (16.0f64).ln(), epsilon = 1e-12);
        let diff = array![2.0, 4.0];
        assert_abs_diff_eq!(f.mahalanobis(diff.view()), 2.0 + 2.0, epsilon = 1e-12);
        let x = f.solve(diff.view());
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_factor() {
        let f = IndexedFactor::empty();
        assert!(f.is_empty());
        assert_eq!(f.log_det(), 0.0);
        assert_eq!(f.mahalanobis(Array1::<f64>::zeros(0).view()), 0.0);
    }

    proptest! {
        #[test]
        fn retarget_reproduces_submatrix(
            from in proptest::collection::vec(any::<bool>(), 6),
            to in proptest::collection::vec(any::<bool>(), 6),
            seed in 0u64..1000,
        ) {
            let full = spd(6, seed);
            let from_dims: Vec<usize> = (0..6).filter(|&d| from[d]).collect();
            let to_dims: Vec<usize> = (0..6).filter(|&d| to[d]).collect();

            let f = IndexedFactor::from_scratch(full.view(), &from_dims).unwrap();
            let g = update_factor_from_previous(&f, &to_dims, full.view()).unwrap();

            let mut sorted = g.dims().to_vec();
            sorted.sort_unstable();
            prop_assert_eq!(&sorted, &to_dims);

            let expected = submatrix(&full, g.dims());
            let back = reconstruct(&g);
            for (x, y) in back.iter().zip(expected.iter()) {
                prop_assert!((x - y).abs() < 1e-8);
            }
        }
    }
}
