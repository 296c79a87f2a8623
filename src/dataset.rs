//! Row-access view of training data.
//!
//! Missing entries are NaN. Training materialises a [`Dataset`] once into an
//! `Array2<f64>`; nothing downstream keeps a reference to the source.

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use std::borrow::Cow;

/// Random-access rows of equal width.
pub trait Dataset {
    /// Number of rows.
    fn n_samples(&self) -> usize;

    /// Number of columns.
    fn width(&self) -> usize;

    /// Row `i` (NaN marks a missing value).
    fn row(&self, i: usize) -> Cow<'_, [f64]>;
}

impl Dataset for Array2<f64> {
    fn n_samples(&self) -> usize {
        self.nrows()
    }

    fn width(&self) -> usize {
        self.ncols()
    }

    fn row(&self, i: usize) -> Cow<'_, [f64]> {
        let row = self.row(i);
        match row.to_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(row.to_vec()),
        }
    }
}

impl Dataset for [Vec<f64>] {
    fn n_samples(&self) -> usize {
        self.len()
    }

    fn width(&self) -> usize {
        self.first().map_or(0, Vec::len)
    }

    fn row(&self, i: usize) -> Cow<'_, [f64]> {
        Cow::Borrowed(&self[i])
    }
}

impl Dataset for Vec<Vec<f64>> {
    fn n_samples(&self) -> usize {
        self.as_slice().n_samples()
    }

    fn width(&self) -> usize {
        self.as_slice().width()
    }

    fn row(&self, i: usize) -> Cow<'_, [f64]> {
        Cow::Borrowed(&self[i])
    }
}

/// Copy a dataset into a dense matrix, checking every row's width.
pub fn to_array<D: Dataset + ?Sized>(data: &D) -> Result<Array2<f64>> {
    let n = data.n_samples();
    let d = data.width();
    if n == 0 || d == 0 {
        return Err(Error::EmptyInput);
    }
    let mut flat = Vec::with_capacity(n * d);
    for i in 0..n {
        let row = data.row(i);
        if row.len() != d {
            return Err(Error::DimensionMismatch {
                expected: d,
                found: row.len(),
            });
        }
        flat.extend_from_slice(&row);
    }
    Array2::from_shape_vec((n, d), flat).map_err(|e| Error::Other(e.to_string()))
}

/// Per-feature mean and standard deviation over observed values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStats {
    /// Mean of each column.
    pub mean: Array1<f64>,
    /// Population standard deviation of each column.
    pub std: Array1<f64>,
}

impl FeatureStats {
    /// Column statistics ignoring NaN. A column with no observed value gets
    /// mean 0 and standard deviation 1.
    pub fn from_data(data: ArrayView2<'_, f64>) -> Self {
        let d = data.ncols();
        let mut mean = Array1::zeros(d);
        let mut std = Array1::ones(d);
        for (j, column) in data.columns().into_iter().enumerate() {
            let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
            if observed.is_empty() {
                continue;
            }
            let m = observed.iter().sum::<f64>() / observed.len() as f64;
            let var = observed.iter().map(|v| (v - m).powi(2)).sum::<f64>() / observed.len() as f64;
            mean[j] = m;
            std[j] = var.sqrt();
        }
        Self { mean, std }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_vec_dataset_to_array() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, f64::NAN]];
        let arr = to_array(&rows).unwrap();
        assert_eq!(arr.dim(), (2, 2));
        assert!(arr[(1, 1)].is_nan());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert_eq!(
            to_array(&rows),
            Err(Error::DimensionMismatch {
                expected: 2,
                found: 1
            })
        );
        let empty: Vec<Vec<f64>> = Vec::new();
        assert_eq!(to_array(&empty), Err(Error::EmptyInput));
    }

    #[test]
    fn test_feature_stats_skip_missing() {
        let data = array![[1.0, f64::NAN], [3.0, f64::NAN], [f64::NAN, f64::NAN]];
        let stats = FeatureStats::from_data(data.view());
        assert_abs_diff_eq!(stats.mean[0], 2.0);
        assert_abs_diff_eq!(stats.std[0], 1.0);
        assert_eq!(stats.mean[1], 0.0);
        assert_eq!(stats.std[1], 1.0);
    }

    #[test]
    fn test_array_dataset_rows() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        assert_eq!(Dataset::row(&data, 1).as_ref(), &[3.0, 4.0]);
        assert_eq!(data.width(), 2);
    }
}
