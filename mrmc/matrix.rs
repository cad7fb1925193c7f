//! Dense linear-algebra helpers and the fixed transforms between variance
//! representations.
//!
//! All component tables are `4 x k` matrices whose rows are modality A,
//! modality B, the A/B covariance and the A-B difference. A transform `T`
//! with shape `k' x k` maps a table `X` to `(T Xᵀ)ᵀ = X Tᵀ`, which is what
//! [`transform_rows`] computes.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::study::ExperimentSize;

/// Eight-by-eight lower-triangular map from raw (biased) nested sums to the
/// sums of the U-statistic, Gallas 2009 Table 1. Row `k` holds moment `k + 1`.
pub const BIAS_TO_UNBIAS: [[f64; 8]; 8] = [
    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [-1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0, -1.0, -1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
    [1.0, -1.0, 0.0, 0.0, -1.0, 1.0, 0.0, 0.0],
    [1.0, 0.0, -1.0, 0.0, -1.0, 0.0, 1.0, 0.0],
    [-1.0, 1.0, 1.0, -1.0, 1.0, -1.0, -1.0, 1.0],
];

/// BDG moments to BCK components. Columns are M1..M8, rows are the BCK
/// components N, D, ND, R, NR, DR, NDR.
pub const BDG_TO_BCK: [[f64; 8]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0],
    [0.0, 0.0, 0.0, 0.0, 1.0, -1.0, -1.0, 1.0],
    [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
    [0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0, 1.0],
    [0.0, 1.0, 0.0, -1.0, 0.0, -1.0, 0.0, 1.0],
    [1.0, -1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0],
];

/// BDG coefficients to BCK coefficients: each BCK coefficient is the sum of
/// the BDG coefficients of the moments that contain that component.
pub const BDG_COEFF_TO_BCK: [[f64; 8]; 7] = [
    [1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0],
    [1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
    [1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
    [1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
];

/// Builds an owned matrix from a fixed-size row array.
pub fn from_rows<const R: usize, const C: usize>(rows: &[[f64; C]; R]) -> Array2<f64> {
    Array2::from_shape_fn((R, C), |(i, j)| rows[i][j])
}

/// Sum of each row (length = number of rows).
#[inline]
pub fn row_sums(matrix: &ArrayView2<f64>) -> Array1<f64> {
    matrix.sum_axis(Axis(1))
}

/// Sum of each column (length = number of columns).
#[inline]
pub fn col_sums(matrix: &ArrayView2<f64>) -> Array1<f64> {
    matrix.sum_axis(Axis(0))
}

/// Sum of every element.
#[inline]
pub fn total(matrix: &ArrayView2<f64>) -> f64 {
    matrix.sum()
}

/// Outer product `a bᵀ`.
pub fn outer(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> Array2<f64> {
    let column = a.view().insert_axis(Axis(1));
    let row = b.view().insert_axis(Axis(0));
    &column * &row
}

/// `Σ a ∘ b` for two arrays of the same shape.
#[inline]
pub fn hadamard_total(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// `Σ a ∘ b` for two vectors of the same length.
#[inline]
pub fn dot_total(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.dot(b)
}

/// Applies a `k' x k` transform to every row of a `4 x k` table.
pub fn transform_rows(table: &ArrayView2<f64>, transform: &ArrayView2<f64>) -> Array2<f64> {
    table.dot(&transform.t())
}

/// Denominators at or below half the smallest reader weight are treated as
/// empty. Shared by the moment estimator and the component model.
#[inline]
pub fn is_negligible(denominator: f64, min_weight: f64) -> bool {
    denominator <= min_weight / 2.0
}

/// Inverse of the bias-to-unbias relationship for a fully crossed study:
/// maps unbiased moments to the plug-in (MLE) moments.
pub fn unbias_to_bias(size: &ExperimentSize) -> Array2<f64> {
    let (nr, n0, n1) = size.as_f64();
    let a0 = 1.0 / n0;
    let b0 = (n0 - 1.0) / n0;
    let a1 = 1.0 / n1;
    let b1 = (n1 - 1.0) / n1;
    let ar = 1.0 / nr;
    let br = (nr - 1.0) / nr;

    // Each biased moment mixes the unbiased moments whose pooling it contains.
    let mut matrix = Array2::<f64>::zeros((8, 8));
    let normal = [a0, b0];
    let disease = [a1, b1];
    let reader = [ar, br];
    for row in 0..8 {
        let pools_normal = row & 1 == 1;
        let pools_disease = row & 2 == 2;
        let pools_reader = row & 4 == 4;
        for col in 0..8 {
            // A moment can only draw on moments that pool a subset of its dimensions.
            if (col & !row) != 0 {
                continue;
            }
            let mut weight = 1.0;
            if pools_normal {
                weight *= normal[col & 1];
            }
            if pools_disease {
                weight *= disease[(col >> 1) & 1];
            }
            if pools_reader {
                weight *= reader[(col >> 2) & 1];
            }
            matrix[[row, col]] = weight;
        }
    }
    matrix
}

/// Pools scaled BCK components into the three DBM building blocks
/// (reader, case, reader x case).
pub fn bck_to_dbm_pooling(readers: f64) -> Array2<f64> {
    from_rows(&[
        [0.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [readers, 0.0, 0.0],
        [0.0, 0.0, readers],
        [0.0, 0.0, readers],
        [0.0, 0.0, readers],
    ])
}

/// Per-component scaling applied to BCK before pooling into DBM.
pub fn bck_scaling(size: &ExperimentSize) -> Array1<f64> {
    let (nr, n0, n1) = size.as_f64();
    Array1::from(vec![
        1.0 / n0,
        1.0 / n1,
        1.0 / (n0 * n1),
        1.0 / nr,
        1.0 / (n0 * nr),
        1.0 / (n1 * nr),
        1.0 / (n0 * n1 * nr),
    ])
}

/// DBM components to expected mean squares.
pub fn dbm_to_ms(size: &ExperimentSize) -> Array2<f64> {
    let (nr, n0, n1) = size.as_f64();
    let cases = n0 + n1;
    from_rows(&[
        [2.0 * cases, 0.0, 2.0, cases, 0.0, 1.0],
        [0.0, 2.0 * nr, 2.0, 0.0, nr, 1.0],
        [0.0, 0.0, 2.0, 0.0, 0.0, 1.0],
        [0.0, 0.0, 0.0, cases, 0.0, 1.0],
        [0.0, 0.0, 0.0, 0.0, nr, 1.0],
        [0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
    ])
}
