//! U-statistic estimation of AUC moments (Gallas 2009).
//!
//! For every reader the Wilcoxon-Mann-Whitney kernel compares each disease
//! score against each normal score. The eight moments are products of the
//! weighted kernel matrices of the slot's two modalities, summed at eight
//! levels of pooling:
//!
//! | moment | indices that differ between the two factors |
//! |--------|---------------------------------------------|
//! | M1 | none |
//! | M2 | normal case |
//! | M3 | disease case |
//! | M4 | normal and disease case |
//! | M5 | reader |
//! | M6 | reader and normal case |
//! | M7 | reader and disease case |
//! | M8 | everything |
//!
//! The raw (biased) sums include the coincident terms; the bias-to-unbias
//! transform removes them so that each moment averages only over the pairs
//! its level describes.

use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::matrix::{
    BIAS_TO_UNBIAS, col_sums, dot_total, from_rows, hadamard_total, is_negligible, outer,
    row_sums, total,
};
use crate::study::ScoreTensors;
use crate::types::{Coefficients, MOMENT_COUNT, Moments};

/// Every reader carries the same weight.
const READER_WEIGHT: f64 = 1.0;

#[derive(Error, Debug)]
pub enum CovarianceError {
    #[error("Design coefficient computation was cancelled after {readers_done} of {readers} readers.")]
    Cancelled { readers_done: usize, readers: usize },
}

/// AUC under each of a slot's two modalities. `None` when no pair was scored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AucPair {
    pub a: Option<f64>,
    pub b: Option<f64>,
}

/// Moments, coefficients and AUCs of one slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotEstimate {
    pub biased: Moments,
    pub unbiased: Moments,
    pub coefficients: Coefficients,
    pub reader_aucs: Vec<AucPair>,
    /// Pair-count weighted average over readers.
    pub auc: AucPair,
}

impl SlotEstimate {
    /// True when at least one reader scored a pair under both modalities.
    pub fn has_observations(&self) -> bool {
        self.auc.a.is_some() && self.auc.b.is_some()
    }
}

/// Weighted matrix of one modality with its marginal sums.
#[derive(Clone, Debug)]
struct MarginalSums {
    matrix: Array2<f64>,
    cols: Array1<f64>,
    rows: Array1<f64>,
    total: f64,
}

impl MarginalSums {
    fn from_matrix(matrix: Array2<f64>) -> Self {
        let view = matrix.view();
        let cols = col_sums(&view);
        let rows = row_sums(&view);
        let total = total(&view);
        Self {
            matrix,
            cols,
            rows,
            total,
        }
    }

    fn zeros(normals: usize, diseases: usize) -> Self {
        Self {
            matrix: Array2::zeros((normals, diseases)),
            cols: Array1::zeros(diseases),
            rows: Array1::zeros(normals),
            total: 0.0,
        }
    }

    fn accumulate(&mut self, other: &Self) {
        self.matrix += &other.matrix;
        self.cols += &other.cols;
        self.rows += &other.rows;
        self.total += other.total;
    }

    /// The four cross products feeding one half of the moment vector:
    /// no pooling, pooled normals, pooled diseases, pooled both.
    fn cross(&self, other: &Self) -> [f64; 4] {
        [
            hadamard_total(&self.matrix.view(), &other.matrix.view()),
            dot_total(&self.cols.view(), &other.cols.view()),
            dot_total(&self.rows.view(), &other.rows.view()),
            self.total * other.total,
        ]
    }
}

/// Three-way Wilcoxon-Mann-Whitney kernel on `disease - normal`.
#[inline]
fn wmw_kernel(difference: f64) -> f64 {
    if difference > 0.0 {
        1.0
    } else if difference == 0.0 {
        0.5
    } else {
        0.0
    }
}

/// One reader's view of one modality of the slot.
struct ReaderTerms {
    design: MarginalSums,
    kernel: MarginalSums,
    pairs: f64,
}

impl ReaderTerms {
    fn new(tensors: &ScoreTensors, reader: usize, modality: usize) -> Self {
        let t0 = tensors.t0();
        let t1 = tensors.t1();
        let d0 = tensors.d0();
        let d1 = tensors.d1();
        let normal_scores = t0.slice(s![.., reader, modality]);
        let disease_scores = t1.slice(s![.., reader, modality]);
        let presence = outer(
            &d0.slice(s![.., reader, modality]),
            &d1.slice(s![.., reader, modality]),
        );
        let pairs = presence.sum();

        let weighted = presence * READER_WEIGHT;
        let kernel = Array2::from_shape_fn(weighted.dim(), |(i, j)| {
            let w = weighted[[i, j]];
            if w == 0.0 {
                0.0
            } else {
                w * wmw_kernel(disease_scores[j] - normal_scores[i])
            }
        });

        Self {
            design: MarginalSums::from_matrix(weighted),
            kernel: MarginalSums::from_matrix(kernel),
            pairs,
        }
    }

    fn auc(&self) -> Option<f64> {
        (self.pairs > 0.0).then(|| self.kernel.total / self.pairs)
    }
}

/// Running AUC numerator and weight for one modality.
#[derive(Default)]
struct AucAccumulator {
    weighted_auc: f64,
    weight: f64,
}

impl AucAccumulator {
    fn add(&mut self, terms: &ReaderTerms, auc: Option<f64>) {
        if let Some(auc) = auc {
            self.weighted_auc += terms.pairs * auc;
            self.weight += READER_WEIGHT * terms.pairs;
        }
    }

    fn average(&self) -> Option<f64> {
        (self.weight > 0.0).then(|| self.weighted_auc / self.weight)
    }
}

/// Estimates the slot's biased and unbiased moments, its coefficients, and
/// the per-reader and reader-averaged AUCs.
///
/// Cost is `O(readers * normals * diseases)`.
pub fn estimate(tensors: &ScoreTensors) -> SlotEstimate {
    let size = tensors.size();
    let mut raw_numer = Array1::<f64>::zeros(MOMENT_COUNT);
    let mut raw_denom = Array1::<f64>::zeros(MOMENT_COUNT);
    let mut pooled = [
        MarginalSums::zeros(size.normals, size.diseases),
        MarginalSums::zeros(size.normals, size.diseases),
        MarginalSums::zeros(size.normals, size.diseases),
        MarginalSums::zeros(size.normals, size.diseases),
    ];
    let mut auc_a = AucAccumulator::default();
    let mut auc_b = AucAccumulator::default();
    let mut reader_aucs = Vec::with_capacity(size.readers);

    for reader in 0..size.readers {
        let a = ReaderTerms::new(tensors, reader, 0);
        let b = ReaderTerms::new(tensors, reader, 1);

        add_cross(&mut raw_denom, 0, a.design.cross(&b.design));
        add_cross(&mut raw_numer, 0, a.kernel.cross(&b.kernel));

        let [design_a, kernel_a, design_b, kernel_b] = &mut pooled;
        design_a.accumulate(&a.design);
        kernel_a.accumulate(&a.kernel);
        design_b.accumulate(&b.design);
        kernel_b.accumulate(&b.kernel);

        let reader_auc = AucPair {
            a: a.auc(),
            b: b.auc(),
        };
        auc_a.add(&a, reader_auc.a);
        auc_b.add(&b, reader_auc.b);
        reader_aucs.push(reader_auc);
    }

    let [design_a, kernel_a, design_b, kernel_b] = &pooled;
    add_cross(&mut raw_denom, 4, design_a.cross(design_b));
    add_cross(&mut raw_numer, 4, kernel_a.cross(kernel_b));

    let bias_to_unbias = from_rows(&BIAS_TO_UNBIAS);
    let numer = bias_to_unbias.dot(&raw_numer);
    let denom = bias_to_unbias.dot(&raw_denom);

    let biased = ratio(&raw_numer, &raw_denom);
    let unbiased = ratio(&numer, &denom);
    let coefficients = coefficients_from_denominators(&denom, auc_a.weight, auc_b.weight);

    SlotEstimate {
        biased: Moments::new(biased),
        unbiased: Moments::new(unbiased),
        coefficients,
        reader_aucs,
        auc: AucPair {
            a: auc_a.average(),
            b: auc_b.average(),
        },
    }
}

/// Coefficients of a design without scores. Equivalent to the coefficients
/// returned by [`estimate`], but skips the kernels and readers with no pairs.
/// `cancel` is polled once per reader.
pub fn design_coefficients(
    tensors: &ScoreTensors,
    cancel: Option<&AtomicBool>,
) -> Result<Coefficients, CovarianceError> {
    let size = tensors.size();
    let d0 = tensors.d0();
    let d1 = tensors.d1();
    let mut raw_denom = Array1::<f64>::zeros(MOMENT_COUNT);
    let mut pooled_a = MarginalSums::zeros(size.normals, size.diseases);
    let mut pooled_b = MarginalSums::zeros(size.normals, size.diseases);
    let mut weight_a = 0.0;
    let mut weight_b = 0.0;

    for reader in 0..size.readers {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(CovarianceError::Cancelled {
                readers_done: reader,
                readers: size.readers,
            });
        }

        let normals_a = d0.slice(s![.., reader, 0]);
        let diseases_a = d1.slice(s![.., reader, 0]);
        let normals_b = d0.slice(s![.., reader, 1]);
        let diseases_b = d1.slice(s![.., reader, 1]);
        let empty = |v: &ArrayView1<f64>| v.iter().all(|&p| p == 0.0);
        let reads_a = !empty(&normals_a) && !empty(&diseases_a);
        let reads_b = !empty(&normals_b) && !empty(&diseases_b);
        if !reads_a && !reads_b {
            continue;
        }

        let a = MarginalSums::from_matrix(outer(&normals_a, &diseases_a) * READER_WEIGHT);
        let b = MarginalSums::from_matrix(outer(&normals_b, &diseases_b) * READER_WEIGHT);
        if reads_a && reads_b {
            add_cross(&mut raw_denom, 0, a.cross(&b));
        }
        weight_a += a.total;
        weight_b += b.total;
        pooled_a.accumulate(&a);
        pooled_b.accumulate(&b);
    }
    add_cross(&mut raw_denom, 4, pooled_a.cross(&pooled_b));

    let denom = from_rows(&BIAS_TO_UNBIAS).dot(&raw_denom);
    Ok(coefficients_from_denominators(&denom, weight_a, weight_b))
}

fn add_cross(target: &mut Array1<f64>, offset: usize, cross: [f64; 4]) {
    for (k, value) in cross.into_iter().enumerate() {
        target[offset + k] += value;
    }
}

/// Moment-wise `numer / denom`, keeping the numerator where the denominator
/// is negligible.
fn ratio(numer: &Array1<f64>, denom: &Array1<f64>) -> Array1<f64> {
    Array1::from_shape_fn(numer.len(), |k| {
        if is_negligible(denom[k], READER_WEIGHT) {
            numer[k]
        } else {
            numer[k] / denom[k]
        }
    })
}

/// `denom / (weight_a * weight_b)` with the last entry reduced by one. A slot
/// without observations gets all-zero coefficients.
fn coefficients_from_denominators(
    denom: &Array1<f64>,
    weight_a: f64,
    weight_b: f64,
) -> Coefficients {
    let scale = weight_a * weight_b;
    if scale <= 0.0 {
        return Coefficients::zeros();
    }
    let mut coefficients = denom / scale;
    coefficients[MOMENT_COUNT - 1] -= 1.0;
    Coefficients::new(coefficients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::ExperimentSize;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Builds AA-style tensors where both slot modalities carry `normals`/`diseases`
    /// for every reader.
    fn replicated(readers: usize, normals: &[f64], diseases: &[f64]) -> ScoreTensors {
        let size = ExperimentSize::new(readers, normals.len(), diseases.len()).unwrap();
        let t0 = Array3::from_shape_fn((normals.len(), readers, 2), |(i, _, _)| normals[i]);
        let t1 = Array3::from_shape_fn((diseases.len(), readers, 2), |(j, _, _)| diseases[j]);
        let d0 = Array3::ones(t0.dim());
        let d1 = Array3::ones(t1.dim());
        ScoreTensors::new(&size, t0, t1, d0, d1).unwrap()
    }

    fn random_irregular(seed: u64, readers: usize, normals: usize, diseases: usize) -> ScoreTensors {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = ExperimentSize::new(readers, normals, diseases).unwrap();
        let t0 = Array3::from_shape_fn((normals, readers, 2), |_| rng.gen_range(0.0..1.0));
        let t1 = Array3::from_shape_fn((diseases, readers, 2), |_| rng.gen_range(0.3..1.3));
        let d0 = Array3::from_shape_fn((normals, readers, 2), |_| {
            if rng.gen_bool(0.8) { 1.0 } else { 0.0 }
        });
        let d1 = Array3::from_shape_fn((diseases, readers, 2), |_| {
            if rng.gen_bool(0.8) { 1.0 } else { 0.0 }
        });
        ScoreTensors::new(&size, t0, t1, d0, d1).unwrap()
    }

    #[test]
    fn test_kernel_tie_rule() {
        assert_eq!(wmw_kernel(0.2), 1.0);
        assert_eq!(wmw_kernel(0.0), 0.5);
        assert_eq!(wmw_kernel(-0.2), 0.0);
    }

    #[test]
    fn test_perfect_separation_gives_unit_auc() {
        let est = estimate(&replicated(2, &[0.1, 0.2], &[0.8, 0.9]));
        assert_eq!(est.auc.a, Some(1.0));
        assert_eq!(est.auc.b, Some(1.0));
        for reader in &est.reader_aucs {
            assert_eq!(reader.a, Some(1.0));
        }
        // A constant kernel makes every moment equal to AUC squared.
        for k in 0..MOMENT_COUNT {
            assert_abs_diff_eq!(est.unbiased[k], 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(est.biased[k], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_all_ties_give_half() {
        let est = estimate(&replicated(3, &[0.4, 0.4, 0.4], &[0.4, 0.4]));
        assert_eq!(est.auc.a, Some(0.5));
        assert!(est.reader_aucs.iter().all(|r| r.a == Some(0.5) && r.b == Some(0.5)));
    }

    #[test]
    fn test_hand_computed_auc() {
        // Pairs (n, d): (0.1, 0.3) 1, (0.1, 0.9) 1, (0.5, 0.3) 0, (0.5, 0.9) 1.
        let est = estimate(&replicated(1, &[0.1, 0.5], &[0.3, 0.9]));
        assert_abs_diff_eq!(est.auc.a.unwrap(), 0.75, epsilon = 1e-15);
        // M1 is the mean squared kernel.
        assert_abs_diff_eq!(est.unbiased[0], 0.75, epsilon = 1e-15);
    }

    #[test]
    fn test_fully_crossed_coefficients_match_closed_form() {
        let est = estimate(&replicated(2, &[0.1, 0.6], &[0.2, 0.5, 0.9]));
        let (nr, n0, n1) = (2.0, 2.0, 3.0);
        let c0 = 1.0 / (nr * n0 * n1);
        assert_abs_diff_eq!(est.coefficients[0], c0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            est.coefficients[7],
            c0 * (n0 - 1.0) * (n1 - 1.0) * (nr - 1.0) - 1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_no_pairs_gives_unavailable_auc() {
        let size = ExperimentSize::new(2, 2, 2).unwrap();
        let zeros = Array3::<f64>::zeros((2, 2, 2));
        let tensors = ScoreTensors::design_only(&size, zeros.clone(), zeros).unwrap();
        let est = estimate(&tensors);
        assert_eq!(est.auc.a, None);
        assert!(!est.has_observations());
        assert!(est.coefficients.iter().all(|&c| c == 0.0));
        assert!(est.reader_aucs.iter().all(|r| r.a.is_none()));
    }

    #[test]
    fn test_design_coefficients_agree_with_estimator() {
        for seed in [3_u64, 17, 99] {
            let tensors = random_irregular(seed, 4, 6, 5);
            let from_scores = estimate(&tensors).coefficients;
            let from_design = design_coefficients(&tensors, None).unwrap();
            for k in 0..MOMENT_COUNT {
                assert_abs_diff_eq!(from_scores[k], from_design[k], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_design_coefficients_cancellation() {
        let tensors = random_irregular(5, 3, 4, 4);
        let flag = AtomicBool::new(true);
        let result = design_coefficients(&tensors, Some(&flag));
        assert!(matches!(
            result,
            Err(CovarianceError::Cancelled { readers_done: 0, readers: 3 })
        ));
    }

    #[test]
    fn test_biased_moments_are_plain_ratios() {
        let tensors = random_irregular(11, 3, 5, 4);
        let est = estimate(&tensors);
        // M8 biased is the product of the pooled AUC numerators over their weights,
        // which for a slot with identical modality designs is the squared AUC.
        let aa = {
            let size = tensors.size();
            let t0 = Array3::from_shape_fn(tensors.t0().dim(), |(i, r, _)| tensors.t0()[[i, r, 0]]);
            let t1 = Array3::from_shape_fn(tensors.t1().dim(), |(j, r, _)| tensors.t1()[[j, r, 0]]);
            let d0 = Array3::from_shape_fn(tensors.d0().dim(), |(i, r, _)| tensors.d0()[[i, r, 0]]);
            let d1 = Array3::from_shape_fn(tensors.d1().dim(), |(j, r, _)| tensors.d1()[[j, r, 0]]);
            estimate(&ScoreTensors::new(&size, t0, t1, d0, d1).unwrap())
        };
        let auc = aa.auc.a.unwrap();
        assert_abs_diff_eq!(aa.biased[7], auc * auc, epsilon = 1e-12);
        assert!(est.biased.iter().all(|m| m.is_finite()));
    }
}
