//! Variance component representations of a reader-averaged AUC.
//!
//! Every representation is a `4 x k` table with rows modality A, modality B,
//! covariance and difference, plus a coefficient table of the same shape and
//! a table built from the biased moments. Whatever the representation,
//!
//! ```text
//! Σ_k coefficients[Difference][k] * components[Difference][k] = total variance
//! ```
//!
//! | name | columns |
//! |------|---------|
//! | BDG  | moments M1..M8 |
//! | BCK  | normal (N), disease (D), reader (R) and their products ND, NR, DR, NDR |
//! | DBM  | reader R, case C, RC, and their modality interactions TR, TC, TRC |
//! | OR   | reader R, modality x reader TR, covariances COV1..COV3, error |
//! | MS   | mean squares of R, C, RC and of their modality terms MR, MC, MRC |
//!
//! BDG and BCK exist for every design. DBM, OR and MS assume a fully crossed
//! study and are only built for one.

use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::covariance::{AucPair, SlotEstimate};
use crate::matrix::{
    BDG_COEFF_TO_BCK, BDG_TO_BCK, bck_scaling, bck_to_dbm_pooling, dbm_to_ms, from_rows,
    transform_rows, unbias_to_bias,
};
use crate::study::{ExperimentSize, StudyError};
use crate::types::{Coefficients, Estimator, MOMENT_COUNT, Moments, Slot, TableRow};

/// BCK covariance coefficients below this magnitude are structural zeros.
const STRUCTURAL_ZERO: f64 = 1e-12;

/// Relative size below which a total variance is rounding noise.
const TOTAL_VARIANCE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("At least one slot of moments is required to assemble variance components.")]
    NoSlots,

    #[error("Moment vectors must have {MOMENT_COUNT} entries, but slot {slot:?} has {found}.")]
    MomentLength { slot: Slot, found: usize },

    #[error("Experiment size is invalid: {0}")]
    Size(#[from] StudyError),
}

/// Names of the five representations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    Bdg,
    Bck,
    Dbm,
    Or,
    Ms,
}

impl Representation {
    pub const ALL: [Representation; 5] = [
        Representation::Bdg,
        Representation::Bck,
        Representation::Dbm,
        Representation::Or,
        Representation::Ms,
    ];
}

/// One representation: unbiased components, biased components and coefficients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentTable {
    pub components: Array2<f64>,
    pub biased: Array2<f64>,
    pub coefficients: Array2<f64>,
}

impl ComponentTable {
    pub fn row(&self, row: TableRow) -> ArrayView1<'_, f64> {
        self.components.row(row.index())
    }

    /// `Σ coefficient * component` along one row of the unbiased table.
    pub fn total_variance(&self, row: TableRow) -> f64 {
        weighted_sum(&self.coefficients, &self.components, row)
    }

    /// `Σ coefficient * component` along one row of the biased table.
    pub fn total_variance_biased(&self, row: TableRow) -> f64 {
        weighted_sum(&self.coefficients, &self.biased, row)
    }
}

fn weighted_sum(coefficients: &Array2<f64>, components: &Array2<f64>, row: TableRow) -> f64 {
    coefficients
        .row(row.index())
        .dot(&components.row(row.index()))
}

/// Moments and coefficients of one slot, detached from the score data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotMoments {
    pub unbiased: Moments,
    pub biased: Moments,
    pub coefficients: Coefficients,
}

impl SlotMoments {
    /// Summary input: unbiased moments of a fully crossed study. The biased
    /// moments and the coefficients follow from the experiment size.
    pub fn from_unbiased(unbiased: Moments, size: &ExperimentSize) -> Self {
        let biased = Moments::new(unbias_to_bias(size).dot(&unbiased.0));
        Self {
            unbiased,
            biased,
            coefficients: bdg_coefficients(size),
        }
    }
}

impl From<&SlotEstimate> for SlotMoments {
    fn from(estimate: &SlotEstimate) -> Self {
        Self {
            unbiased: estimate.unbiased.clone(),
            biased: estimate.biased.clone(),
            coefficients: estimate.coefficients.clone(),
        }
    }
}

/// Slots available to an analysis. One-modality analyses fill a single slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MomentTable {
    pub aa: Option<SlotMoments>,
    pub bb: Option<SlotMoments>,
    pub ab: Option<SlotMoments>,
}

impl MomentTable {
    pub fn get(&self, slot: Slot) -> Option<&SlotMoments> {
        match slot {
            Slot::AA => self.aa.as_ref(),
            Slot::BB => self.bb.as_ref(),
            Slot::AB => self.ab.as_ref(),
        }
    }

    pub fn set(&mut self, slot: Slot, moments: SlotMoments) {
        match slot {
            Slot::AA => self.aa = Some(moments),
            Slot::BB => self.bb = Some(moments),
            Slot::AB => self.ab = Some(moments),
        }
    }

    /// Same moments, coefficients taken from another design.
    pub fn with_coefficients(&self, coefficients: impl Fn(Slot) -> Coefficients) -> Self {
        let mut resized = Self::default();
        for slot in [Slot::AA, Slot::BB, Slot::AB] {
            if let Some(moments) = self.get(slot) {
                resized.set(
                    slot,
                    SlotMoments {
                        coefficients: coefficients(slot),
                        ..moments.clone()
                    },
                );
            }
        }
        resized
    }
}

/// Two-way ANOVA mean squares of the reader x modality AUC matrix.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeanSquares {
    /// Modality (treatment).
    pub ms_t: f64,
    /// Reader, pooled over modalities.
    pub ms_r: f64,
    pub ms_r_a: f64,
    pub ms_r_b: f64,
    /// Reader x modality interaction.
    pub ms_tr: f64,
}

impl MeanSquares {
    /// Needs both AUCs for every reader. A single reader has no reader
    /// variation; its reader and interaction mean squares are zero.
    pub fn from_reader_aucs(reader_aucs: &[AucPair]) -> Option<Self> {
        let pairs = reader_aucs
            .iter()
            .map(|p| Some((p.a?, p.b?)))
            .collect::<Option<Vec<(f64, f64)>>>()?;
        if pairs.is_empty() {
            return None;
        }
        let nr = pairs.len() as f64;
        let mean_a = pairs.iter().map(|p| p.0).sum::<f64>() / nr;
        let mean_b = pairs.iter().map(|p| p.1).sum::<f64>() / nr;
        let grand = (mean_a + mean_b) / 2.0;
        let reader_dof = (nr - 1.0).max(1.0);
        let modality_dof = 1.0;

        let ms_t = nr * ((mean_a - grand).powi(2) + (mean_b - grand).powi(2)) / modality_dof;
        let mut ms_tr = 0.0;
        let mut ms_r = 0.0;
        let mut ms_r_a = 0.0;
        let mut ms_r_b = 0.0;
        for &(a, b) in &pairs {
            let reader_mean = (a + b) / 2.0;
            ms_tr += (a - mean_a - reader_mean + grand).powi(2);
            ms_tr += (b - mean_b - reader_mean + grand).powi(2);
            ms_r += (reader_mean - grand).powi(2);
            ms_r_a += (a - mean_a).powi(2);
            ms_r_b += (b - mean_b).powi(2);
        }

        Some(Self {
            ms_t,
            ms_r: 2.0 * ms_r / reader_dof,
            ms_r_a: ms_r_a / reader_dof,
            ms_r_b: ms_r_b / reader_dof,
            ms_tr: ms_tr / reader_dof / modality_dof,
        })
    }
}

/// All representations of one analysis with its total variance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub size: ExperimentSize,
    pub fully_crossed: bool,
    pub bdg: ComponentTable,
    pub bck: ComponentTable,
    pub dbm: Option<ComponentTable>,
    pub or: Option<ComponentTable>,
    pub ms: Option<ComponentTable>,
    pub mean_squares: Option<MeanSquares>,
    pub total_var_unbiased: f64,
    pub total_var_biased: f64,
}

impl VarianceComponents {
    pub fn total_variance(&self, estimator: Estimator) -> f64 {
        match estimator {
            Estimator::Unbiased => self.total_var_unbiased,
            Estimator::Biased => self.total_var_biased,
        }
    }

    /// A zero total variance, as in a perfectly separated study, is not flagged.
    pub fn negative_variance(&self) -> bool {
        self.total_var_unbiased < 0.0
    }

    /// Hillis degrees of freedom need a fully crossed study, the OR table and
    /// the reader mean squares.
    pub fn hillis_available(&self) -> bool {
        self.fully_crossed && self.or.is_some() && self.mean_squares.is_some()
    }

    pub fn table(&self, representation: Representation) -> Option<&ComponentTable> {
        match representation {
            Representation::Bdg => Some(&self.bdg),
            Representation::Bck => Some(&self.bck),
            Representation::Dbm => self.dbm.as_ref(),
            Representation::Or => self.or.as_ref(),
            Representation::Ms => self.ms.as_ref(),
        }
    }
}

/// Closed-form BDG coefficients of a fully crossed study.
pub fn bdg_coefficients(size: &ExperimentSize) -> Coefficients {
    let (nr, n0, n1) = size.as_f64();
    let c0 = 1.0 / (nr * n0 * n1);
    Coefficients::new(Array1::from(vec![
        c0,
        c0 * (n0 - 1.0),
        c0 * (n1 - 1.0),
        c0 * (n0 - 1.0) * (n1 - 1.0),
        c0 * (nr - 1.0),
        c0 * (n0 - 1.0) * (nr - 1.0),
        c0 * (n1 - 1.0) * (nr - 1.0),
        c0 * (n1 - 1.0) * (n0 - 1.0) * (nr - 1.0) - 1.0,
    ]))
}

/// Builds every representation available for the design.
///
/// Fully crossed studies use the closed-form coefficients for every present
/// slot; other designs use the slot coefficients as given. Per-reader AUCs,
/// when supplied for a fully crossed study, give the reader mean squares and
/// the OR rows of the Hillis construction.
pub fn assemble(
    moments: &MomentTable,
    size: &ExperimentSize,
    fully_crossed: bool,
    reader_aucs: Option<&[AucPair]>,
) -> Result<VarianceComponents, ComponentError> {
    size.validate()?;
    let slots: Vec<Slot> = [Slot::AA, Slot::BB, Slot::AB]
        .into_iter()
        .filter(|&slot| moments.get(slot).is_some())
        .collect();
    if slots.is_empty() {
        return Err(ComponentError::NoSlots);
    }

    let mut bdg = Array2::<f64>::zeros((4, MOMENT_COUNT));
    let mut bdg_biased = Array2::<f64>::zeros((4, MOMENT_COUNT));
    let mut bdg_coeff = Array2::<f64>::zeros((4, MOMENT_COUNT));
    let closed_form = fully_crossed.then(|| bdg_coefficients(size));
    for &slot in &slots {
        let Some(slot_moments) = moments.get(slot) else {
            continue;
        };
        for vector in [&slot_moments.unbiased, &slot_moments.biased] {
            if vector.len() != MOMENT_COUNT {
                return Err(ComponentError::MomentLength {
                    slot,
                    found: vector.len(),
                });
            }
        }
        let row = slot.row().index();
        bdg.row_mut(row).assign(&slot_moments.unbiased.0);
        bdg_biased.row_mut(row).assign(&slot_moments.biased.0);
        let coefficients = closed_form.as_ref().unwrap_or(&slot_moments.coefficients);
        bdg_coeff.row_mut(row).assign(&coefficients.0);
    }
    log::debug!(
        "Assembling variance components for {:?} ({}fully crossed).",
        slots,
        if fully_crossed { "" } else { "not " }
    );
    fill_difference_row(&mut bdg, &bdg_coeff);
    fill_difference_row(&mut bdg_biased, &bdg_coeff);
    bdg_coeff.row_mut(TableRow::Difference.index()).fill(1.0);

    let bdg = ComponentTable {
        components: bdg,
        biased: bdg_biased,
        coefficients: bdg_coeff,
    };
    let total_var_unbiased = settle(
        bdg.total_variance(TableRow::Difference),
        &bdg.components,
        &bdg.coefficients,
    );
    let total_var_biased = settle(
        bdg.total_variance_biased(TableRow::Difference),
        &bdg.biased,
        &bdg.coefficients,
    );
    let bck = bdg_to_bck(&bdg);

    let mean_squares = if fully_crossed {
        reader_aucs.and_then(MeanSquares::from_reader_aucs)
    } else {
        None
    };

    let (dbm, or, ms) = if fully_crossed {
        let dbm = ComponentTable {
            components: bck_to_dbm(&bck.components, size),
            biased: bck_to_dbm(&bck.biased, size),
            coefficients: dbm_coefficients(size),
        };
        let mut or_components = dbm_to_or(&dbm.components, size);
        if let Some(ms) = &mean_squares {
            apply_hillis_rows(&mut or_components, &bdg.components, &slots, ms, size);
        }
        let or = ComponentTable {
            components: or_components,
            biased: dbm_to_or(&dbm.biased, size),
            coefficients: or_coefficients(size),
        };
        let ms = ComponentTable {
            components: dbm_to_mean_squares(&dbm.components, size),
            biased: dbm_to_mean_squares(&dbm.biased, size),
            coefficients: ms_coefficients(size),
        };
        (Some(dbm), Some(or), Some(ms))
    } else {
        (None, None, None)
    };

    Ok(VarianceComponents {
        size: *size,
        fully_crossed,
        bdg,
        bck,
        dbm,
        or,
        ms,
        mean_squares,
        total_var_unbiased,
        total_var_biased,
    })
}

/// Snaps a total variance to zero when it is cancellation noise: smaller than
/// [`TOTAL_VARIANCE_TOLERANCE`] times the largest weighted moment of the A, B
/// and covariance rows.
fn settle(total: f64, moments: &Array2<f64>, coefficients: &Array2<f64>) -> f64 {
    let weighted = moments.slice(s![0..3, ..]).to_owned() * coefficients.slice(s![0..3, ..]);
    let scale = weighted.iter().fold(0.0_f64, |largest, v| largest.max(v.abs()));
    if total.abs() <= TOTAL_VARIANCE_TOLERANCE * scale {
        0.0
    } else {
        total
    }
}

/// `Difference[k] = cA[k]·A[k] + cB[k]·B[k] - 2·cC[k]·C[k]`.
fn fill_difference_row(table: &mut Array2<f64>, coefficients: &Array2<f64>) {
    let weighted = table.slice(s![0..3, ..]).to_owned() * coefficients.slice(s![0..3, ..]);
    let difference = &weighted.row(0) + &weighted.row(1) - &(&weighted.row(2) * 2.0);
    table.row_mut(TableRow::Difference.index()).assign(&difference);
}

/// BDG to BCK for components, biased components and coefficients. Covariance
/// entries whose coefficient is a structural zero are forced to zero.
pub fn bdg_to_bck(bdg: &ComponentTable) -> ComponentTable {
    let to_bck = from_rows(&BDG_TO_BCK);
    let coeff_to_bck = from_rows(&BDG_COEFF_TO_BCK);

    let mut coefficients = transform_rows(&bdg.coefficients.view(), &coeff_to_bck.view());
    let mut components = transform_rows(&bdg.components.view(), &to_bck.view());
    let mut biased = transform_rows(&bdg.biased.view(), &to_bck.view());

    let cov = TableRow::Covariance.index();
    for k in 0..coefficients.ncols() {
        if coefficients[[cov, k]].abs() < STRUCTURAL_ZERO {
            coefficients[[cov, k]] = 0.0;
            components[[cov, k]] = 0.0;
            biased[[cov, k]] = 0.0;
        }
    }

    fill_difference_row(&mut components, &coefficients);
    fill_difference_row(&mut biased, &coefficients);
    coefficients.row_mut(TableRow::Difference.index()).fill(1.0);

    ComponentTable {
        components,
        biased,
        coefficients,
    }
}

/// BCK to DBM for a fully crossed study.
///
/// Each BCK row is scaled by its component sizes and pooled into reader (R),
/// case (C) and reader x case (RC) terms. The difference row keeps the pooled
/// covariance terms in R, C, RC and the modality interaction in TR, TC, TRC:
/// `TR = (A_R + B_R) / 2 - C_R`, and likewise for TC and TRC. The covariance
/// row itself is left empty.
pub fn bck_to_dbm(bck: &Array2<f64>, size: &ExperimentSize) -> Array2<f64> {
    let (nr, n0, n1) = size.as_f64();
    let cases = n0 + n1;
    let scaled = bck.slice(s![0..3, ..]).to_owned() * &bck_scaling(size);
    let pooled = scaled.dot(&bck_to_dbm_pooling(nr));

    let mut dbm = Array2::<f64>::zeros((4, 6));
    for row in [TableRow::ModalityA, TableRow::ModalityB] {
        let p = pooled.row(row.index());
        dbm.row_mut(row.index())
            .assign(&Array1::from(vec![p[0], p[1] * cases, p[2] * cases, 0.0, 0.0, 0.0]));
    }
    let a = pooled.row(0);
    let b = pooled.row(1);
    let c = pooled.row(2);
    dbm.row_mut(TableRow::Difference.index()).assign(&Array1::from(vec![
        c[0],
        c[1] * cases,
        c[2] * cases,
        (a[0] + b[0]) / 2.0 - c[0],
        ((a[1] + b[1]) / 2.0 - c[1]) * cases,
        ((a[2] + b[2]) / 2.0 - c[2]) * cases,
    ]));
    dbm
}

pub fn dbm_coefficients(size: &ExperimentSize) -> Array2<f64> {
    let (nr, n0, n1) = size.as_f64();
    let cases = n0 + n1;
    let single = [1.0 / nr, 1.0 / cases, 1.0 / (nr * cases), 0.0, 0.0, 0.0];
    from_rows(&[
        single,
        single,
        [0.0; 6],
        [0.0, 0.0, 0.0, 2.0 / nr, 2.0 / cases, 2.0 / (nr * cases)],
    ])
}

/// DBM to OR (Hillis 2014, Eqs 11-14).
pub fn dbm_to_or(dbm: &Array2<f64>, size: &ExperimentSize) -> Array2<f64> {
    let cases = size.cases() as f64;
    let mut or = Array2::<f64>::zeros((4, 6));
    for (i, d) in dbm.rows().into_iter().enumerate() {
        or.row_mut(i).assign(&Array1::from(vec![
            d[0],
            d[3],
            (d[1] + d[2]) / cases,
            (d[1] + d[4]) / cases,
            d[1] / cases,
            (d[1] + d[2] + d[4] + d[5]) / cases,
        ]));
    }
    or
}

/// OR to DBM, the inverse of [`dbm_to_or`].
pub fn or_to_dbm(or: &Array2<f64>, size: &ExperimentSize) -> Array2<f64> {
    let cases = size.cases() as f64;
    let mut dbm = Array2::<f64>::zeros((4, 6));
    for (i, o) in or.rows().into_iter().enumerate() {
        dbm.row_mut(i).assign(&Array1::from(vec![
            o[0],
            o[4] * cases,
            (o[2] - o[4]) * cases,
            o[1],
            (o[3] - o[4]) * cases,
            (o[5] - o[2] - o[3] + o[4]) * cases,
        ]));
    }
    dbm
}

pub fn or_coefficients(size: &ExperimentSize) -> Array2<f64> {
    let nr = size.readers as f64;
    let single = [1.0 / nr, 0.0, 0.0, (nr - 1.0) / nr, 0.0, 1.0 / nr];
    from_rows(&[
        single,
        single,
        [0.0; 6],
        [
            0.0,
            2.0 / nr,
            -2.0 / nr,
            2.0 * (nr - 1.0) / nr,
            -2.0 * (nr - 1.0) / nr,
            2.0 / nr,
        ],
    ])
}

/// Error and covariance terms of the OR model from one slot's moments:
/// `(error, cov2)` for a single-modality slot, `(cov1, cov3)` for the AB slot.
fn or_terms(moments: ArrayView1<f64>, size: &ExperimentSize) -> (f64, f64) {
    let (_, n0, n1) = size.as_f64();
    let c = [
        1.0 / (n0 * n1),
        (n0 - 1.0) / (n0 * n1),
        (n1 - 1.0) / (n0 * n1),
        (n0 - 1.0) * (n1 - 1.0) / (n0 * n1) - 1.0,
    ];
    let within: f64 = (0..4).map(|k| c[k] * moments[k]).sum();
    let across: f64 = (0..4).map(|k| c[k] * moments[k + 4]).sum();
    (within, across)
}

/// OR rows from reader mean squares and the BDG moments (Hillis 2014, Table 1).
fn apply_hillis_rows(
    or: &mut Array2<f64>,
    bdg: &Array2<f64>,
    slots: &[Slot],
    ms: &MeanSquares,
    size: &ExperimentSize,
) {
    let has = |slot: Slot| slots.contains(&slot);
    let single_row = |row: TableRow, ms_r: f64| {
        let (error, cov2) = or_terms(bdg.row(row.index()), size);
        Array1::from(vec![ms_r + cov2 - error, 0.0, 0.0, cov2, 0.0, error])
    };

    if has(Slot::AA) {
        or.row_mut(TableRow::ModalityA.index())
            .assign(&single_row(TableRow::ModalityA, ms.ms_r_a));
    }
    if has(Slot::BB) {
        or.row_mut(TableRow::ModalityB.index())
            .assign(&single_row(TableRow::ModalityB, ms.ms_r_b));
    }
    if has(Slot::AA) && has(Slot::BB) && has(Slot::AB) {
        let (error_a, cov2_a) = or_terms(bdg.row(TableRow::ModalityA.index()), size);
        let (error_b, cov2_b) = or_terms(bdg.row(TableRow::ModalityB.index()), size);
        let (cov1, cov3) = or_terms(bdg.row(TableRow::Covariance.index()), size);
        let error = (error_a + error_b) / 2.0;
        let cov2 = (cov2_a + cov2_b) / 2.0;
        or.row_mut(TableRow::Difference.index())
            .assign(&Array1::from(vec![
                (ms.ms_r - ms.ms_tr) / 2.0 - cov1 + cov3,
                ms.ms_tr - error + cov1 + cov2 - cov3,
                cov1,
                cov2,
                cov3,
                error,
            ]));
    }
}

/// DBM components to expected mean squares. The single-modality rows are
/// halved because a single modality contributes one of the two treatments.
pub fn dbm_to_mean_squares(dbm: &Array2<f64>, size: &ExperimentSize) -> Array2<f64> {
    let mut ms = transform_rows(&dbm.view(), &dbm_to_ms(size).view());
    for row in [TableRow::ModalityA, TableRow::ModalityB] {
        ms.row_mut(row.index()).mapv_inplace(|v| v / 2.0);
    }
    ms
}

pub fn ms_coefficients(size: &ExperimentSize) -> Array2<f64> {
    let (nr, n0, n1) = size.as_f64();
    let t = 1.0 / (nr * (n0 + n1));
    let single = [t, t, -t, 0.0, 0.0, 0.0];
    from_rows(&[
        single,
        single,
        [0.0; 6],
        [0.0, 0.0, 0.0, 2.0 * t, 2.0 * t, -2.0 * t],
    ])
}
