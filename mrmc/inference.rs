//! Hypothesis tests, degrees of freedom and power for a reader-averaged AUC.
//!
//! Two denominator degrees of freedom are available:
//!
//! * `DF_BDG`, a Satterthwaite approximation over the normal, disease and
//!   reader mean squares of the biased BCK table, bounded below by the
//!   smallest of their degrees of freedom (Gaylor 1969) and by 2;
//! * `DF_Hillis`, from the reader x modality mean squares of the per-reader
//!   AUCs (Hillis 2008), for fully crossed studies only.
//!
//! A DF of 50 or more is treated as infinite and the normal distribution is
//! used in place of Student's t.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use statrs::function::beta::checked_beta_reg;
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

use crate::components::VarianceComponents;
use crate::types::{Analysis, DfMethod, TableRow, Warning};

/// DF at or above which the normal approximation replaces Student's t.
pub const DF_NORMAL_LIMIT: f64 = 50.0;
/// Smallest DF handed to Student's t.
pub const DF_FLOOR: f64 = 2.0;

const NONCENTRAL_MAX_TERMS: usize = 500;
const NONCENTRAL_TOLERANCE: f64 = 1e-300;

/// BCK columns of the three pooling dimensions: normal, disease, reader.
const BCK_DIMENSIONS: [usize; 3] = [0, 1, 3];

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("The significance level must lie strictly between 0 and 1, but it is {0}.")]
    InvalidAlpha(f64),

    #[error("The effect size must be finite, but it is {0}.")]
    InvalidEffect(f64),

    #[error("Failed to evaluate the {distribution} distribution: {message}")]
    Distribution {
        distribution: &'static str,
        message: String,
    },
}

fn distribution_error(distribution: &'static str, err: impl std::fmt::Display) -> InferenceError {
    InferenceError::Distribution {
        distribution,
        message: err.to_string(),
    }
}

pub fn check_alpha(alpha: f64) -> Result<(), InferenceError> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(InferenceError::InvalidAlpha(alpha))
    }
}

fn standard_normal() -> Result<Normal, InferenceError> {
    Normal::new(0.0, 1.0).map_err(|e| distribution_error("normal", e))
}

fn student(df: f64) -> Result<StudentsT, InferenceError> {
    StudentsT::new(0.0, 1.0, df).map_err(|e| distribution_error("Student t", e))
}

/// A degrees-of-freedom estimate and the clamps applied to reach it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DfEstimate {
    pub value: f64,
    pub warnings: Vec<Warning>,
}

impl DfEstimate {
    /// Applies the lower bounds in order, then maps an unbounded value to the
    /// normal-approximation limit.
    fn bounded(method: DfMethod, computed: f64, floors: &[f64]) -> Self {
        let mut value = computed;
        let mut warnings = Vec::new();
        for &floor in floors {
            // Written so that NaN also falls to the floor.
            if !(value >= floor) {
                warnings.push(Warning::DfBelowMinimum {
                    method,
                    computed: value,
                    floor,
                });
                value = floor;
            }
        }
        if value.is_infinite() {
            warnings.push(Warning::DfInfinite {
                method,
                ceiling: DF_NORMAL_LIMIT,
            });
            value = DF_NORMAL_LIMIT;
        }
        Self { value, warnings }
    }
}

/// One mean square and its degrees of freedom in a Satterthwaite sum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SatterthwaiteTerm {
    pub mean_square: f64,
    pub df: f64,
}

/// `total² / Σ (MS_k / df_k)² / df_k`. Terms without positive finite df are
/// skipped; an empty denominator gives infinity.
pub fn satterthwaite(total_variance: f64, terms: &[SatterthwaiteTerm]) -> f64 {
    let denominator: f64 = terms
        .iter()
        .filter(|t| t.df > 0.0 && t.df.is_finite())
        .map(|t| (t.mean_square / t.df).powi(2) / t.df)
        .sum();
    total_variance.powi(2) / denominator
}

/// `round(1 / coefficient - 1)`: the count behind a BCK coefficient, minus one.
fn bck_df(coefficient: f64) -> f64 {
    (1.0 / coefficient - 1.0).round()
}

/// DF_BDG from the biased BCK table.
pub fn df_bdg(
    components: &VarianceComponents,
    analysis: Analysis,
    total_variance: f64,
) -> DfEstimate {
    let coeff = &components.bck.coefficients;
    let biased = &components.bck.biased;
    let a = TableRow::ModalityA.index();
    let b = TableRow::ModalityB.index();
    let c = TableRow::Covariance.index();

    let mut terms = Vec::with_capacity(6);
    let mut df_min = f64::INFINITY;
    match analysis {
        Analysis::ModalityA | Analysis::ModalityB => {
            let row = analysis.row().index();
            for k in BCK_DIMENSIONS {
                let df = bck_df(coeff[[row, k]]);
                df_min = df_min.min(df);
                terms.push(SatterthwaiteTerm {
                    mean_square: biased[[row, k]],
                    df,
                });
            }
        }
        Analysis::Difference => {
            for k in BCK_DIMENSIONS {
                let df_a = bck_df(coeff[[a, k]]);
                let df_b = bck_df(coeff[[b, k]]);
                let df = df_a.min(df_b);
                df_min = df_min.min(df);
                if coeff[[c, k]] > 0.0 {
                    // Paired across modalities: one pooled mean square.
                    terms.push(SatterthwaiteTerm {
                        mean_square: biased[[a, k]] + biased[[b, k]] - 2.0 * biased[[c, k]],
                        df,
                    });
                } else {
                    terms.push(SatterthwaiteTerm {
                        mean_square: biased[[a, k]],
                        df: df_a,
                    });
                    terms.push(SatterthwaiteTerm {
                        mean_square: biased[[b, k]],
                        df: df_b,
                    });
                }
            }
        }
    }

    let computed = satterthwaite(total_variance, &terms);
    let floors: Vec<f64> = [df_min, DF_FLOOR]
        .into_iter()
        .filter(|f| f.is_finite())
        .collect();
    DfEstimate::bounded(DfMethod::Bdg, computed, &floors)
}

/// DF_Hillis, or `None` when the Hillis path is unavailable.
///
/// A single reader or a vanishing mean square makes the estimate unbounded.
pub fn df_hillis(components: &VarianceComponents, analysis: Analysis) -> Option<DfEstimate> {
    if !components.hillis_available() {
        return None;
    }
    let or = &components.or.as_ref()?.components;
    let ms = components.mean_squares.as_ref()?;
    let nr = components.size.readers as f64;

    let (mean_square, denominator) = match analysis {
        Analysis::Difference => {
            let d = TableRow::Difference.index();
            let spread = (nr * (or[[d, 3]] - or[[d, 4]])).max(0.0);
            (ms.ms_tr, ms.ms_tr + spread)
        }
        Analysis::ModalityA | Analysis::ModalityB => {
            let row = analysis.row().index();
            let ms_r = if analysis == Analysis::ModalityA {
                ms.ms_r_a
            } else {
                ms.ms_r_b
            };
            (ms_r, ms_r + (nr * or[[row, 3]]).max(0.0))
        }
    };

    let computed = if nr < 2.0 || mean_square == 0.0 || !mean_square.is_finite() {
        f64::INFINITY
    } else {
        (nr - 1.0) * denominator.powi(2) / mean_square.powi(2)
    };
    Some(DfEstimate::bounded(DfMethod::Hillis, computed, &[DF_FLOOR]))
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Two-sided test under one reference distribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub p_value: f64,
    pub cutoff: f64,
    pub interval: ConfidenceInterval,
    pub reject: bool,
}

/// Test of `effect = 0` where the effect is AUC - 0.5 or AUC_A - AUC_B.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HypothesisTest {
    pub effect: f64,
    pub total_variance: f64,
    pub t_statistic: f64,
    pub alpha: f64,
    pub normal: TestOutcome,
    pub df_bdg: f64,
    pub bdg: TestOutcome,
    pub df_hillis: Option<f64>,
    pub hillis: Option<TestOutcome>,
    pub warnings: Vec<Warning>,
}

impl HypothesisTest {
    /// Normal, BDG and Hillis rejections, in that order.
    pub fn reject_flags(&self) -> (bool, bool, Option<bool>) {
        (
            self.normal.reject,
            self.bdg.reject,
            self.hillis.map(|h| h.reject),
        )
    }
}

/// `|effect| / sqrt(total variance)`. A zero variance makes any nonzero
/// effect unbounded; a negative variance gives NaN.
pub fn t_statistic(effect: f64, total_variance: f64) -> f64 {
    if total_variance >= 0.0 {
        effect.abs() / total_variance.sqrt()
    } else {
        f64::NAN
    }
}

/// Distribution function at `t`; an unbounded statistic sits at 1.
fn cdf_at(t: f64, cdf: impl Fn(f64) -> f64) -> f64 {
    if t.is_nan() {
        f64::NAN
    } else if t == f64::INFINITY {
        1.0
    } else {
        cdf(t)
    }
}

fn outcome(
    effect: f64,
    total_variance: f64,
    t: f64,
    df: Option<f64>,
    alpha: f64,
) -> Result<TestOutcome, InferenceError> {
    let (cdf_t, cutoff) = match df {
        Some(df) if df < DF_NORMAL_LIMIT => {
            let dist = student(df)?;
            (
                cdf_at(t, |x| dist.cdf(x)),
                dist.inverse_cdf(1.0 - alpha / 2.0),
            )
        }
        _ => {
            let dist = standard_normal()?;
            (
                cdf_at(t, |x| dist.cdf(x)),
                dist.inverse_cdf(1.0 - alpha / 2.0),
            )
        }
    };
    let p_value = 2.0 * (1.0 - cdf_t);
    let half_width = total_variance.sqrt() * cutoff;
    Ok(TestOutcome {
        p_value,
        cutoff,
        interval: ConfidenceInterval {
            lower: effect - half_width,
            upper: effect + half_width,
        },
        reject: p_value < alpha,
    })
}

/// Normal, BDG and (when available) Hillis tests of one effect.
pub fn test_hypothesis(
    effect: f64,
    total_variance: f64,
    components: &VarianceComponents,
    analysis: Analysis,
    alpha: f64,
) -> Result<HypothesisTest, InferenceError> {
    check_alpha(alpha)?;
    let t = t_statistic(effect, total_variance);

    let bdg_df = df_bdg(components, analysis, total_variance);
    let hillis_df = df_hillis(components, analysis);

    let normal = outcome(effect, total_variance, t, None, alpha)?;
    let bdg = outcome(effect, total_variance, t, Some(bdg_df.value), alpha)?;
    let hillis = hillis_df
        .as_ref()
        .map(|df| outcome(effect, total_variance, t, Some(df.value), alpha))
        .transpose()?;

    let mut warnings = bdg_df.warnings;
    if let Some(df) = &hillis_df {
        warnings.extend(df.warnings.iter().cloned());
    }

    Ok(HypothesisTest {
        effect,
        total_variance,
        t_statistic: t,
        alpha,
        normal,
        df_bdg: bdg_df.value,
        bdg,
        df_hillis: hillis_df.map(|df| df.value),
        hillis,
        warnings,
    })
}

/// Noncentral F distribution function as a Poisson mixture of regularized
/// incomplete beta functions.
///
/// Summation stops after [`NONCENTRAL_MAX_TERMS`] terms, or once the Poisson
/// weights are past their mode and a term drops below `1e-300`.
pub fn noncentral_f_cdf(df1: f64, df2: f64, lambda: f64, x: f64) -> Result<f64, InferenceError> {
    if x <= 0.0 {
        return Ok(0.0);
    }
    if x.is_infinite() {
        return Ok(1.0);
    }
    if lambda.is_infinite() {
        return Ok(0.0);
    }
    let y = df1 * x / (df2 + df1 * x);
    let half_lambda = lambda / 2.0;
    let mut cdf = 0.0;
    for j in 0..NONCENTRAL_MAX_TERMS {
        let jf = j as f64;
        let log_weight = if half_lambda > 0.0 {
            -half_lambda + jf * half_lambda.ln() - ln_gamma(jf + 1.0)
        } else if j == 0 {
            0.0
        } else {
            f64::NEG_INFINITY
        };
        let beta = checked_beta_reg(df1 / 2.0 + jf, df2 / 2.0, y)
            .map_err(|e| distribution_error("beta", e))?;
        let term = log_weight.exp() * beta;
        cdf += term;
        if jf > half_lambda && term.abs() < NONCENTRAL_TOLERANCE {
            break;
        }
    }
    Ok(cdf.clamp(0.0, 1.0))
}

/// Power of one sizing method.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerOutcome {
    /// `None` for the normal approximation.
    pub df: Option<f64>,
    pub lambda: f64,
    pub cutoff: f64,
    pub power: f64,
}

/// `1 - Φ(cutoff - t)` with `cutoff = Φ⁻¹(1 - α/2)`.
pub fn power_normal(t: f64, alpha: f64) -> Result<PowerOutcome, InferenceError> {
    check_alpha(alpha)?;
    let dist = standard_normal()?;
    let cutoff = dist.inverse_cdf(1.0 - alpha / 2.0);
    Ok(PowerOutcome {
        df: None,
        lambda: t * t,
        cutoff,
        power: 1.0 - dist.cdf(cutoff - t),
    })
}

/// Power of the two-sided t test written as an F(1, df) test with
/// noncentrality `lambda`.
pub fn power_f(df: f64, lambda: f64, alpha: f64) -> Result<PowerOutcome, InferenceError> {
    check_alpha(alpha)?;
    if df >= DF_NORMAL_LIMIT {
        let normal = power_normal(lambda.sqrt(), alpha)?;
        return Ok(PowerOutcome {
            df: Some(df),
            ..normal
        });
    }
    // The F(1, df) quantile at 1 - α is the squared t quantile at 1 - α/2.
    let t_cutoff = student(df)?.inverse_cdf(1.0 - alpha / 2.0);
    let cutoff = t_cutoff * t_cutoff;
    let power = 1.0 - noncentral_f_cdf(1.0, df, lambda, cutoff)?;
    Ok(PowerOutcome {
        df: Some(df),
        lambda,
        cutoff,
        power,
    })
}

/// Hillis parameters for a study of `readers` readers whose case count is
/// the pilot's divided by `resize_factor` (Hillis 2011, Eq. 10).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HillisSizing {
    pub variance: f64,
    pub lambda: f64,
    pub df: DfEstimate,
}

/// `resize_factor` is pilot cases over planned cases.
pub fn hillis_sizing(
    pilot: &VarianceComponents,
    analysis: Analysis,
    readers: usize,
    resize_factor: f64,
    effect_size: f64,
) -> Option<HillisSizing> {
    if !pilot.hillis_available() {
        return None;
    }
    let or = &pilot.or.as_ref()?.components;
    let ms = pilot.mean_squares.as_ref()?;
    let nr = readers as f64;

    let (variance, reduced) = match analysis {
        Analysis::Difference => {
            let d = TableRow::Difference.index();
            let spread = (or[[d, 3]] - or[[d, 4]]).max(0.0);
            let var_tr = ms.ms_tr - or[[d, 5]] + or[[d, 2]] + spread;
            let inflated = or[[d, 5]] - or[[d, 2]] + (nr - 1.0) * spread;
            let deflated = or[[d, 5]] - or[[d, 2]] - spread;
            (
                2.0 / nr * (var_tr + resize_factor * inflated),
                (var_tr + resize_factor * deflated) * 2.0 / nr,
            )
        }
        Analysis::ModalityA | Analysis::ModalityB => {
            let x = analysis.row().index();
            let ms_r = if analysis == Analysis::ModalityA {
                ms.ms_r_a
            } else {
                ms.ms_r_b
            };
            let var_r = ms_r - or[[x, 5]] + or[[x, 3]];
            let inflated = or[[x, 5]] + (nr - 1.0) * or[[x, 3]];
            let deflated = or[[x, 5]] - or[[x, 3]];
            (
                (var_r + resize_factor * inflated) / nr,
                (var_r + resize_factor * deflated) / nr,
            )
        }
    };

    let computed = if nr < 2.0 || reduced == 0.0 || !reduced.is_finite() {
        f64::INFINITY
    } else {
        (nr - 1.0) * variance.powi(2) / reduced.powi(2)
    };
    Some(HillisSizing {
        variance,
        lambda: effect_size * effect_size / variance,
        df: DfEstimate::bounded(DfMethod::Hillis, computed, &[DF_FLOOR]),
    })
}

/// Normal, BDG and Hillis power for one effect size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerAnalysis {
    pub effect_size: f64,
    pub total_variance: f64,
    pub alpha: f64,
    pub normal: PowerOutcome,
    pub bdg: PowerOutcome,
    pub hillis: Option<PowerOutcome>,
    pub warnings: Vec<Warning>,
}

/// Power of a study described by `components`; the BDG noncentrality is
/// `effect² / total variance`. Hillis parameters come from [`hillis_sizing`].
pub fn size_trial(
    effect_size: f64,
    components: &VarianceComponents,
    total_variance: f64,
    analysis: Analysis,
    hillis: Option<&HillisSizing>,
    alpha: f64,
) -> Result<PowerAnalysis, InferenceError> {
    check_alpha(alpha)?;
    if !effect_size.is_finite() {
        return Err(InferenceError::InvalidEffect(effect_size));
    }
    let t = t_statistic(effect_size, total_variance);
    let lambda = t * t;
    let bdg_df = df_bdg(components, analysis, total_variance);

    let normal = power_normal(t, alpha)?;
    let bdg = power_f(bdg_df.value, lambda, alpha)?;
    let mut warnings = bdg_df.warnings;
    let hillis = match hillis {
        Some(h) => {
            warnings.extend(h.df.warnings.iter().cloned());
            Some(power_f(h.df.value, h.lambda, alpha)?)
        }
        None => None,
    };

    Ok(PowerAnalysis {
        effect_size,
        total_variance,
        alpha,
        normal,
        bdg,
        hillis,
        warnings,
    })
}
