use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Number of U-statistic moments per slot.
pub const MOMENT_COUNT: usize = 8;

/// The eight moments M1..M8 of one slot, stored at indices 0..7.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Moments(pub Array1<f64>);

impl Moments {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl Deref for Moments {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Weights that turn a [`Moments`] vector into a variance. The last entry
/// already carries the `- 1` correction.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// Coefficients of a slot with no observed pairs.
    pub fn zeros() -> Self {
        Self(Array1::zeros(MOMENT_COUNT))
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Which quantity an analysis targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analysis {
    ModalityA,
    ModalityB,
    Difference,
}

impl Analysis {
    /// Slots whose moments the analysis needs.
    pub fn slots(self) -> &'static [Slot] {
        match self {
            Analysis::ModalityA => &[Slot::AA],
            Analysis::ModalityB => &[Slot::BB],
            Analysis::Difference => &[Slot::AA, Slot::BB, Slot::AB],
        }
    }

    /// Table row holding the analysed variance (the single modality row for
    /// one-modality analyses).
    pub fn row(self) -> TableRow {
        match self {
            Analysis::ModalityA => TableRow::ModalityA,
            Analysis::ModalityB => TableRow::ModalityB,
            Analysis::Difference => TableRow::Difference,
        }
    }
}

/// Pairing of modalities for one run of the moment estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    AA,
    BB,
    AB,
}

impl Slot {
    pub fn row(self) -> TableRow {
        match self {
            Slot::AA => TableRow::ModalityA,
            Slot::BB => TableRow::ModalityB,
            Slot::AB => TableRow::Covariance,
        }
    }
}

/// Rows of every component table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableRow {
    ModalityA = 0,
    ModalityB = 1,
    Covariance = 2,
    Difference = 3,
}

impl TableRow {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Variance estimator used for inference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    #[default]
    Unbiased,
    /// Plug-in (MLE) estimator, nonnegative by construction.
    Biased,
}

/// Degrees-of-freedom estimators that can be clamped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfMethod {
    Bdg,
    Hillis,
}

impl fmt::Display for DfMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfMethod::Bdg => write!(f, "DF_BDG"),
            DfMethod::Hillis => write!(f, "DF_Hillis"),
        }
    }
}

/// Recoverable analytic conditions attached to a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Warning {
    /// A slot had no reader with a scored normal/disease pair.
    NoObservations { slot: Slot },
    /// Unbiased total variance was negative.
    NegativeVariance { total_variance: f64 },
    /// A DF estimate fell below a floor and was raised to it.
    DfBelowMinimum {
        method: DfMethod,
        computed: f64,
        floor: f64,
    },
    /// A DF estimate was unbounded and was set to the normal-approximation ceiling.
    DfInfinite { method: DfMethod, ceiling: f64 },
    /// DBM, OR, MS and the Hillis path are unavailable.
    NotFullyCrossed,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::NoObservations { slot } => write!(
                f,
                "Slot {slot:?} has no reader with a scored normal and disease case; its AUC is unavailable."
            ),
            Warning::NegativeVariance { total_variance } => write!(
                f,
                "The unbiased total variance is {total_variance}, which is negative. Consider the biased estimator."
            ),
            Warning::DfBelowMinimum {
                method,
                computed,
                floor,
            } => write!(f, "{method} was computed as {computed} and raised to {floor}."),
            Warning::DfInfinite { method, ceiling } => {
                write!(f, "{method} is unbounded and was set to {ceiling}.")
            }
            Warning::NotFullyCrossed => write!(
                f,
                "The study is not fully crossed; DBM, OR, MS and the Hillis degrees of freedom are unavailable."
            ),
        }
    }
}
