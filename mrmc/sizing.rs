//! Sizing a new trial from a pilot analysis.
//!
//! The pilot's BDG moments are kept and combined with the coefficients of
//! the planned design, so the planned total variance follows from the pilot
//! without new scores. Hillis sizing rescales the pilot's OR components to
//! the planned reader and case counts.

use std::sync::atomic::AtomicBool;

use itertools::iproduct;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::AnalysisResult;
use crate::components::{
    self, ComponentError, MomentTable, SlotMoments, VarianceComponents, bdg_coefficients,
};
use crate::config::{ConfigError, SizingConfig};
use crate::covariance::{self, CovarianceError};
use crate::design::DesignError;
use crate::inference::{self, HillisSizing, InferenceError, PowerAnalysis};
use crate::study::ExperimentSize;
use crate::types::{Coefficients, Moments, Slot, Warning};

#[derive(Error, Debug)]
pub enum SizingError {
    #[error("Invalid sizing settings: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to lay out the planned study: {0}")]
    Design(#[from] DesignError),
    #[error("Failed to compute design coefficients: {0}")]
    Covariance(#[from] CovarianceError),
    #[error("Failed to assemble planned variance components: {0}")]
    Components(#[from] ComponentError),
    #[error("Power computation failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("A case grid needs at least two cases per point, but {0} was requested.")]
    TooFewCases(usize),
}

/// Power of one planned study.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    pub config: SizingConfig,
    pub size: ExperimentSize,
    pub fully_crossed: bool,
    pub total_variance: f64,
    pub components: VarianceComponents,
    pub hillis: Option<HillisSizing>,
    pub power: PowerAnalysis,
    pub warnings: Vec<Warning>,
}

/// Sizes the trial described by `config` from `pilot`. `cancel` is polled by
/// the design coefficient loop of irregular designs.
pub fn size_trial(
    pilot: &AnalysisResult,
    config: &SizingConfig,
    cancel: Option<&AtomicBool>,
) -> Result<SizingResult, SizingError> {
    config.validate()?;
    let design = config.design()?;
    let size = design.size;
    let analysis = pilot.analysis;
    let fully_crossed = design.is_fully_crossed();

    let mut coefficients: Vec<(Slot, Coefficients)> = Vec::with_capacity(3);
    if fully_crossed {
        for &slot in analysis.slots() {
            coefficients.push((slot, bdg_coefficients(&size)));
        }
    } else {
        let designs = design.generate()?;
        for &slot in analysis.slots() {
            coefficients.push((
                slot,
                covariance::design_coefficients(designs.slot(slot), cancel)?,
            ));
        }
    }

    let pilot_moments = pilot_moments(&pilot.components, analysis.slots());
    let moments = pilot_moments.with_coefficients(|slot| {
        coefficients
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, c)| c.clone())
            .unwrap_or_else(Coefficients::zeros)
    });
    let planned = components::assemble(&moments, &size, fully_crossed, None)?;
    let total_variance = planned.total_variance(pilot.estimator);

    let hillis = if fully_crossed {
        let resize_factor = pilot.size.cases() as f64 / size.cases() as f64;
        inference::hillis_sizing(
            &pilot.components,
            analysis,
            size.readers,
            resize_factor,
            config.effect_size,
        )
    } else {
        None
    };

    let power = inference::size_trial(
        config.effect_size,
        &planned,
        total_variance,
        analysis,
        hillis.as_ref(),
        config.alpha,
    )?;

    let mut warnings = power.warnings.clone();
    if !fully_crossed {
        warnings.push(Warning::NotFullyCrossed);
    }
    if planned.negative_variance() {
        warnings.push(Warning::NegativeVariance {
            total_variance: planned.total_var_unbiased,
        });
    }
    log::debug!(
        "Sized {} readers, {} normals, {} diseases: power normal {:.4}, BDG {:.4}, Hillis {:?}.",
        size.readers,
        size.normals,
        size.diseases,
        power.normal.power,
        power.bdg.power,
        power.hillis.map(|h| h.power)
    );

    Ok(SizingResult {
        config: config.clone(),
        size,
        fully_crossed,
        total_variance,
        components: planned,
        hillis,
        power,
        warnings,
    })
}

/// Unbiased and biased BDG rows of the pilot for the given slots.
fn pilot_moments(pilot: &VarianceComponents, slots: &[Slot]) -> MomentTable {
    let mut table = MomentTable::default();
    for &slot in slots {
        let row = slot.row().index();
        table.set(
            slot,
            SlotMoments {
                unbiased: Moments::new(pilot.bdg.components.row(row).to_owned()),
                biased: Moments::new(pilot.bdg.biased.row(row).to_owned()),
                coefficients: Coefficients::new(pilot.bdg.coefficients.row(row).to_owned()),
            },
        );
    }
    table
}

/// Splits `cases` into normals and diseases in the pilot's proportion, with
/// at least one of each.
fn split_cases(pilot: &ExperimentSize, cases: usize) -> Result<(usize, usize), SizingError> {
    if cases < 2 {
        return Err(SizingError::TooFewCases(cases));
    }
    let share = pilot.normals as f64 / pilot.cases() as f64;
    let normals = ((cases as f64 * share).round() as usize).clamp(1, cases - 1);
    Ok((normals, cases - normals))
}

/// Sizes every reader count x case count combination, keeping the layout of
/// `config`. Results follow the grid order, readers outermost.
pub fn explore_sizes(
    pilot: &AnalysisResult,
    config: &SizingConfig,
    readers: &[usize],
    cases: &[usize],
) -> Result<Vec<SizingResult>, SizingError> {
    let grid = iproduct!(readers.iter().copied(), cases.iter().copied())
        .map(|(r, c)| {
            let (normals, diseases) = split_cases(&pilot.size, c)?;
            Ok(config.resized(r, normals, diseases))
        })
        .collect::<Result<Vec<SizingConfig>, SizingError>>()?;
    log::info!(
        "Exploring {} planned studies ({} reader counts x {} case counts).",
        grid.len(),
        readers.len(),
        cases.len()
    );
    grid.par_iter()
        .map(|planned| size_trial(pilot, planned, None))
        .collect()
}
