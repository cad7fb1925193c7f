//! One analysis of a reader-averaged AUC, from scores to tests.
//!
//! [`analyze`] reads a study through a [`ScoreLookup`], [`analyze_tensors`]
//! starts from prepared tensors and [`analyze_summary`] from moments that were
//! estimated elsewhere. All three share the assembly and inference tail.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::components::{self, ComponentError, MomentTable, SlotMoments, VarianceComponents};
use crate::config::{AnalysisConfig, ConfigError};
use crate::covariance::{self, AucPair, SlotEstimate};
use crate::inference::{self, HypothesisTest, InferenceError, PowerAnalysis};
use crate::study::{ExperimentSize, ScoreLookup, ScoreTensors, StudyError, StudyIds, build_slot_tensors};
use crate::types::{Analysis, Estimator, Moments, Slot, Warning};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid analysis settings: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to prepare the study: {0}")]
    Study(#[from] StudyError),
    #[error("Failed to assemble variance components: {0}")]
    Components(#[from] ComponentError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("The {0:?} analysis needs a second modality, but none was given.")]
    MissingModality(Analysis),
    #[error("The {analysis:?} analysis needs {slot:?} moments, which were not supplied.")]
    MissingSlot { analysis: Analysis, slot: Slot },
}

/// What to analyse and how.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub modality_a: String,
    pub modality_b: Option<String>,
    pub analysis: Analysis,
    pub config: AnalysisConfig,
}

impl AnalysisRequest {
    /// AUC of one modality against 0.5.
    pub fn single(modality: impl Into<String>, config: AnalysisConfig) -> Self {
        Self {
            modality_a: modality.into(),
            modality_b: None,
            analysis: Analysis::ModalityA,
            config,
        }
    }

    /// AUC of `modality_a` minus AUC of `modality_b`.
    pub fn difference(
        modality_a: impl Into<String>,
        modality_b: impl Into<String>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            modality_a: modality_a.into(),
            modality_b: Some(modality_b.into()),
            analysis: Analysis::Difference,
            config,
        }
    }
}

/// Tensors of the slots an analysis needs.
#[derive(Clone, Debug, Default)]
pub struct StudyTensors {
    pub aa: Option<ScoreTensors>,
    pub bb: Option<ScoreTensors>,
    pub ab: Option<ScoreTensors>,
}

impl StudyTensors {
    pub fn get(&self, slot: Slot) -> Option<&ScoreTensors> {
        match slot {
            Slot::AA => self.aa.as_ref(),
            Slot::BB => self.bb.as_ref(),
            Slot::AB => self.ab.as_ref(),
        }
    }

    fn set(&mut self, slot: Slot, tensors: ScoreTensors) {
        match slot {
            Slot::AA => self.aa = Some(tensors),
            Slot::BB => self.bb = Some(tensors),
            Slot::AB => self.ab = Some(tensors),
        }
    }

    fn present(&self) -> impl Iterator<Item = (Slot, &ScoreTensors)> {
        [Slot::AA, Slot::BB, Slot::AB]
            .into_iter()
            .filter_map(|slot| self.get(slot).map(|t| (slot, t)))
    }
}

/// Builds the tensors of every slot the analysis needs.
pub fn build_study_tensors<L: ScoreLookup + ?Sized>(
    ids: &StudyIds,
    lookup: &L,
    request: &AnalysisRequest,
) -> Result<StudyTensors, AnalysisError> {
    let modality_a = request.modality_a.as_str();
    let modality_b = match (request.analysis, request.modality_b.as_deref()) {
        (Analysis::ModalityA, b) => b.unwrap_or(modality_a),
        (analysis, None) => return Err(AnalysisError::MissingModality(analysis)),
        (_, Some(b)) => b,
    };
    let mut tensors = StudyTensors::default();
    for &slot in request.analysis.slots() {
        tensors.set(
            slot,
            build_slot_tensors(ids, lookup, slot, modality_a, modality_b)?,
        );
    }
    Ok(tensors)
}

/// Reader-averaged AUCs of the analysed modalities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AucSummary {
    pub a: Option<f64>,
    pub b: Option<f64>,
}

impl AucSummary {
    /// AUC - 0.5 for one modality, AUC_A - AUC_B for a difference. NaN when
    /// a needed AUC is unavailable.
    pub fn effect(&self, analysis: Analysis) -> f64 {
        let value = match analysis {
            Analysis::ModalityA => self.a.map(|a| a - 0.5),
            Analysis::ModalityB => self.b.map(|b| b - 0.5),
            Analysis::Difference => self.a.zip(self.b).map(|(a, b)| a - b),
        };
        value.unwrap_or(f64::NAN)
    }
}

/// Everything one analysis produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub size: ExperimentSize,
    pub analysis: Analysis,
    pub estimator: Estimator,
    pub fully_crossed: bool,
    pub auc: AucSummary,
    pub effect: f64,
    /// Per reader: AUC under modality A and under modality B.
    pub reader_aucs: Vec<AucPair>,
    pub components: VarianceComponents,
    /// Total variance of the selected estimator.
    pub total_variance: f64,
    pub test: HypothesisTest,
    pub power: Option<PowerAnalysis>,
    pub warnings: Vec<Warning>,
}

impl AnalysisResult {
    pub fn negative_variance(&self) -> bool {
        self.components.negative_variance()
    }
}

/// Runs the full analysis of a study held behind `lookup`.
pub fn analyze<L: ScoreLookup + ?Sized>(
    ids: &StudyIds,
    lookup: &L,
    request: &AnalysisRequest,
) -> Result<AnalysisResult, AnalysisError> {
    request.config.validate()?;
    log::info!(
        "Analyzing {:?} for modalities {} / {} with {} readers, {} normals and {} diseases.",
        request.analysis,
        request.modality_a,
        request.modality_b.as_deref().unwrap_or("-"),
        ids.readers.len(),
        ids.normals.len(),
        ids.diseases.len()
    );
    let tensors = build_study_tensors(ids, lookup, request)?;
    analyze_tensors(&tensors, request.analysis, &request.config)
}

/// Analysis from prepared slot tensors. The three slots are estimated
/// concurrently.
pub fn analyze_tensors(
    tensors: &StudyTensors,
    analysis: Analysis,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    config.validate()?;
    let (_, first) = tensors
        .present()
        .next()
        .ok_or(ComponentError::NoSlots)?;
    let size = first.size();
    for &slot in analysis.slots() {
        if tensors.get(slot).is_none() {
            return Err(AnalysisError::MissingSlot { analysis, slot });
        }
    }

    let estimate_slot = |slot: Slot| tensors.get(slot).map(covariance::estimate);
    let (aa, (bb, ab)) = rayon::join(
        || estimate_slot(Slot::AA),
        || rayon::join(|| estimate_slot(Slot::BB), || estimate_slot(Slot::AB)),
    );
    let estimates = [(Slot::AA, aa), (Slot::BB, bb), (Slot::AB, ab)];

    let fully_crossed = tensors.present().all(|(_, t)| t.is_fully_crossed());
    let mut warnings = Vec::new();
    let mut moments = MomentTable::default();
    for (slot, estimate) in &estimates {
        if let Some(estimate) = estimate {
            if !estimate.has_observations() {
                warnings.push(Warning::NoObservations { slot: *slot });
            }
            moments.set(*slot, SlotMoments::from(estimate));
        }
    }

    let (auc, reader_aucs, anova_aucs) = match analysis {
        Analysis::Difference => {
            let aa = slot_estimate(&estimates, analysis, Slot::AA)?;
            let bb = slot_estimate(&estimates, analysis, Slot::BB)?;
            let ab = slot_estimate(&estimates, analysis, Slot::AB)?;
            let per_reader = aa
                .reader_aucs
                .iter()
                .zip(&bb.reader_aucs)
                .map(|(a, b)| AucPair { a: a.a, b: b.a })
                .collect();
            (
                AucSummary {
                    a: aa.auc.a,
                    b: bb.auc.a,
                },
                per_reader,
                ab.reader_aucs.clone(),
            )
        }
        Analysis::ModalityA | Analysis::ModalityB => {
            let single = slot_estimate(&estimates, analysis, analysis.slots()[0])?;
            let per_reader: Vec<AucPair> = single
                .reader_aucs
                .iter()
                .map(|p| match analysis {
                    Analysis::ModalityA => AucPair { a: p.a, b: None },
                    _ => AucPair { a: None, b: p.a },
                })
                .collect();
            let auc = match analysis {
                Analysis::ModalityA => AucSummary {
                    a: single.auc.a,
                    b: None,
                },
                _ => AucSummary {
                    a: None,
                    b: single.auc.a,
                },
            };
            (auc, per_reader, single.reader_aucs.clone())
        }
    };

    let components = components::assemble(&moments, &size, fully_crossed, Some(&anova_aucs))?;
    finish(components, analysis, config, auc, reader_aucs, warnings)
}

fn slot_estimate(
    estimates: &[(Slot, Option<SlotEstimate>)],
    analysis: Analysis,
    slot: Slot,
) -> Result<&SlotEstimate, AnalysisError> {
    estimates
        .iter()
        .find(|(s, _)| *s == slot)
        .and_then(|(_, e)| e.as_ref())
        .ok_or(AnalysisError::MissingSlot { analysis, slot })
}

/// Moments estimated elsewhere for a fully crossed study.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryInput {
    pub size: ExperimentSize,
    /// Unbiased BDG moments of the AA, BB and AB slots.
    pub moments_a: Option<Moments>,
    pub moments_b: Option<Moments>,
    pub moments_ab: Option<Moments>,
    pub auc: AucSummary,
    /// Per-reader AUCs under A and B; enables the Hillis path.
    pub reader_aucs: Option<Vec<AucPair>>,
}

impl SummaryInput {
    fn slot(&self, slot: Slot) -> Option<&Moments> {
        match slot {
            Slot::AA => self.moments_a.as_ref(),
            Slot::BB => self.moments_b.as_ref(),
            Slot::AB => self.moments_ab.as_ref(),
        }
    }
}

/// Analysis of summary moments. Biased moments and coefficients follow from
/// the size of the fully crossed study.
pub fn analyze_summary(
    summary: &SummaryInput,
    analysis: Analysis,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    config.validate()?;
    summary.size.validate()?;
    let mut moments = MomentTable::default();
    for &slot in analysis.slots() {
        let unbiased = summary
            .slot(slot)
            .ok_or(AnalysisError::MissingSlot { analysis, slot })?;
        moments.set(
            slot,
            SlotMoments::from_unbiased(unbiased.clone(), &summary.size),
        );
    }

    let anova_aucs = summary.reader_aucs.as_ref().map(|readers| match analysis {
        Analysis::Difference => readers.clone(),
        Analysis::ModalityA => readers.iter().map(|p| AucPair { a: p.a, b: p.a }).collect(),
        Analysis::ModalityB => readers.iter().map(|p| AucPair { a: p.b, b: p.b }).collect(),
    });
    let components =
        components::assemble(&moments, &summary.size, true, anova_aucs.as_deref())?;
    finish(
        components,
        analysis,
        config,
        summary.auc,
        summary.reader_aucs.clone().unwrap_or_default(),
        Vec::new(),
    )
}

fn finish(
    components: VarianceComponents,
    analysis: Analysis,
    config: &AnalysisConfig,
    auc: AucSummary,
    reader_aucs: Vec<AucPair>,
    mut warnings: Vec<Warning>,
) -> Result<AnalysisResult, AnalysisError> {
    if !components.fully_crossed {
        warnings.push(Warning::NotFullyCrossed);
    }
    if components.negative_variance() {
        warnings.push(Warning::NegativeVariance {
            total_variance: components.total_var_unbiased,
        });
    }

    let effect = auc.effect(analysis);
    let total_variance = components.total_variance(config.estimator);
    let test = inference::test_hypothesis(
        effect,
        total_variance,
        &components,
        analysis,
        config.alpha,
    )?;
    warnings.extend(test.warnings.iter().cloned());

    let power = match config.effect_size {
        Some(effect_size) => {
            let hillis = inference::hillis_sizing(
                &components,
                analysis,
                components.size.readers,
                1.0,
                effect_size,
            );
            Some(inference::size_trial(
                effect_size,
                &components,
                total_variance,
                analysis,
                hillis.as_ref(),
                config.alpha,
            )?)
        }
        None => None,
    };

    for warning in &warnings {
        log::warn!("{warning}");
    }
    log::debug!(
        "Total variance {total_variance:.6e} ({:?}), DF_BDG {:.2}, DF_Hillis {:?}, rejections (normal, BDG, Hillis) {:?}.",
        config.estimator,
        test.df_bdg,
        test.df_hillis,
        test.reject_flags()
    );

    Ok(AnalysisResult {
        size: components.size,
        analysis,
        estimator: config.estimator,
        fully_crossed: components.fully_crossed,
        auc,
        effect,
        reader_aucs,
        total_variance,
        test,
        power,
        warnings,
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::{ScoreTable, Truth};
    use crate::types::MOMENT_COUNT;
    use approx::assert_relative_eq;

    fn small_table() -> ScoreTable {
        let mut table = ScoreTable::new();
        for case in ["n1", "n2", "n3"] {
            table.insert_truth(case, Truth::Normal);
        }
        for case in ["d1", "d2", "d3"] {
            table.insert_truth(case, Truth::Disease);
        }
        let scores = [
            ("r1", [1.0, 2.0, 3.0, 2.5, 4.0, 5.0], [1.0, 3.0, 2.0, 3.0, 3.5, 6.0]),
            ("r2", [2.0, 1.0, 4.0, 3.0, 5.0, 4.5], [2.0, 2.0, 3.0, 2.0, 4.0, 5.0]),
            ("r3", [1.5, 2.5, 2.0, 3.5, 3.0, 4.0], [1.0, 1.0, 2.5, 3.0, 2.0, 4.0]),
        ];
        let cases = ["n1", "n2", "n3", "d1", "d2", "d3"];
        for (reader, a, b) in scores {
            for (i, case) in cases.iter().enumerate() {
                table.insert_score(reader, *case, "A", a[i]);
                table.insert_score(reader, *case, "B", b[i]);
            }
        }
        table
    }

    #[test]
    fn test_difference_analysis_is_consistent() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let request = AnalysisRequest::difference("A", "B", AnalysisConfig::default());
        let result = analyze(&ids, &table, &request).unwrap();

        assert!(result.fully_crossed);
        assert_eq!(result.reader_aucs.len(), 3);
        let a = result.auc.a.unwrap();
        let b = result.auc.b.unwrap();
        assert_relative_eq!(result.effect, a - b, epsilon = 1e-12);
        let mean_a: f64 = result.reader_aucs.iter().map(|p| p.a.unwrap()).sum::<f64>() / 3.0;
        assert_relative_eq!(mean_a, a, epsilon = 1e-12);
        assert!(result.test.df_hillis.is_some());
        assert_eq!(result.total_variance, result.components.total_var_unbiased);
    }

    #[test]
    fn test_single_analysis_without_second_modality() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let request = AnalysisRequest::single("B", AnalysisConfig::default());
        let result = analyze(&ids, &table, &request).unwrap();
        assert!(result.auc.b.is_none());
        assert_relative_eq!(result.effect, result.auc.a.unwrap() - 0.5, epsilon = 1e-12);
        assert!(result.components.bdg.row(crate::types::TableRow::ModalityB).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_difference_requires_second_modality() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let request = AnalysisRequest {
            modality_b: None,
            ..AnalysisRequest::difference("A", "B", AnalysisConfig::default())
        };
        assert!(matches!(
            analyze(&ids, &table, &request),
            Err(AnalysisError::MissingModality(Analysis::Difference))
        ));
    }

    #[test]
    fn test_unknown_modality_is_an_error() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let request = AnalysisRequest::difference("A", "C", AnalysisConfig::default());
        assert!(matches!(
            analyze(&ids, &table, &request),
            Err(AnalysisError::Study(StudyError::UnknownModality(_)))
        ));
    }

    #[test]
    fn test_summary_input_reproduces_score_analysis() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let request = AnalysisRequest::difference("A", "B", AnalysisConfig::default());
        let full = analyze(&ids, &table, &request).unwrap();

        let bdg = &full.components.bdg.components;
        let summary = SummaryInput {
            size: full.size,
            moments_a: Some(Moments::new(bdg.row(0).to_owned())),
            moments_b: Some(Moments::new(bdg.row(1).to_owned())),
            moments_ab: Some(Moments::new(bdg.row(2).to_owned())),
            auc: full.auc,
            reader_aucs: Some(full.reader_aucs.clone()),
        };
        let summarized = analyze_summary(&summary, Analysis::Difference, &request.config).unwrap();
        assert_relative_eq!(
            summarized.total_variance,
            full.total_variance,
            max_relative = 1e-10
        );
        assert_relative_eq!(
            summarized.components.total_var_biased,
            full.components.total_var_biased,
            max_relative = 1e-10
        );
        assert_relative_eq!(summarized.test.df_bdg, full.test.df_bdg, max_relative = 1e-8);
    }

    #[test]
    fn test_summary_without_needed_slot() {
        let summary = SummaryInput {
            size: ExperimentSize::new(2, 2, 2).unwrap(),
            moments_a: Some(Moments::new(ndarray::Array1::zeros(MOMENT_COUNT))),
            moments_b: None,
            moments_ab: None,
            auc: AucSummary::default(),
            reader_aucs: None,
        };
        assert!(matches!(
            analyze_summary(&summary, Analysis::Difference, &AnalysisConfig::default()),
            Err(AnalysisError::MissingSlot { slot: Slot::BB, .. })
        ));
    }

    #[test]
    fn test_power_at_observed_size() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let config = AnalysisConfig {
            effect_size: Some(0.1),
            ..AnalysisConfig::default()
        };
        let result = analyze(&ids, &table, &AnalysisRequest::difference("A", "B", config)).unwrap();
        let power = result.power.unwrap();
        assert!(power.normal.power > 0.0 && power.normal.power <= 1.0);
        assert!(power.bdg.power > 0.0 && power.bdg.power <= 1.0);
        assert_eq!(power.bdg.df, Some(result.test.df_bdg));
    }
}
