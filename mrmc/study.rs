//! Study identifiers, score lookups and the per-slot score/design tensors.
//!
//! Scores are addressed by `(reader, case, modality)`. A study is turned into
//! tensors once per analysis: for a slot pairing modalities `(first, second)`,
//!
//! * `t0[[i, r, k]]` is reader `r`'s score of normal case `i` under the
//!   slot's `k`-th modality, and `d0[[i, r, k]]` is 1 when that score exists;
//! * `t1`/`d1` hold the same for disease cases.
//!
//! Absent scores carry presence 0 and never enter a kernel.

use ahash::AHashMap;
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

use crate::types::Slot;

#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Invalid design dimensions: {0}")]
    InvalidDesignDimensions(String),

    #[error("Modality '{0}' does not appear in the study.")]
    UnknownModality(String),

    #[error("Case '{0}' has scores but no truth state.")]
    MissingTruth(String),

    #[error("Case '{case}' is listed as {listed:?} but its truth state is {actual:?}.")]
    TruthMismatch {
        case: String,
        listed: Truth,
        actual: Truth,
    },

    #[error("Presence indicators must be 0 or 1, but {tensor} contains {value}.")]
    InvalidPresence { tensor: &'static str, value: f64 },
}

/// Reader and case counts of a study.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentSize {
    pub readers: usize,
    pub normals: usize,
    pub diseases: usize,
}

impl ExperimentSize {
    pub fn new(readers: usize, normals: usize, diseases: usize) -> Result<Self, StudyError> {
        let size = Self {
            readers,
            normals,
            diseases,
        };
        size.validate()?;
        Ok(size)
    }

    pub fn validate(&self) -> Result<(), StudyError> {
        if self.readers == 0 || self.normals == 0 || self.diseases == 0 {
            return Err(StudyError::InvalidDesignDimensions(format!(
                "a study needs at least one reader, one normal and one disease case, got {} readers, {} normals and {} diseases",
                self.readers, self.normals, self.diseases
            )));
        }
        Ok(())
    }

    /// `(readers, normals, diseases)` as floating point.
    #[inline]
    pub fn as_f64(&self) -> (f64, f64, f64) {
        (
            self.readers as f64,
            self.normals as f64,
            self.diseases as f64,
        )
    }

    #[inline]
    pub fn cases(&self) -> usize {
        self.normals + self.diseases
    }
}

/// Ground truth of a case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Truth {
    Normal,
    Disease,
}

/// Source of raw scores and truth, supplied by whatever loaded the study.
pub trait ScoreLookup {
    fn score(&self, reader: &str, case: &str, modality: &str) -> Option<f64>;

    fn truth(&self, case: &str) -> Option<Truth>;
}

/// Ordered identifier sets that fix tensor indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyIds {
    pub readers: Vec<String>,
    pub normals: Vec<String>,
    pub diseases: Vec<String>,
    pub modalities: Vec<String>,
}

impl StudyIds {
    pub fn size(&self) -> Result<ExperimentSize, StudyError> {
        ExperimentSize::new(self.readers.len(), self.normals.len(), self.diseases.len())
    }

    pub fn has_modality(&self, modality: &str) -> bool {
        self.modalities.iter().any(|m| m == modality)
    }
}

/// In-memory score store keyed reader -> case -> modality.
#[derive(Clone, Debug, Default)]
pub struct ScoreTable {
    scores: AHashMap<String, AHashMap<String, AHashMap<String, f64>>>,
    truth: AHashMap<String, Truth>,
}

impl ScoreTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_truth(&mut self, case: impl Into<String>, truth: Truth) {
        self.truth.insert(case.into(), truth);
    }

    /// Stores a score, replacing any earlier score for the same triple.
    pub fn insert_score(
        &mut self,
        reader: impl Into<String>,
        case: impl Into<String>,
        modality: impl Into<String>,
        score: f64,
    ) {
        self.scores
            .entry(reader.into())
            .or_default()
            .entry(case.into())
            .or_default()
            .insert(modality.into(), score);
    }

    /// Number of stored scores.
    pub fn len(&self) -> usize {
        self.scores
            .values()
            .flat_map(|cases| cases.values())
            .map(|modalities| modalities.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifier sets in natural order ("r2" before "r10"). Every scored
    /// case must have a truth state; cases with truth but no scores are kept.
    pub fn study_ids(&self) -> Result<StudyIds, StudyError> {
        let mut readers: Vec<String> = self.scores.keys().cloned().collect();
        let mut modalities: Vec<String> = Vec::new();
        for cases in self.scores.values() {
            for (case, scored) in cases {
                if !self.truth.contains_key(case) {
                    return Err(StudyError::MissingTruth(case.clone()));
                }
                for modality in scored.keys() {
                    if !modalities.contains(modality) {
                        modalities.push(modality.clone());
                    }
                }
            }
        }

        let mut normals = Vec::new();
        let mut diseases = Vec::new();
        for (case, truth) in &self.truth {
            match truth {
                Truth::Normal => normals.push(case.clone()),
                Truth::Disease => diseases.push(case.clone()),
            }
        }

        for ids in [&mut readers, &mut normals, &mut diseases, &mut modalities] {
            ids.sort_by(|a, b| natural_order(a, b));
        }

        Ok(StudyIds {
            readers,
            normals,
            diseases,
            modalities,
        })
    }
}

impl ScoreLookup for ScoreTable {
    fn score(&self, reader: &str, case: &str, modality: &str) -> Option<f64> {
        self.scores.get(reader)?.get(case)?.get(modality).copied()
    }

    fn truth(&self, case: &str) -> Option<Truth> {
        self.truth.get(case).copied()
    }
}

fn natural_order(a: &str, b: &str) -> Ordering {
    natord::compare(a, b)
}

/// Scores and presence indicators for one slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreTensors {
    t0: Array3<f64>,
    t1: Array3<f64>,
    d0: Array3<f64>,
    d1: Array3<f64>,
}

impl ScoreTensors {
    /// Validates every tensor against `size`: normals x readers x 2 for the
    /// `0` tensors, diseases x readers x 2 for the `1` tensors, presence in {0, 1}.
    pub fn new(
        size: &ExperimentSize,
        t0: Array3<f64>,
        t1: Array3<f64>,
        d0: Array3<f64>,
        d1: Array3<f64>,
    ) -> Result<Self, StudyError> {
        size.validate()?;
        let normal_shape = (size.normals, size.readers, 2);
        let disease_shape = (size.diseases, size.readers, 2);
        for (name, tensor, expected) in [
            ("t0", &t0, normal_shape),
            ("d0", &d0, normal_shape),
            ("t1", &t1, disease_shape),
            ("d1", &d1, disease_shape),
        ] {
            if tensor.dim() != expected {
                return Err(StudyError::InvalidDesignDimensions(format!(
                    "{name} has shape {:?} but the experiment size requires {expected:?}",
                    tensor.dim()
                )));
            }
        }
        for (name, tensor) in [("d0", &d0), ("d1", &d1)] {
            if let Some(&value) = tensor.iter().find(|&&v| v != 0.0 && v != 1.0) {
                return Err(StudyError::InvalidPresence {
                    tensor: name,
                    value,
                });
            }
        }
        Ok(Self { t0, t1, d0, d1 })
    }

    /// Tensors with zero scores, for computations that only need the design.
    pub fn design_only(
        size: &ExperimentSize,
        d0: Array3<f64>,
        d1: Array3<f64>,
    ) -> Result<Self, StudyError> {
        let t0 = Array3::zeros(d0.dim());
        let t1 = Array3::zeros(d1.dim());
        Self::new(size, t0, t1, d0, d1)
    }

    pub fn size(&self) -> ExperimentSize {
        let (normals, readers, _) = self.t0.dim();
        ExperimentSize {
            readers,
            normals,
            diseases: self.t1.dim().0,
        }
    }

    pub fn t0(&self) -> ArrayView3<'_, f64> {
        self.t0.view()
    }

    pub fn t1(&self) -> ArrayView3<'_, f64> {
        self.t1.view()
    }

    pub fn d0(&self) -> ArrayView3<'_, f64> {
        self.d0.view()
    }

    pub fn d1(&self) -> ArrayView3<'_, f64> {
        self.d1.view()
    }

    /// Every reader scored every case under both of the slot's modalities.
    pub fn is_fully_crossed(&self) -> bool {
        self.d0.iter().chain(self.d1.iter()).all(|&p| p == 1.0)
    }
}

/// Builds one slot's tensors from a lookup. `AA` reads `modality_a` twice,
/// `BB` reads `modality_b` twice and `AB` reads the pair.
pub fn build_slot_tensors<L: ScoreLookup + ?Sized>(
    ids: &StudyIds,
    lookup: &L,
    slot: Slot,
    modality_a: &str,
    modality_b: &str,
) -> Result<ScoreTensors, StudyError> {
    let size = ids.size()?;
    let pair = match slot {
        Slot::AA => [modality_a, modality_a],
        Slot::BB => [modality_b, modality_b],
        Slot::AB => [modality_a, modality_b],
    };
    for modality in pair {
        if !ids.has_modality(modality) {
            return Err(StudyError::UnknownModality(modality.to_string()));
        }
    }
    check_truth(lookup, &ids.normals, Truth::Normal)?;
    check_truth(lookup, &ids.diseases, Truth::Disease)?;

    let (t0, d0) = fill_group(lookup, &ids.readers, &ids.normals, pair);
    let (t1, d1) = fill_group(lookup, &ids.readers, &ids.diseases, pair);
    ScoreTensors::new(&size, t0, t1, d0, d1)
}

fn check_truth<L: ScoreLookup + ?Sized>(
    lookup: &L,
    cases: &[String],
    listed: Truth,
) -> Result<(), StudyError> {
    for case in cases {
        match lookup.truth(case) {
            Some(actual) if actual == listed => {}
            Some(actual) => {
                return Err(StudyError::TruthMismatch {
                    case: case.clone(),
                    listed,
                    actual,
                });
            }
            None => return Err(StudyError::MissingTruth(case.clone())),
        }
    }
    Ok(())
}

fn fill_group<L: ScoreLookup + ?Sized>(
    lookup: &L,
    readers: &[String],
    cases: &[String],
    pair: [&str; 2],
) -> (Array3<f64>, Array3<f64>) {
    let shape = (cases.len(), readers.len(), 2);
    let mut scores = Array3::<f64>::zeros(shape);
    let mut presence = Array3::<f64>::zeros(shape);
    for (i, case) in cases.iter().enumerate() {
        for (r, reader) in readers.iter().enumerate() {
            for (k, modality) in pair.iter().enumerate() {
                if let Some(score) = lookup.score(reader, case, modality) {
                    scores[[i, r, k]] = score;
                    presence[[i, r, k]] = 1.0;
                }
            }
        }
    }
    (scores, presence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> ScoreTable {
        let mut table = ScoreTable::new();
        table.insert_truth("n1", Truth::Normal);
        table.insert_truth("d1", Truth::Disease);
        for reader in ["reader10", "reader2"] {
            table.insert_score(reader, "n1", "ct", 0.2);
            table.insert_score(reader, "d1", "ct", 0.7);
        }
        table.insert_score("reader2", "d1", "mri", 0.9);
        table
    }

    #[test]
    fn test_experiment_size_rejects_zero() {
        assert!(matches!(
            ExperimentSize::new(0, 3, 3),
            Err(StudyError::InvalidDesignDimensions(_))
        ));
        assert_eq!(ExperimentSize::new(2, 3, 4).unwrap().cases(), 7);
    }

    #[test]
    fn test_study_ids_are_naturally_ordered() {
        let ids = small_table().study_ids().unwrap();
        assert_eq!(ids.readers, vec!["reader2", "reader10"]);
        assert_eq!(ids.modalities, vec!["ct", "mri"]);
        assert_eq!(ids.normals, vec!["n1"]);
    }

    #[test]
    fn test_missing_truth_is_reported() {
        let mut table = small_table();
        table.insert_score("reader2", "mystery", "ct", 0.5);
        assert!(matches!(
            table.study_ids(),
            Err(StudyError::MissingTruth(case)) if case == "mystery"
        ));
    }

    #[test]
    fn test_build_marks_missing_scores_absent() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let ab = build_slot_tensors(&ids, &table, Slot::AB, "ct", "mri").unwrap();
        assert!(!ab.is_fully_crossed());
        // reader2 (index 0) scored d1 under mri; reader10 did not.
        assert_eq!(ab.d1()[[0, 0, 1]], 1.0);
        assert_eq!(ab.d1()[[0, 1, 1]], 0.0);
        assert_eq!(ab.t1()[[0, 0, 1]], 0.9);

        let aa = build_slot_tensors(&ids, &table, Slot::AA, "ct", "mri").unwrap();
        assert!(aa.is_fully_crossed());
    }

    #[test]
    fn test_unknown_modality() {
        let table = small_table();
        let ids = table.study_ids().unwrap();
        let err = build_slot_tensors(&ids, &table, Slot::BB, "ct", "pet").unwrap_err();
        assert!(matches!(err, StudyError::UnknownModality(m) if m == "pet"));
    }

    #[test]
    fn test_tensor_shape_must_match_size() {
        let size = ExperimentSize::new(2, 2, 2).unwrap();
        let good = Array3::<f64>::ones((2, 2, 2));
        let bad = Array3::<f64>::ones((3, 2, 2));
        let result = ScoreTensors::new(&size, bad, good.clone(), good.clone(), good);
        assert!(matches!(
            result,
            Err(StudyError::InvalidDesignDimensions(_))
        ));
    }

    #[test]
    fn test_presence_must_be_binary() {
        let size = ExperimentSize::new(1, 1, 1).unwrap();
        let ones = Array3::<f64>::ones((1, 1, 2));
        let mut bad = ones.clone();
        bad[[0, 0, 1]] = 0.5;
        let result = ScoreTensors::design_only(&size, ones, bad);
        assert!(matches!(
            result,
            Err(StudyError::InvalidPresence { tensor: "d1", .. })
        ));
    }
}
