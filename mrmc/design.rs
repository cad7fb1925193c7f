//! Study designs for sizing a trial that has not been run yet.
//!
//! Readers and cases are split into `split_plots` groups; a reader only reads
//! the cases of its own group. An unpaired dimension uses half of its units
//! for modality A and the other half for modality B.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::study::{ExperimentSize, ScoreTensors, StudyError};
use crate::types::Slot;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("A design needs at least one split plot.")]
    ZeroSplitPlots,

    #[error(
        "Splitting {available} {unit} per modality into {split_plots} split plots leaves an empty group."
    )]
    EmptyGroup {
        unit: &'static str,
        available: usize,
        split_plots: usize,
    },

    #[error("Design tensors are invalid: {0}")]
    Study(#[from] StudyError),
}

/// Layout of a planned study.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SplitPlotDesign {
    pub size: ExperimentSize,
    pub split_plots: usize,
    pub paired_readers: bool,
    pub paired_normals: bool,
    pub paired_diseases: bool,
}

impl SplitPlotDesign {
    /// Fully crossed layout: one split plot, everything paired.
    pub fn fully_crossed(size: ExperimentSize) -> Self {
        Self {
            size,
            split_plots: 1,
            paired_readers: true,
            paired_normals: true,
            paired_diseases: true,
        }
    }

    pub fn is_fully_crossed(&self) -> bool {
        self.split_plots == 1 && self.paired_readers && self.paired_normals && self.paired_diseases
    }

    /// Presence tensors for the three slots.
    pub fn generate(&self) -> Result<SlotDesigns, DesignError> {
        self.size.validate()?;
        if self.split_plots == 0 {
            return Err(DesignError::ZeroSplitPlots);
        }

        let readers = Axis::new("readers", self.size.readers, self.paired_readers, self.split_plots)?;
        let normals = Axis::new("normals", self.size.normals, self.paired_normals, self.split_plots)?;
        let diseases = Axis::new(
            "diseases",
            self.size.diseases,
            self.paired_diseases,
            self.split_plots,
        )?;

        let normal_shape = (self.size.normals, self.size.readers, 2);
        let disease_shape = (self.size.diseases, self.size.readers, 2);
        let mut d0 = [
            Array3::<f64>::zeros(normal_shape),
            Array3::<f64>::zeros(normal_shape),
            Array3::<f64>::zeros(normal_shape),
        ];
        let mut d1 = [
            Array3::<f64>::zeros(disease_shape),
            Array3::<f64>::zeros(disease_shape),
            Array3::<f64>::zeros(disease_shape),
        ];

        for group in 0..self.split_plots {
            for r in 0..readers.per_group {
                let (reader_a, reader_b) = readers.units(group, r);
                for c in 0..normals.per_group {
                    let (case_a, case_b) = normals.units(group, c);
                    mark(&mut d0, case_a, reader_a, case_b, reader_b);
                }
                for c in 0..diseases.per_group {
                    let (case_a, case_b) = diseases.units(group, c);
                    mark(&mut d1, case_a, reader_a, case_b, reader_b);
                }
            }
        }

        let [aa0, bb0, ab0] = d0;
        let [aa1, bb1, ab1] = d1;
        Ok(SlotDesigns {
            aa: ScoreTensors::design_only(&self.size, aa0, aa1)?,
            bb: ScoreTensors::design_only(&self.size, bb0, bb1)?,
            ab: ScoreTensors::design_only(&self.size, ab0, ab1)?,
            fully_crossed: self.is_fully_crossed(),
        })
    }
}

/// Indices of one dimension (readers, normals or diseases) within the layout.
struct Axis {
    paired: bool,
    per_modality: usize,
    per_group: usize,
}

impl Axis {
    fn new(
        unit: &'static str,
        total: usize,
        paired: bool,
        split_plots: usize,
    ) -> Result<Self, DesignError> {
        let per_modality = if paired { total } else { total / 2 };
        let per_group = per_modality / split_plots;
        if per_group == 0 {
            return Err(DesignError::EmptyGroup {
                unit,
                available: per_modality,
                split_plots,
            });
        }
        if per_group * split_plots != per_modality || (!paired && total % 2 != 0) {
            log::warn!(
                "{total} {unit} do not divide evenly into the layout; {} go unused.",
                total - per_group * split_plots * if paired { 1 } else { 2 }
            );
        }
        Ok(Self {
            paired,
            per_modality,
            per_group,
        })
    }

    /// Unit used under modality A and under modality B.
    fn units(&self, group: usize, offset: usize) -> (usize, usize) {
        let a = offset + self.per_group * group;
        let b = if self.paired { a } else { a + self.per_modality };
        (a, b)
    }
}

fn mark(tensors: &mut [Array3<f64>; 3], case_a: usize, reader_a: usize, case_b: usize, reader_b: usize) {
    let [aa, bb, ab] = tensors;
    aa[[case_a, reader_a, 0]] = 1.0;
    aa[[case_a, reader_a, 1]] = 1.0;
    bb[[case_b, reader_b, 0]] = 1.0;
    bb[[case_b, reader_b, 1]] = 1.0;
    ab[[case_a, reader_a, 0]] = 1.0;
    ab[[case_b, reader_b, 1]] = 1.0;
}

/// Design-only tensors for each slot of a planned study.
#[derive(Clone, Debug)]
pub struct SlotDesigns {
    pub aa: ScoreTensors,
    pub bb: ScoreTensors,
    pub ab: ScoreTensors,
    pub fully_crossed: bool,
}

impl SlotDesigns {
    pub fn slot(&self, slot: Slot) -> &ScoreTensors {
        match slot {
            Slot::AA => &self.aa,
            Slot::BB => &self.bb,
            Slot::AB => &self.ab,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fully_crossed_layout_is_all_present() {
        let size = ExperimentSize::new(3, 4, 5).unwrap();
        let designs = SplitPlotDesign::fully_crossed(size).generate().unwrap();
        assert!(designs.fully_crossed);
        for slot in [Slot::AA, Slot::BB, Slot::AB] {
            assert!(designs.slot(slot).is_fully_crossed());
        }
    }

    #[test]
    fn test_unpaired_readers_never_share_a_reader_across_modalities() {
        let size = ExperimentSize::new(4, 2, 2).unwrap();
        let design = SplitPlotDesign {
            paired_readers: false,
            ..SplitPlotDesign::fully_crossed(size)
        };
        let designs = design.generate().unwrap();
        assert!(!designs.fully_crossed);
        let d0 = designs.ab.d0();
        for r in 0..4 {
            let reads_a = d0[[0, r, 0]] == 1.0;
            let reads_b = d0[[0, r, 1]] == 1.0;
            assert!(reads_a != reads_b, "reader {r} should read exactly one modality");
        }
        // Readers 0 and 1 read A; 2 and 3 read B.
        assert_eq!(d0[[0, 1, 0]], 1.0);
        assert_eq!(d0[[0, 2, 1]], 1.0);
    }

    #[test]
    fn test_split_plots_partition_cases() {
        let size = ExperimentSize::new(4, 4, 6).unwrap();
        let design = SplitPlotDesign {
            split_plots: 2,
            ..SplitPlotDesign::fully_crossed(size)
        };
        let designs = design.generate().unwrap();
        let d1 = designs.aa.d1();
        // Reader 0 belongs to the first group and reads diseases 0..3 only.
        let read: Vec<usize> = (0..6).filter(|&c| d1[[c, 0, 0]] == 1.0).collect();
        assert_eq!(read, vec![0, 1, 2]);
        let read: Vec<usize> = (0..6).filter(|&c| d1[[c, 3, 0]] == 1.0).collect();
        assert_eq!(read, vec![3, 4, 5]);
    }

    #[test]
    fn test_too_many_split_plots() {
        let size = ExperimentSize::new(2, 10, 10).unwrap();
        let design = SplitPlotDesign {
            split_plots: 3,
            ..SplitPlotDesign::fully_crossed(size)
        };
        assert!(matches!(
            design.generate(),
            Err(DesignError::EmptyGroup { unit: "readers", .. })
        ));
    }
}
