#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
//! Variance, tests and power for multi-reader multi-case (MRMC) studies of
//! the area under the ROC curve.

pub mod analysis;
pub mod components;
pub mod config;
pub mod covariance;
pub mod design;
pub mod inference;
pub mod matrix;
pub mod sizing;
pub mod study;
pub mod types;

pub use analysis::{AnalysisRequest, AnalysisResult, analyze, analyze_summary, analyze_tensors};
pub use config::{AnalysisConfig, SizingConfig};
pub use sizing::{SizingResult, explore_sizes, size_trial};
pub use study::{ExperimentSize, ScoreLookup, ScoreTable, Truth};
pub use types::{Analysis, Estimator, Warning};
