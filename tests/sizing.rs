mod common;

use std::sync::atomic::AtomicBool;

use approx::assert_relative_eq;
use common::{init_logging, synthetic_table};
use mrmc::covariance::CovarianceError;
use mrmc::sizing::SizingError;
use mrmc::{
    AnalysisConfig, AnalysisRequest, AnalysisResult, SizingConfig, Warning, analyze, explore_sizes,
    size_trial,
};
use tempfile::NamedTempFile;

fn pilot() -> AnalysisResult {
    init_logging();
    let table = synthetic_table(42, 5, 24, 16);
    let ids = table.study_ids().unwrap();
    analyze(
        &ids,
        &table,
        &AnalysisRequest::difference("A", "B", AnalysisConfig::default()),
    )
    .unwrap()
}

fn planned(readers: usize, normals: usize, diseases: usize) -> SizingConfig {
    SizingConfig {
        readers,
        normals,
        diseases,
        effect_size: 0.05,
        ..SizingConfig::default()
    }
}

#[test]
fn pilot_size_reproduces_pilot_analysis() {
    let pilot = pilot();
    let sized = size_trial(&pilot, &planned(5, 24, 16), None).unwrap();

    assert!(sized.fully_crossed);
    assert_relative_eq!(sized.total_variance, pilot.total_variance, max_relative = 1e-10);
    assert_relative_eq!(
        sized.power.bdg.df.unwrap(),
        pilot.test.df_bdg,
        max_relative = 1e-8
    );

    let hillis = sized.hillis.as_ref().unwrap();
    assert_relative_eq!(
        hillis.df.value,
        pilot.test.df_hillis.unwrap(),
        max_relative = 1e-8
    );
    assert!(sized.power.hillis.is_some());
}

#[test]
fn larger_study_has_smaller_variance_and_more_power() {
    let pilot = pilot();
    let small = size_trial(&pilot, &planned(5, 24, 16), None).unwrap();
    let large = size_trial(&pilot, &planned(10, 96, 64), None).unwrap();

    assert!(large.total_variance < small.total_variance);
    assert!(large.power.normal.power > small.power.normal.power);
    assert!(large.power.bdg.power > small.power.bdg.power);
    let (small_hillis, large_hillis) = (
        small.hillis.as_ref().unwrap(),
        large.hillis.as_ref().unwrap(),
    );
    assert!(large_hillis.variance < small_hillis.variance);
}

#[test]
fn split_plot_design_is_not_fully_crossed() {
    let pilot = pilot();
    let crossed = size_trial(&pilot, &planned(6, 24, 16), None).unwrap();
    let split = SizingConfig {
        split_plots: 2,
        ..planned(6, 24, 16)
    };
    let sized = size_trial(&pilot, &split, None).unwrap();

    assert!(!sized.fully_crossed);
    assert!(sized.hillis.is_none());
    assert!(sized.power.hillis.is_none());
    assert!(sized.warnings.contains(&Warning::NotFullyCrossed));
    assert!(sized.total_variance > crossed.total_variance);
}

#[test]
fn cancelled_design_loop_is_an_error() {
    let pilot = pilot();
    let split = SizingConfig {
        paired_readers: false,
        ..planned(6, 24, 16)
    };
    let cancel = AtomicBool::new(true);
    assert!(matches!(
        size_trial(&pilot, &split, Some(&cancel)),
        Err(SizingError::Covariance(CovarianceError::Cancelled { .. }))
    ));
}

#[test]
fn explored_grid_follows_reader_then_case_order() {
    let pilot = pilot();
    let results = explore_sizes(&pilot, &planned(5, 24, 16), &[3, 8], &[40, 100]).unwrap();

    let sizes: Vec<(usize, usize, usize)> = results
        .iter()
        .map(|r| (r.size.readers, r.size.normals, r.size.diseases))
        .collect();
    assert_eq!(
        sizes,
        vec![(3, 24, 16), (3, 60, 40), (8, 24, 16), (8, 60, 40)]
    );
    for result in &results {
        assert!(result.power.normal.power > 0.0 && result.power.normal.power < 1.0);
    }
}

#[test]
fn sizing_config_round_trips_before_sizing() {
    let pilot = pilot();
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap();
    let config = planned(7, 30, 30);
    config.save(path).unwrap();
    let loaded = SizingConfig::load(path).unwrap();
    assert_eq!(loaded, config);

    let sized = size_trial(&pilot, &loaded, None).unwrap();
    assert_eq!(sized.config, config);
    assert_eq!(sized.size.readers, 7);
}

#[test]
fn invalid_alpha_is_rejected() {
    let pilot = pilot();
    let config = SizingConfig {
        alpha: 0.0,
        ..planned(5, 24, 16)
    };
    assert!(matches!(
        size_trial(&pilot, &config, None),
        Err(SizingError::Config(_))
    ));
}
