use mrmc::{ScoreTable, Truth};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Roe-Metz style study: score = separation * truth + reader + case +
/// modality x case + noise, for modalities "A" and "B".
pub fn synthetic_table(seed: u64, readers: usize, normals: usize, diseases: usize) -> ScoreTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let unit = Normal::new(0.0, 1.0).unwrap();
    let mut table = ScoreTable::new();

    let reader_effects: Vec<f64> = (0..readers).map(|_| 0.4 * unit.sample(&mut rng)).collect();
    let cases: Vec<(String, Truth)> = (0..normals)
        .map(|i| (format!("normal{}", i + 1), Truth::Normal))
        .chain((0..diseases).map(|j| (format!("disease{}", j + 1), Truth::Disease)))
        .collect();

    for (case, truth) in &cases {
        table.insert_truth(case.clone(), *truth);
        let case_effect = 0.8 * unit.sample(&mut rng);
        for (modality, separation) in [("A", 1.3), ("B", 0.9)] {
            let modality_case = 0.3 * unit.sample(&mut rng);
            let shift = if *truth == Truth::Disease { separation } else { 0.0 };
            for (r, reader_effect) in reader_effects.iter().enumerate() {
                let noise = 0.5 * unit.sample(&mut rng);
                table.insert_score(
                    format!("reader{}", r + 1),
                    case.clone(),
                    modality,
                    shift + reader_effect + case_effect + modality_case + noise,
                );
            }
        }
    }
    table
}
