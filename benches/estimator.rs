use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mrmc::covariance::{design_coefficients, estimate};
use mrmc::design::SplitPlotDesign;
use mrmc::study::{ExperimentSize, ScoreTensors};
use ndarray::Array3;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_tensors(size: &ExperimentSize) -> ScoreTensors {
    let mut rng = StdRng::seed_from_u64(0x5EED_A0C + size.cases() as u64);
    let t0 = Array3::from_shape_fn((size.normals, size.readers, 2), |_| {
        rng.sample::<f64, _>(Standard)
    });
    let t1 = Array3::from_shape_fn((size.diseases, size.readers, 2), |_| {
        rng.sample::<f64, _>(Standard) + 0.3
    });
    let d0 = Array3::ones(t0.dim());
    let d1 = Array3::ones(t1.dim());
    ScoreTensors::new(size, t0, t1, d0, d1).unwrap()
}

fn benchmark_estimator(c: &mut Criterion) {
    let sizes = [(5_usize, 50_usize, 50_usize), (10, 100, 100), (20, 200, 200)];

    let mut group = c.benchmark_group("slot_estimate");
    for &(readers, normals, diseases) in &sizes {
        let size = ExperimentSize::new(readers, normals, diseases).unwrap();
        let tensors = random_tensors(&size);
        group.throughput(Throughput::Elements((readers * normals * diseases) as u64));
        group.bench_with_input(BenchmarkId::new("estimate", readers), &tensors, |b, input| {
            b.iter(|| black_box(estimate(black_box(input))));
        });
    }
    group.finish();

    let mut group = c.benchmark_group("design_coefficients");
    for &(readers, normals, diseases) in &sizes {
        let size = ExperimentSize::new(readers, normals, diseases).unwrap();
        let design = SplitPlotDesign {
            split_plots: 2,
            paired_readers: false,
            ..SplitPlotDesign::fully_crossed(size)
        };
        let designs = design.generate().unwrap();
        group.throughput(Throughput::Elements((readers * normals * diseases) as u64));
        group.bench_with_input(BenchmarkId::new("split_plot", readers), &designs.ab, |b, input| {
            b.iter(|| black_box(design_coefficients(black_box(input), None).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(estimator, benchmark_estimator);
criterion_main!(estimator);
