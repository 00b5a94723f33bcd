use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hifgam::estimate::{FitConfig, fit_model};
use hifgam::model::ModelSpec;
use hifgam::predict::{GridSpec, predict_marginal};
use hifgam::test_fixtures::SyntheticStudy;

fn benchmark_fit(c: &mut Criterion) {
    let sizes = [(6_usize, 20_usize), (12, 30), (24, 40)];
    let studies: Vec<_> = sizes
        .iter()
        .map(|&(animals, sessions)| {
            let obs = SyntheticStudy::new()
                .with_animals(animals)
                .with_sessions(sessions)
                .seed(0x5EED + animals as u64)
                .build()
                .expect("synthetic study");
            (animals * sessions, obs)
        })
        .collect();

    let spec = ModelSpec::default();
    let config = FitConfig::default();

    let mut group = c.benchmark_group("fit_model");
    group.sample_size(10);
    for (n, obs) in studies.iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("default_formula", n), obs, |b, input| {
            b.iter(|| {
                let model = fit_model(black_box(input), &spec, &config).expect("fit");
                black_box(model);
            });
        });
    }
    group.finish();

    let (_, obs) = &studies[0];
    let model = fit_model(obs, &spec, &config).expect("fit");
    c.bench_function("predict_marginal_131", |b| {
        b.iter(|| {
            let curve = predict_marginal(black_box(&model), &GridSpec::default(), 0.95)
                .expect("prediction");
            black_box(curve);
        });
    });
}

criterion_group!(fit_benchmark, benchmark_fit);
criterion_main!(fit_benchmark);
