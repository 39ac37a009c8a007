#[macro_use]
extern crate criterion;

use criterion::Criterion;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use nais::data::TrainingData;
use nais::datasets;
use nais::evaluation::evaluate;
use nais::models::naism::Hyperparameters;

fn bench_naism(c: &mut Criterion) {
    let mut rng = XorShiftRng::seed_from_u64(42);
    let dataset = datasets::synthetic(1000, 2000, 20, 30, 99, &mut rng);
    let train = dataset.train.to_compressed();

    let mut data = TrainingData::new(train.clone(), 4);
    data.shuffle(&mut rng);
    let batch = data.iter_minibatch(256).next().unwrap();

    let mut model = Hyperparameters::new(dataset.num_items())
        .embedding_dim(16)
        .from_seed(42)
        .build();

    c.bench_function("naism_fit_minibatch", |b| {
        b.iter(|| {
            model.fit_minibatch(&batch).unwrap();
        })
    });

    c.bench_function("naism_evaluate", |b| {
        b.iter(|| evaluate(&model, &train, &dataset.test, 10).unwrap())
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_naism
}
criterion_main!(benches);
