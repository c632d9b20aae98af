criterion::criterion_main!(benches);
criterion::criterion_group! {
    name = benches;
    config = criterion::Criterion::default()
        .without_plots()
        .noise_threshold(3.0)
        .significance_level(0.01)
        .sample_size(50)
        .measurement_time(std::time::Duration::from_secs(2));
    targets =
        recording_a_single_feature,
        recording_a_nested_feature_pair,
        reading_probability_of_a_seen_value,
        scaling_and_pruning_a_populated_table,
}

use spade_engine::prob_table::ProbabilityTable;

fn recording_a_single_feature(c: &mut criterion::Criterion) {
    c.bench_function("record one feature into a probability table", |b| {
        b.iter_batched(
            ProbabilityTable::new,
            |mut table| {
                for v in 0..1000u32 {
                    table.record(&[0], &[v % 64]);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn recording_a_nested_feature_pair(c: &mut criterion::Criterion) {
    c.bench_function("record a two-feature nested observation", |b| {
        b.iter_batched(
            ProbabilityTable::new,
            |mut table| {
                for v in 0..1000u32 {
                    table.record(&[0, 1], &[v % 64, v % 16]);
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn reading_probability_of_a_seen_value(c: &mut criterion::Criterion) {
    let mut table = ProbabilityTable::new();
    for v in 0..2000u32 {
        table.record(&[0], &[v % 128]);
    }
    c.bench_function("read probability of an observed value", |b| {
        b.iter(|| table.probability(&[0], &[42], 0))
    });
}

fn scaling_and_pruning_a_populated_table(c: &mut criterion::Criterion) {
    c.bench_function("scale and prune a populated table", |b| {
        b.iter_batched(
            || {
                let mut table = ProbabilityTable::new();
                for v in 0..5000u32 {
                    table.record(&[0], &[v % 512]);
                }
                table
            },
            |mut table| table.scale_and_prune(0.9, 0.1),
            criterion::BatchSize::SmallInput,
        )
    });
}
