//! Throughput benchmarks for the signal filter chains.
//!
//! Run with: cargo bench -p cvosc_dsp

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use cvosc_dsp::FilterFactory;

fn benchmark_cv_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("cv_filter");
    group.throughput(Throughput::Elements(1));

    group.bench_function("process_sample", |b| {
        let mut filter = FilterFactory::cv_filter(44100.0);
        let mut sample = 0.0_f32;

        b.iter(|| {
            sample = black_box(filter.process(black_box(sample + 0.001)));
        });
    });

    group.finish();
}

fn benchmark_noise_reduction_filter(c: &mut Criterion) {
    c.bench_function("noise_reduction_process_sample", |b| {
        let mut filter = FilterFactory::noise_reduction_filter(44100.0);

        b.iter(|| {
            black_box(filter.process(black_box(0.5)));
        });
    });
}

criterion_group!(benches, benchmark_cv_filter, benchmark_noise_reduction_filter);
criterion_main!(benches);
