//! Mixer engine benchmarks
//!
//! Measures the hot paths that run every tick of the engine loop: meter
//! normalization, message template generation, and end-to-end OSC routing
//! through a live `MixerEngine`.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use cvosc_core::{Channel, FormatManager, MixerEngine};

fn benchmark_channel_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_normalization");
    let mut channel = Channel::new(0, "bench".to_string(), -10.0, 10.0).unwrap();

    group.bench_function("set_and_read_level", |b| {
        let mut volts = -10.0f32;
        b.iter(|| {
            channel.set_level_volts(black_box(volts));
            volts = if volts >= 10.0 { -10.0 } else { volts + 0.25 };
            black_box(channel.normalized_level())
        })
    });

    group.finish();
}

fn benchmark_generate_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_manager");

    for channel_count in [1, 8, 32].iter() {
        let mut manager = FormatManager::new();
        let cv_values: Vec<f32> = (0..*channel_count).map(|i| (i as f32 / *channel_count as f32) * 10.0).collect();

        group.throughput(Throughput::Elements(*channel_count as u64));
        group.bench_function(format!("generate_messages_{}_channels", channel_count), |b| {
            b.iter(|| black_box(manager.generate_messages(black_box(&cv_values))))
        });
    }

    group.finish();
}

fn benchmark_route_incoming_osc(c: &mut Criterion) {
    let engine = MixerEngine::new().expect("engine starts");
    engine.start_channel(0).expect("channel starts");

    c.bench_function("route_incoming_osc", |b| {
        let mut volts = 0.0f32;
        b.iter(|| {
            engine
                .route_incoming_osc("/cv/1".to_string(), vec![black_box(volts)])
                .expect("queued");
            volts = if volts >= 10.0 { 0.0 } else { volts + 0.1 };
        })
    });
}

criterion_group!(benches, benchmark_channel_normalization, benchmark_generate_messages, benchmark_route_incoming_osc);
criterion_main!(benches);
