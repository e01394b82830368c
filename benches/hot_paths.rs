use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tagflow::{Counter, Engine, EngineConfig, FastBinner, NumberingScheme, Tag};

const PS_PER_SECOND: u64 = 1_000_000_000_000;

fn bench_binner(c: &mut Criterion) {
    let cases = [
        ("dividend", FastBinner::new(1, PS_PER_SECOND)),
        ("power_of_two", FastBinner::new(1024, PS_PER_SECOND)),
        ("fixed_point_64", FastBinner::new(1000, PS_PER_SECOND)),
        ("divide_64", FastBinner::new(999_999_937, u64::MAX / 2)),
    ];

    for (name, binner) in cases {
        c.bench_function(&format!("binner/{name}"), |b| {
            b.iter(|| {
                let mut acc = 0u64;
                for x in (0..1_000_000u64).step_by(977) {
                    acc = acc.wrapping_add(binner.bin(black_box(x)));
                }
                black_box(acc)
            })
        });
    }
}

fn synthetic_block(begin: i64, width: i64, events: usize) -> Vec<Tag> {
    let step = width / events as i64;
    (0..events)
        .map(|i| {
            let channel = if i % 3 == 0 { 2 } else { 1 };
            Tag::time_tag(begin + i as i64 * step, channel)
        })
        .collect()
}

fn bench_counter_dispatch(c: &mut Criterion) {
    let engine = Engine::new(EngineConfig {
        scheme: NumberingScheme::OneBased,
        input_channels: 8,
        ..EngineConfig::default()
    });
    let input = engine.input();
    let counter = Counter::new(&engine, vec![1, 2], 1_000_000, 64).expect("counter");

    let width = 20_000_000i64;
    let mut begin = 0i64;

    c.bench_function("dispatch/counter_20ms_block_8k_tags", |b| {
        b.iter(|| {
            let tags = synthetic_block(begin, width, 8_192);
            input
                .send_block(black_box(tags), begin, begin + width)
                .expect("send");
            begin += width;
        });
        engine.flush(-1).expect("flush");
    });

    black_box(counter.get_data_total_counts());
}

criterion_group!(benches, bench_binner, bench_counter_dispatch);
criterion_main!(benches);
