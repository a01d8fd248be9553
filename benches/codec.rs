use criterion::*;
use std::hint::black_box;

use minigpu::engine::codec::{narrow_lanes, pack_words, unpack_words, widen_lanes};
use minigpu::LogicalType;

const ELEMENTS: usize = 1_000_000;

fn int8_bytes() -> Vec<u8> {
    (0..ELEMENTS).map(|i| (i % 251) as i8 as u8).collect()
}

fn f64_bytes() -> Vec<u8> {
    (0..ELEMENTS)
        .flat_map(|i| (i as f64 * 0.25 - 1000.0).to_ne_bytes())
        .collect()
}

fn codec_benchmark(c: &mut Criterion) {
    let narrow = int8_bytes();
    let wide = f64_bytes();

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(ELEMENTS as u64));

    group.bench_function("pack_words_int8_1M", |b| {
        b.iter(|| black_box(pack_words(LogicalType::Int8, black_box(&narrow))));
    });

    let packed = pack_words(LogicalType::Int8, &narrow);
    group.bench_function("unpack_words_int8_1M", |b| {
        let mut out = vec![0u8; ELEMENTS];
        b.iter(|| {
            let n = unpack_words(LogicalType::Int8, black_box(&packed), 0, &mut out);
            black_box((n, &out));
        });
    });

    group.bench_function("widen_lanes_int8_1M", |b| {
        b.iter(|| black_box(widen_lanes(LogicalType::Int8, black_box(&narrow))));
    });

    let lanes = widen_lanes(LogicalType::Int8, &narrow);
    group.bench_function("narrow_lanes_int8_1M", |b| {
        let mut out = vec![0u8; ELEMENTS];
        b.iter(|| {
            let n = narrow_lanes(LogicalType::Int8, black_box(&lanes), &mut out);
            black_box((n, &out));
        });
    });

    group.bench_function("pack_words_f64_1M", |b| {
        b.iter(|| black_box(pack_words(LogicalType::Float64, black_box(&wide))));
    });

    group.finish();
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
