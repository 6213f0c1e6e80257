//! Wire codec benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shroud_core::{Chunk, ChunkBuilder, Footer, MediaStreamType, Packet};

fn encode_benchmark(c: &mut Criterion) {
    let payload = Bytes::from(vec![0x5Au8; 1024]);

    c.bench_function("encode_data_chunk", |b| {
        b.iter(|| {
            black_box(
                ChunkBuilder::new(MediaStreamType::Video, 42, 1)
                    .message(7, false)
                    .data(payload.clone())
                    .encode()
                    .unwrap(),
            )
        })
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let encoded = ChunkBuilder::new(MediaStreamType::Video, 42, 1)
        .message(7, false)
        .data(vec![0x5Au8; 1024])
        .encode()
        .unwrap();

    c.bench_function("decode_data_chunk", |b| {
        b.iter(|| black_box(Chunk::parse(encoded.clone(), None).unwrap()))
    });
}

fn classify_benchmark(c: &mut Criterion) {
    let footer = Footer::new(MediaStreamType::Audio, 42).encode();

    c.bench_function("classify_footer", |b| {
        b.iter(|| black_box(Packet::decode(footer.clone()).unwrap()))
    });
}

criterion_group!(benches, encode_benchmark, decode_benchmark, classify_benchmark);
criterion_main!(benches);
