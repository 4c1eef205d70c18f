//! Codec benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use trap_core::{codec, Format, Message};

fn encode_benchmark(c: &mut Criterion) {
    let msg = Message::data(vec![7u8; 1024]).with_message_id(1).with_channel(1);

    c.bench_function("encode_regular_1k", |b| {
        b.iter(|| black_box(codec::encode(&msg).unwrap()))
    });

    let seven = msg.clone().with_format(Format::SevenBit);
    c.bench_function("encode_seven_bit_1k", |b| {
        b.iter(|| black_box(codec::encode(&seven).unwrap()))
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let msg = Message::data(vec![7u8; 1024]).with_message_id(1).with_channel(1);
    let encoded = codec::encode(&msg).unwrap();

    c.bench_function("decode_regular_1k", |b| {
        b.iter(|| black_box(codec::decode(&encoded).unwrap()))
    });
}

fn compressed_roundtrip_benchmark(c: &mut Criterion) {
    let payload = "a fairly repetitive payload ".repeat(512);

    c.bench_function("roundtrip_compressed_14k", |b| {
        b.iter(|| {
            let msg = Message::data(payload.clone()).with_compressed(true);
            let encoded = codec::encode(&msg).unwrap();
            black_box(codec::decode(&encoded).unwrap())
        })
    });
}

criterion_group!(
    benches,
    encode_benchmark,
    decode_benchmark,
    compressed_roundtrip_benchmark
);
criterion_main!(benches);
