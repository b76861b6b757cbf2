#[macro_use]
extern crate criterion;

use conduit::buffer::MessageBuffer;
use criterion::{black_box, Criterion};

fn write_bits_bench(c: &mut Criterion) {
    c.bench_function("buffer write_bits", move |b| {
        b.iter(|| {
            let mut buf = MessageBuffer::with_byte_capacity(256);
            for i in 0..64u64 {
                buf.write_bits(black_box(i), 11);
            }
            black_box(buf.bit_length());
        })
    });
}

fn read_bits_bench(c: &mut Criterion) {
    let mut prepared = MessageBuffer::with_byte_capacity(256);
    for i in 0..64u64 {
        prepared.write_bits(i, 11);
    }
    let bytes = prepared.as_bytes().to_vec();
    let bit_length = prepared.bit_length();

    c.bench_function("buffer read_bits", move |b| {
        b.iter(|| {
            let mut reader = MessageBuffer::from_bytes(bytes.clone(), bit_length);
            let mut sum = 0u64;
            for _ in 0..64u64 {
                sum = sum.wrapping_add(reader.read_bits(11).unwrap());
            }
            black_box(sum);
        })
    });
}

fn varint_roundtrip_bench(c: &mut Criterion) {
    c.bench_function("buffer var_u64 roundtrip", move |b| {
        b.iter(|| {
            let mut buf = MessageBuffer::new();
            for v in [0u64, 127, 128, 16384, u32::MAX as u64, u64::MAX] {
                buf.write_var_u64(black_box(v));
            }
            let mut reader = MessageBuffer::from_bytes(buf.as_bytes().to_vec(), buf.bit_length());
            for _ in 0..6 {
                black_box(reader.read_var_u64().unwrap());
            }
        })
    });
}

criterion_group!(benches, write_bits_bench, read_bits_bench, varint_roundtrip_bench);
criterion_main!(benches);
