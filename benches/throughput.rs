//! Throughput Benchmark for respwire
//!
//! Measures command encoding, both decoders under different read sizes,
//! and reply demultiplexing through the connection core.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use respwire::connection::ConnectionCore;
use respwire::protocol::{encode, new_decoder, Command, Decoder, DecoderKind, DecoderLimits};
use respwire::RespValue;

const KINDS: [DecoderKind; 2] = [DecoderKind::Incremental, DecoderKind::Rescan];

/// A pipelined batch of mixed replies, serialized back to back.
fn reply_stream(count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..count {
        let value = match i % 4 {
            0 => RespValue::ok(),
            1 => RespValue::integer(i as i64),
            2 => RespValue::bulk_string(Bytes::from("x".repeat(64))),
            _ => RespValue::array(vec![
                RespValue::bulk_string("field"),
                RespValue::bulk_string(Bytes::from(format!("value:{}", i))),
                RespValue::null(),
            ]),
        };
        value.serialize_into(&mut buf);
    }
    buf
}

/// Benchmark command encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_small", |b| {
        let command = Command::new("GET").arg("key:1234");
        b.iter(|| black_box(encode(&command).unwrap()));
    });

    group.bench_function("set_large", |b| {
        let command = Command::new("SET")
            .arg("key:1234")
            .arg(Bytes::from("x".repeat(64 * 1024)));
        b.iter(|| black_box(encode(&command).unwrap()));
    });

    group.bench_function("mset_100", |b| {
        let command = Command::new("MSET")
            .args_from((0..100).flat_map(|i| [format!("key:{}", i), format!("value:{}", i)]));
        b.iter(|| black_box(encode(&command).unwrap()));
    });

    group.finish();
}

/// Benchmark decoding a pipelined reply stream split into reads of
/// various sizes. Small reads show the cost of rescanning partial values.
fn bench_decode(c: &mut Criterion) {
    let stream = reply_stream(1_000);
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for kind in KINDS {
        for chunk in [16usize, 512, 16 * 1024] {
            group.bench_with_input(BenchmarkId::new(kind.to_string(), chunk), &chunk, |b, &chunk| {
                b.iter(|| {
                    let mut decoder = new_decoder(kind, DecoderLimits::default());
                    let mut decoded = 0;
                    for part in stream.chunks(chunk) {
                        decoded += decoder.feed(part).filter(|v| v.is_ok()).count();
                    }
                    black_box(decoded)
                });
            });
        }
    }

    group.finish();
}

/// Benchmark a large bulk reply arriving in 1 KB reads
fn bench_large_bulk(c: &mut Criterion) {
    let mut payload = Vec::new();
    RespValue::bulk_string(Bytes::from(vec![b'v'; 1024 * 1024])).serialize_into(&mut payload);

    let mut group = c.benchmark_group("large_bulk");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for kind in KINDS {
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| {
                let mut decoder = new_decoder(kind, DecoderLimits::default());
                let mut values = Vec::new();
                for part in payload.chunks(1024) {
                    decoder.extend(part);
                    while let Ok(Some(value)) = decoder.next_value() {
                        values.push(value);
                    }
                }
                black_box(values)
            });
        });
    }

    group.finish();
}

/// Benchmark issuing pipelined commands and resolving their replies
fn bench_pipeline(c: &mut Criterion) {
    let stream = reply_stream(100);
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(100));

    group.bench_function("issue_and_resolve_100", |b| {
        b.iter(|| {
            let mut core =
                ConnectionCore::new(new_decoder(DecoderKind::Incremental, DecoderLimits::default()));
            core.mark_ready().unwrap();
            let receivers: Vec<_> = (0..100)
                .map(|i| core.issue(&Command::new("GET").arg(i)).unwrap().1)
                .collect();
            core.receive(&stream).unwrap();
            black_box(receivers)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_large_bulk,
    bench_pipeline,
);

criterion_main!(benches);
