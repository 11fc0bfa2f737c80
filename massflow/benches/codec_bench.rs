//! Benchmarks for the payload wire codec.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use massflow::codec;
use massflow::payload::StagePayload;
use serde_json::{json, Map};

fn report_payload() -> StagePayload {
    let mut payload = StagePayload::generic();
    let envelope = payload.envelope_mut();
    envelope.report_tags(["sample-type:filesample", "benchmark"]);
    let mut report = Map::new();
    for i in 0..64 {
        report.insert(format!("section_{i}"), json!({"entropy": 7.2, "size": 4096 * i}));
    }
    envelope.report_json("bench", report, None, false);
    envelope.report_raw_report_object("dump.bin", vec![0x90; 16 * 1024]);
    payload
}

fn codec_benchmark(c: &mut Criterion) {
    let payload = report_payload();
    let encoded = codec::encode(&payload).unwrap();

    c.bench_function("encode_report_payload", |b| {
        b.iter(|| codec::encode(black_box(&payload)).unwrap())
    });
    c.bench_function("decode_report_payload", |b| {
        b.iter(|| codec::decode(black_box(&encoded)).unwrap())
    });
}

criterion_group!(benches, codec_benchmark);
criterion_main!(benches);
