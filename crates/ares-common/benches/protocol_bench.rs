// Criterion benchmarks for ares-common protocol layer
//
// Run benchmarks with:
//   cargo bench -p ares-common
//
// For detailed output with plots:
//   cargo bench -p ares-common -- --save-baseline main

use ares_common::transport::JsonCodec;
use ares_common::{CallRequest, CallResponse, FailureKind, ServiceDescriptor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("ares.bench.Service", "10.0.0.1", 9001)
        .with_app_key("ares")
        .with_weight(2)
}

fn bench_request_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_creation");
    let service = descriptor();

    group.bench_function("simple_request", |b| {
        b.iter(|| CallRequest::new(black_box(service.clone()), black_box("sayHello"), vec![json!(42)]));
    });

    group.bench_function("request_with_timeout", |b| {
        b.iter(|| {
            CallRequest::new(black_box(service.clone()), black_box("sayHello"), vec![json!(42)])
                .with_timeout(black_box(5000))
        });
    });

    group.finish();
}

fn bench_request_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_codec");

    let small = CallRequest::new(descriptor(), "method", vec![json!({"value": 42})]);
    let data: Vec<String> = (0..100).map(|i| format!("item_{}", i)).collect();
    let large = CallRequest::new(descriptor(), "method", vec![json!({ "data": data })]);

    group.bench_function("encode_small", |b| {
        b.iter(|| JsonCodec::encode_request(black_box(&small)));
    });

    group.bench_function("encode_large", |b| {
        b.iter(|| JsonCodec::encode_request(black_box(&large)));
    });

    let small_bytes = JsonCodec::encode_request(&small).unwrap();
    let large_bytes = JsonCodec::encode_request(&large).unwrap();

    group.bench_function("decode_small", |b| {
        b.iter(|| JsonCodec::decode_request(black_box(&small_bytes)));
    });

    group.bench_function("decode_large", |b| {
        b.iter(|| JsonCodec::decode_request(black_box(&large_bytes)));
    });

    group.finish();
}

fn bench_response_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_codec");

    let success = CallResponse::success("id-1".to_string(), 3000, json!({"result": 42}));
    let failure = CallResponse::failure(
        "id-2".to_string(),
        3000,
        FailureKind::Rejected,
        "limit reached",
    );

    group.bench_function("encode_success", |b| {
        b.iter(|| JsonCodec::encode_response(black_box(&success)));
    });

    group.bench_function("encode_failure", |b| {
        b.iter(|| JsonCodec::encode_response(black_box(&failure)));
    });

    let success_bytes = JsonCodec::encode_response(&success).unwrap();
    group.bench_function("decode_success", |b| {
        b.iter(|| JsonCodec::decode_response(black_box(&success_bytes)));
    });

    group.finish();
}

fn bench_descriptor_leaf(c: &mut Criterion) {
    let mut group = c.benchmark_group("descriptor_leaf");
    let service = descriptor();
    let leaf = service.to_leaf();

    group.bench_function("to_leaf", |b| {
        b.iter(|| black_box(&service).to_leaf());
    });

    group.bench_function("from_leaf", |b| {
        b.iter(|| ServiceDescriptor::from_leaf("ares.bench.Service", "ares", black_box(&leaf)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_creation,
    bench_request_codec,
    bench_response_codec,
    bench_descriptor_leaf,
);
criterion_main!(benches);
