use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use delegate_core::{
    decode, decode_value, encode, CallableReference, DeferredInvocation, NamedArgs, Registry,
    Signature, Value,
};
use serde_json::json;

fn setup() -> Registry {
    let registry = Registry::new();
    registry.define(
        "Reports",
        "rebuild",
        Signature::new()
            .required("tenant")
            .optional("since")
            .key("scope")
            .key_optional("force"),
        |_, _| Ok(Value::Null),
    );
    registry
}

fn invocation(registry: &Registry) -> DeferredInvocation {
    let named: NamedArgs = [
        ("scope".to_string(), json!({"kind": "inventory", "ids": [1, 2, 3]})),
        ("force".to_string(), json!(true)),
    ]
    .into_iter()
    .collect();

    DeferredInvocation::bind(
        registry,
        CallableReference::new("Reports", "rebuild"),
        vec![json!("tenant-a"), json!("2024-01-01")],
        named,
    )
    .unwrap()
}

fn bench_bind(c: &mut Criterion) {
    let registry = setup();
    c.bench_function("bind_validated", |b| {
        b.iter(|| black_box(invocation(&registry)));
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let registry = setup();
    let inv = invocation(&registry);

    let mut group = c.benchmark_group("codec");
    group.bench_function("encode", |b| b.iter(|| black_box(encode(&inv))));
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decode(&registry, encode(&inv)).unwrap()))
    });

    for size in [1usize, 16, 256] {
        let payloads: Vec<Value> = (0..size).map(|_| encode(&inv).to_value()).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("decode_value", size), &payloads, |b, payloads| {
            b.iter(|| {
                for p in payloads {
                    black_box(decode_value(&registry, p).unwrap());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bind, bench_round_trip);
criterion_main!(benches);
