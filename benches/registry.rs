//! Benchmarks for the registry and the parameter engine
//!
//! Registration runs on every node start and every reconnect; parameter
//! parsing runs on every volume request.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pmem_csi::parameters::{parse, Origin};
use pmem_csi::Registry;
use std::collections::BTreeMap;
use std::sync::Arc;

fn bench_register_controller(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_controller", |b| {
        let registry = Registry::default();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let node_id = format!("node-{}", counter % 1000);
            let _ = registry.register_controller(
                black_box(&node_id),
                black_box("tcp://10.0.0.1:10001"),
            );
        });
    });

    let registry = Registry::default();
    for i in 0..1000 {
        let _ = registry.register_controller(&format!("node-{:04}", i), "tcp://10.0.0.1:10001");
    }
    group.bench_function("get_node_controller", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let node_id = format!("node-{:04}", counter % 1000);
            let _ = registry.get_node_controller(black_box(&node_id));
        });
    });

    group.finish();
}

fn bench_concurrent_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    group.throughput(Throughput::Elements(100));

    let registry = Arc::new(Registry::default());
    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_registrations", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let registry = registry.clone();
                    handles.push(tokio::spawn(async move {
                        let node_id = format!("node-{:04}", i);
                        let _ = registry.register_controller(&node_id, "tcp://10.0.0.1:10001");
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_parse_parameters(c: &mut Criterion) {
    let mut group = c.benchmark_group("parameters");
    group.throughput(Throughput::Elements(1));

    let params: BTreeMap<String, String> = [
        ("cacheSize", "4"),
        ("eraseafter", "false"),
        ("persistencyModel", "cache"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    group.bench_function("parse_create_volume", |b| {
        b.iter(|| {
            let _ = parse(black_box(Origin::CreateVolume), black_box(&params));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_register_controller,
    bench_concurrent_registration,
    bench_parse_parameters
);
criterion_main!(benches);
