// Criterion benchmarks for ajplb-balancer
//
// Run benchmarks with:
//   cargo bench -p ajplb-balancer
//
// For detailed output with plots:
//   cargo bench -p ajplb-balancer -- --save-baseline main

use std::collections::HashMap;
use std::sync::Arc;

use ajplb_balancer::{session_routes, AjpWorker, Balancer, BalancerConfig, MemberConfig, WorkerConfig};
use ajplb_common::runtime::{InMemoryStore, ManualClock};
use ajplb_common::{ForwardRequest, RuntimeRegistry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn balancer(count: usize) -> Balancer {
    let registry = Arc::new(RuntimeRegistry::new(
        Arc::new(ManualClock::at_unix(1_000_000)),
        Arc::new(InMemoryStore::new()),
    ));
    let names: Vec<String> = (0..count).map(|i| format!("node{}", i)).collect();
    let workers: HashMap<String, Arc<AjpWorker>> = names
        .iter()
        .map(|name| {
            let config = WorkerConfig::new(name.as_str(), "127.0.0.1", 8009);
            (name.clone(), Arc::new(AjpWorker::new(config, registry.clone()).unwrap()))
        })
        .collect();
    let members = names.iter().map(|name| MemberConfig::new(name.as_str())).collect();
    Balancer::new(&BalancerConfig::new("lb", members), &workers, registry).unwrap()
}

fn bench_try_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_select");

    for count in [2, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::new("plain", count), count, |b, &count| {
            let lb = balancer(count);
            let request = ForwardRequest::new("GET", "/");
            b.iter(|| black_box(lb.try_select(black_box(&request), &[]).unwrap()));
        });
    }

    group.bench_function("sticky_8", |b| {
        let lb = balancer(8);
        let request = ForwardRequest::new("GET", "/cart").with_header("Cookie", "JSESSIONID=AB12CD.node5");
        b.iter(|| black_box(lb.try_select(black_box(&request), &[]).unwrap()));
    });

    group.bench_function("excluding_half_8", |b| {
        let lb = balancer(8);
        let request = ForwardRequest::new("GET", "/");
        let exclude = [0, 1, 2, 3];
        b.iter(|| black_box(lb.try_select(black_box(&request), &exclude).unwrap()));
    });

    group.finish();
}

fn bench_session_routes(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_routes");

    group.bench_function("cookie", |b| {
        let request = ForwardRequest::new("GET", "/")
            .with_header("Cookie", "theme=dark; JSESSIONID=AB12CD.node1; lang=en");
        b.iter(|| session_routes(black_box(&request), "jsessionid", "JSESSIONID"));
    });

    group.bench_function("path_and_cookies", |b| {
        let request = ForwardRequest::new("GET", "/shop;jsessionid=XY.node2")
            .with_header("Cookie", "JSESSIONID=AB.node1")
            .with_header("Cookie", "JSESSIONID=CD.node3");
        b.iter(|| session_routes(black_box(&request), "jsessionid", "JSESSIONID"));
    });

    group.bench_function("no_session", |b| {
        let request = ForwardRequest::new("GET", "/index.html");
        b.iter(|| session_routes(black_box(&request), "jsessionid", "JSESSIONID"));
    });

    group.finish();
}

criterion_group!(benches, bench_try_select, bench_session_routes);
criterion_main!(benches);
