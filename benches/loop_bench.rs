use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use undertow::{pmap, run_flow, ErrorPolicy, FlowOptions, Loop, TaskProxy};

fn blocking_call(n: u64) -> u64 {
    std::thread::sleep(Duration::from_micros(200));
    n * n
}

/// Benchmark sequential iteration vs the pooled loop on blocking items
fn bench_sequential_vs_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_vs_loop");

    for size in [8u64, 32, 128].iter() {
        group.bench_with_input(BenchmarkId::new("sequential", size), size, |b, &size| {
            b.iter(|| {
                let results: Vec<u64> = (0..size).map(blocking_call).collect();
                black_box(results)
            });
        });

        group.bench_with_input(BenchmarkId::new("loop", size), size, |b, &size| {
            b.iter(|| {
                let results = Loop::over(0..size)
                    .workers(8)
                    .on_error(ErrorPolicy::Raise)
                    .run(|n, _| Ok(blocking_call(*n)))
                    .unwrap();
                black_box(results.into_values())
            });
        });
    }

    group.finish();
}

/// Benchmark scheduling overhead of pmap on trivial items
fn bench_pmap_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("pmap_overhead");

    for size in [100u64, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(pmap(|n: &u64| Ok(n.wrapping_mul(31)), 0..size).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark fan-out/fan-in through a flow
fn bench_flow_fan_in(c: &mut Criterion) {
    c.bench_function("flow_fan_in_64", |b| {
        b.iter(|| {
            run_flow(FlowOptions::new(), |fx| {
                let parts: Vec<TaskProxy<u64>> =
                    (0..64u64).map(|n| fx.spawn("part", move || Ok(n))).collect();
                fx.spawn_after("sum", parts, |ns| Ok(ns.into_iter().sum::<u64>()))
                    .resolve()
            })
            .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_vs_loop,
    bench_pmap_overhead,
    bench_flow_fan_in
);
criterion_main!(benches);
