//! Criterion benchmarks for conflict-averse encoder aggregation.
//!
//! Sweeps the client count at a fixed encoder dimension; the solver cost is
//! quadratic in clients, the blend linear in parameters.
//!
//! Run: cargo bench --bench aggregate_bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fedmtl_core::aggregate::conflict_averse_delta;
use fedmtl_core::tensor::SimpleRng;

fn make_deltas(clients: usize, dim: usize) -> Vec<Vec<f32>> {
    let mut rng = SimpleRng::new(0xfed);
    (0..clients)
        .map(|_| {
            let mut d = vec![0.0f32; dim];
            rng.fill_uniform(&mut d, 0.1);
            d
        })
        .collect()
}

fn bench_conflict_averse(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflict_averse_delta");
    for clients in [2usize, 4, 8, 16] {
        let deltas = make_deltas(clients, 4096);
        group.bench_with_input(
            BenchmarkId::from_parameter(clients),
            &deltas,
            |b, deltas| b.iter(|| conflict_averse_delta(deltas, 0.5)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_conflict_averse);
criterion_main!(benches);
