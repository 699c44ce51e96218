//! Step throughput of the hierarchy and the agent.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use neorl::core::random_surface;
use neorl::{
    AgentDesc, AgentPredQ, CoderKind, ComputeContext, HierarchyDesc, Int2, LayerDesc,
    PredictiveHierarchy,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn hierarchy_desc(size: i32, coder: CoderKind) -> HierarchyDesc {
    let layer = LayerDesc {
        size: Int2::new(size, size),
        coder,
        ..Default::default()
    };
    HierarchyDesc {
        input_size: Int2::new(size, size),
        layers: vec![layer; 2],
        ..Default::default()
    }
}

fn bench_hierarchy_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("hierarchy_step");
    for &(name, coder) in &[("comparison", CoderKind::Comparison), ("sparse", CoderKind::Sparse)] {
        for &size in &[8, 16, 32] {
            let mut rng = StdRng::seed_from_u64(0);
            let mut hierarchy =
                PredictiveHierarchy::new(hierarchy_desc(size, coder), &mut rng).unwrap();
            let input = random_surface(Int2::new(size, size), (0.0, 1.0), &mut rng).unwrap();
            let mut ctx = ComputeContext::new();
            group.bench_with_input(BenchmarkId::new(name, size), &input, |b, input| {
                b.iter(|| hierarchy.sim_step(&mut ctx, black_box(input), true).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_agent_step(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut agent = AgentPredQ::new(AgentDesc::default(), &mut rng).unwrap();
    let input = random_surface(Int2::new(8, 8), (0.0, 1.0), &mut rng).unwrap();
    let action = Array2::from_elem((2, 2), 0.5);
    let mut ctx = ComputeContext::new();
    c.bench_function("agent_step", |b| {
        b.iter(|| {
            agent
                .sim_step(&mut ctx, black_box(&input), black_box(0.5), &action, true)
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_hierarchy_step, bench_agent_step);
criterion_main!(benches);
