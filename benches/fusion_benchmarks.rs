//! Criterion benchmarks for the fusion engine.
//!
//! Run with: cargo bench
//! Run specific: cargo bench -- bench_match_patch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array2, Array3};
use rand::prelude::*;
use std::collections::BTreeMap;

use labelfuse::fusion::{fuse, CancelToken, FusionConfig};
use labelfuse::neighborhood::NeighborhoodOffsets;
use labelfuse::patch::{fill_normalized_patch, match_patch};
use labelfuse::weights::{build_mx, solve_weights};
use labelfuse::{AtlasPair, Image3D};

// =============================================================================
// Helper Functions for Test Data Generation
// =============================================================================

fn random_volume(dims: (usize, usize, usize), seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array3::from_shape_fn(dims, |_| rng.gen_range(0.0..10.0))
}

fn strides(dims: (usize, usize, usize)) -> [isize; 3] {
    [(dims.1 * dims.2) as isize, dims.2 as isize, 1]
}

// =============================================================================
// Offset Table Benchmarks
// =============================================================================

fn bench_neighborhood_offsets(c: &mut Criterion) {
    let mut group = c.benchmark_group("neighborhood_offsets");
    for radius in [1usize, 2, 3, 4] {
        let count = (2 * radius + 1).pow(3);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(radius), &radius, |b, &r| {
            b.iter(|| NeighborhoodOffsets::new(black_box([r, r, r]), black_box([2500, 50, 1])))
        });
    }
    group.finish();
}

// =============================================================================
// Patch Matching Benchmarks
// =============================================================================

fn bench_match_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_patch");

    let dims = (32, 32, 32);
    let target = random_volume(dims, 42);
    let atlas = random_volume(dims, 43);
    let s = strides(dims);
    let center = 16 * s[0] as usize + 16 * s[1] as usize + 16;

    for search_radius in [1usize, 2, 3] {
        let patch = NeighborhoodOffsets::new([2, 2, 2], s);
        let search = NeighborhoodOffsets::new([search_radius; 3], s);
        let mut u = vec![0.0f64; patch.len()];
        fill_normalized_patch(target.as_slice().unwrap(), center, &patch, &mut u);

        group.throughput(Throughput::Elements((search.len() * patch.len()) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(search_radius),
            &search_radius,
            |b, _| {
                b.iter(|| {
                    match_patch(
                        black_box(&u),
                        black_box(atlas.as_slice().unwrap()),
                        center,
                        &patch,
                        &search,
                        true,
                    )
                })
            },
        );
    }
    group.finish();
}

// =============================================================================
// Weight Solver Benchmarks
// =============================================================================

fn bench_solve_weights(c: &mut Criterion) {
    let mut group = c.benchmark_group("solve_weights");

    for n_atlases in [2usize, 5, 10, 20] {
        let mut rng = StdRng::seed_from_u64(7);
        let apd = Array2::from_shape_fn((n_atlases, 125), |_| rng.gen_range(0.0..2.0));
        let mx = build_mx(&apd, 2.0, 0.1);

        group.bench_with_input(
            BenchmarkId::from_parameter(n_atlases),
            &n_atlases,
            |b, _| b.iter(|| solve_weights(black_box(&mx)).unwrap()),
        );
    }
    group.finish();
}

// =============================================================================
// End-to-End Benchmarks
// =============================================================================

fn bench_fuse_small_volume(c: &mut Criterion) {
    let dims = (24, 24, 24);
    let target = Image3D::from_array(random_volume(dims, 1));

    let mut atlases = Vec::new();
    for i in 0..4u64 {
        let intensity = Image3D::from_array(random_volume(dims, 10 + i));
        let mut rng = StdRng::seed_from_u64(20 + i);
        let labels = Image3D::from_array(Array3::from_shape_fn(dims, |_| rng.gen_range(0..3)));
        atlases.push(AtlasPair::new(intensity, labels));
    }

    let config = FusionConfig {
        patch_radius: [1, 1, 1],
        search_radius: [1, 1, 1],
        ..FusionConfig::default()
    };

    c.bench_function("fuse_24cube_4atlases", |b| {
        b.iter(|| {
            fuse(
                black_box(&target),
                black_box(&atlases),
                &BTreeMap::new(),
                &config,
                &CancelToken::new(),
            )
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_neighborhood_offsets,
    bench_match_patch,
    bench_solve_weights,
    bench_fuse_small_volume
);
criterion_main!(benches);
