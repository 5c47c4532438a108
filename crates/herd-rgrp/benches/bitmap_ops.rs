//! Benchmark: 2-bit cell scan and count over a realistic group bitmap.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use herd_rgrp::bitmap::{count_state, find_state, set_cell};
use herd_types::{BLKST_FREE, BLKST_USED};

/// Build a mostly-full bitmap: 4096 bytes (16384 cells), ~5% free cells in
/// scattered clusters.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0_u8; 4096];
    for cell in 0..16384 {
        set_cell(&mut bm, cell, BLKST_USED);
    }
    let mut pos = 100_u32;
    while pos + 16 < 16384 {
        for cell in pos..pos + 16 {
            set_cell(&mut bm, cell, BLKST_FREE);
        }
        pos += 650;
    }
    bm
}

fn bench_count_state(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("count_free_cells", |b| {
        b.iter(|| black_box(count_state(black_box(&bm), BLKST_FREE)));
    });
}

fn bench_find_state(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("find_free_cell");

    group.bench_function("goal_at_start", |b| {
        b.iter(|| black_box(find_state(black_box(&bm), 0, BLKST_FREE)));
    });

    // Goal just past the last free cluster: forces the wrap path.
    group.bench_function("goal_forces_wrap", |b| {
        b.iter(|| black_box(find_state(black_box(&bm), 16_380, BLKST_FREE)));
    });

    group.finish();
}

criterion_group!(benches, bench_count_state, bench_find_state);
criterion_main!(benches);
