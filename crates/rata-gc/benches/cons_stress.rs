//! Benchmark: allocation and collection throughput.
//!
//! Measures cons churn with and without survivors, vector allocation
//! across the size classes, and full-collection pause over a live heap.

use criterion::{criterion_group, criterion_main, Criterion};
use rata_gc::{alloc_vector, cons, gc, nil, protect, unprotect, Kind};
use std::hint::black_box;

fn bench_cons_churn(c: &mut Criterion) {
    c.bench_function("cons_churn_10000", |b| {
        b.iter(|| {
            for _ in 0..10_000 {
                black_box(cons(nil(), nil()).unwrap());
            }
            gc();
        });
    });
}

fn bench_cons_survivors(c: &mut Criterion) {
    c.bench_function("cons_chain_survivors_1000", |b| {
        b.iter(|| {
            let mut head = protect(cons(nil(), nil()).unwrap());
            for _ in 0..1_000 {
                let next = cons(nil(), head).unwrap();
                unprotect(1);
                head = protect(next);
            }
            gc();
            black_box(head);
            unprotect(1);
        });
    });
}

fn bench_small_vectors(c: &mut Criterion) {
    c.bench_function("small_vector_mix_1000", |b| {
        b.iter(|| {
            for len in [1usize, 4, 8, 16] {
                for _ in 0..250 {
                    black_box(alloc_vector(Kind::Real, len).unwrap());
                }
            }
            gc();
        });
    });
}

fn bench_full_collection_pause(c: &mut Criterion) {
    // A live graph that survives every iteration's collection.
    let mut head = protect(cons(nil(), nil()).unwrap());
    for _ in 0..50_000 {
        let next = cons(nil(), head).unwrap();
        unprotect(1);
        head = protect(next);
    }
    c.bench_function("full_collection_50000_live", |b| {
        b.iter(|| {
            gc();
            black_box(head);
        });
    });
    unprotect(1);
}

criterion_group!(
    benches,
    bench_cons_churn,
    bench_cons_survivors,
    bench_small_vectors,
    bench_full_collection_pause
);
criterion_main!(benches);
