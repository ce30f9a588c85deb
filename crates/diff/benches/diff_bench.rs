//! Benchmarks for ripple-diff.
//!
//! Target: diffing a 1000-document result with a handful of changes < 1ms

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_core::{Document, SortSpec};
use ripple_diff::{diff_ordered, diff_unordered, stabilize_ties, ChangeBatch, IdMap};

fn make_docs(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            Document::empty(format!("doc-{i:06}"))
                .with("rank", (i % 97) as i64)
                .with("name", format!("name-{i}"))
        })
        .collect()
}

/// Changes every 50th document and rotates the first tenth to the end.
fn perturb(docs: &[Document]) -> Vec<Document> {
    let mut out: Vec<Document> = docs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            if i % 50 == 0 {
                d.clone().with("rank", -1i64)
            } else {
                d.clone()
            }
        })
        .collect();
    let k = out.len() / 10;
    out.rotate_left(k);
    out
}

fn to_map(docs: &[Document]) -> IdMap {
    docs.iter().map(|d| (d.id().clone(), d.clone())).collect()
}

fn bench_unordered(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_unordered");

    for size in [10, 100, 1000, 10000] {
        let old = make_docs(size);
        let new = perturb(&old);
        let (old, new) = (to_map(&old), to_map(&new));

        group.bench_with_input(BenchmarkId::new("perturbed", size), &(old, new), |b, (old, new)| {
            b.iter(|| {
                let mut batch = ChangeBatch::deferred();
                diff_unordered(black_box(old), black_box(new), &mut batch);
                batch.len()
            })
        });
    }

    group.finish();
}

fn bench_ordered(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff_ordered");

    for size in [10, 100, 1000, 10000] {
        let old = make_docs(size);
        let new = perturb(&old);

        group.bench_with_input(BenchmarkId::new("perturbed", size), &(old, new), |b, (old, new)| {
            b.iter(|| {
                let mut batch = ChangeBatch::deferred();
                diff_ordered(black_box(old), black_box(new), &mut batch);
                batch.len()
            })
        });
    }

    group.finish();
}

fn bench_stabilize(c: &mut Criterion) {
    let mut group = c.benchmark_group("stabilize_ties");
    let sort = SortSpec::new().asc("rank");

    for size in [100, 1000, 10000] {
        let mut old = make_docs(size);
        old.sort_by(|a, b| sort.compare(a, b));
        let mut new = old.clone();
        new.reverse();
        new.sort_by(|a, b| sort.compare(a, b));

        group.bench_with_input(BenchmarkId::new("reversed_ties", size), &(old, new), |b, (old, new)| {
            b.iter(|| stabilize_ties(black_box(old), new.clone(), Some(&sort)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_unordered, bench_ordered, bench_stabilize);
criterion_main!(benches);
