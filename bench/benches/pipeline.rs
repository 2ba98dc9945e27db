use criterion::{criterion_group, criterion_main, Criterion};
use declscan::{
    config::Config,
    extract::{extract, extract_file, SourceMap},
};
use std::{hint::black_box, num::NonZeroUsize};

fn sources() -> SourceMap {
    [
        ("graphics.h", include_str!("../../tests/fixtures/graphics.h")),
        ("containers.hpp", include_str!("../../tests/fixtures/containers.hpp")),
        ("core/macros.h", include_str!("../../tests/fixtures/core/macros.h")),
        ("core/memory.hpp", include_str!("../../tests/fixtures/core/memory.hpp")),
        ("core/base.hpp", include_str!("../../tests/fixtures/core/base.hpp")),
    ]
    .into_iter()
    .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let sources = sources();
    let config = Config::default().with_flag("__linux__", true);

    c.bench_function("extract_file", |b| {
        b.iter(|| {
            let outcome = extract_file(&sources, black_box("core/base.hpp"), &config);
            black_box(outcome);
        })
    });

    let sequential = config.clone().with_workers(NonZeroUsize::MIN);
    c.bench_function("extract (1 worker)", |b| {
        b.iter(|| {
            black_box(extract(black_box(&sources), &sequential));
        })
    });

    c.bench_function("extract", |b| {
        b.iter(|| {
            black_box(extract(black_box(&sources), &config));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
