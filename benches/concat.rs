//! Benchmark suite for concatenation
//!
//! Measures planning, boundary resolution and end-to-end launches over
//! ragged and uniform segment sets.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use concatenar::cursor::SegmentCursor;
use concatenar::dtype::ElementWidth;
use concatenar::testing::FixtureGenerator;
use concatenar::{concat, EngineConfig, TilingPlanner};

fn ragged_lengths(count: usize) -> Vec<usize> {
    (0..count).map(|i| 1 + (i * 37) % 211).collect()
}

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let config = EngineConfig::default();

    for segments in [2usize, 16, 128].iter() {
        let fixture = FixtureGenerator::new(1).generate(256, &ragged_lengths(*segments), ElementWidth::B32);
        let table = fixture.table().expect("fixture table");
        group.bench_with_input(BenchmarkId::from_parameter(segments), segments, |b, _| {
            let planner = TilingPlanner::new(&config);
            b.iter(|| black_box(planner.plan(black_box(&table)).expect("plan")));
        });
    }

    group.finish();
}

fn benchmark_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for segments in [16usize, 256, 4096].iter() {
        let lengths = ragged_lengths(*segments);
        group.bench_with_input(BenchmarkId::from_parameter(segments), segments, |b, _| {
            b.iter(|| {
                let mut cursor = SegmentCursor::from_origin(&lengths).expect("cursor");
                while !cursor.is_exhausted() {
                    black_box(cursor.resolve(&lengths, 64).expect("resolve"));
                }
                black_box(cursor.advance_steps())
            });
        });
    }

    group.finish();
}

fn benchmark_concat(c: &mut Criterion) {
    let mut group = c.benchmark_group("concat");
    let shapes: [(&str, usize, Vec<usize>); 3] = [
        ("ragged_wide", 64, ragged_lengths(24)),
        ("ragged_tall", 4096, ragged_lengths(6)),
        ("uniform_narrow", 1024, vec![3; 64]),
    ];

    for (name, rows, lengths) in &shapes {
        let fixture = FixtureGenerator::new(7).generate(*rows, lengths, ElementWidth::B32);
        let table = fixture.table().expect("fixture table");
        let mut out = vec![0u8; fixture.output_bytes()];
        for overlap in [false, true] {
            let config = EngineConfig::default().with_overlap_transfers(overlap);
            let id = BenchmarkId::new(*name, if overlap { "overlapped" } else { "sequential" });
            group.bench_function(id, |b| {
                b.iter(|| black_box(concat(black_box(&table), &mut out, &config).expect("concat")));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan, benchmark_resolve, benchmark_concat);
criterion_main!(benches);
