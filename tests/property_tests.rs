//! Property-based tests using proptest
//!
//! Invariants of the concatenation engine:
//! - Resolver spans reconstruct `[0, Σ L)` in order
//! - Resolver cost stays linear in segments plus requests
//! - Worker regions tile the output exactly once
//! - Strategy selection and index generation are pure
//! - Engine output equals the naive concatenation

use proptest::prelude::*;

use concatenar::config::DeviceConfig;
use concatenar::cursor::SegmentCursor;
use concatenar::repack::{gather_index, scatter_index, select_strategy, FragmentShape};
use concatenar::testing::{naive_concat, FixtureGenerator};
use concatenar::{concat_to_vec, ElementWidth, EngineConfig, TilePlanner, TilingPlanner};

fn width_strategy() -> impl Strategy<Value = ElementWidth> {
    prop_oneof![
        Just(ElementWidth::B8),
        Just(ElementWidth::B16),
        Just(ElementWidth::B32),
        Just(ElementWidth::B64),
    ]
}

fn medium_device() -> DeviceConfig {
    DeviceConfig::small().with_staging_bytes(32 * 1024)
}

/// Resolve `lengths` with `requests` cycled until the cursor is exhausted;
/// returns the absolute columns visited and the cursor
fn drain(lengths: &[usize], requests: &[usize]) -> (Vec<usize>, SegmentCursor, usize) {
    let lengths = lengths.to_vec();
    let prefix: Vec<usize> = lengths
        .iter()
        .scan(0, |acc, &len| {
            let start = *acc;
            *acc += len;
            Some(start)
        })
        .collect();
    let total: usize = lengths.iter().sum();

    let mut cursor = SegmentCursor::from_origin(&lengths).expect("non-empty table");
    let mut columns = Vec::with_capacity(total);
    let mut calls = 0;
    for &request in requests.iter().cycle().take(total + 2) {
        if cursor.is_exhausted() {
            break;
        }
        let resolution = cursor.resolve(&lengths, request).expect("resolve");
        calls += 1;
        for fragment in resolution.split.fragments(&lengths).expect("fragments") {
            let start = prefix[fragment.segment] + fragment.offset;
            columns.extend(start..start + fragment.cols);
        }
    }
    (columns, cursor, calls)
}

// ============================================================================
// BOUNDARY RESOLVER
// ============================================================================

proptest! {
    /// Concatenated spans cover every column once, in order
    #[test]
    fn prop_resolver_reconstructs_axis(
        lengths in prop::collection::vec(0usize..20, 1..10),
        requests in prop::collection::vec(1usize..9, 1..5),
    ) {
        let total: usize = lengths.iter().sum();
        let (columns, cursor, _) = drain(&lengths, &requests);
        prop_assert_eq!(columns, (0..total).collect::<Vec<_>>());
        prop_assert!(cursor.is_exhausted());
    }

    /// Segment-advance steps are bounded by segments plus calls
    #[test]
    fn prop_resolver_steps_linear(
        lengths in prop::collection::vec(0usize..6, 1..60),
        request in 1usize..4,
    ) {
        let (_, cursor, calls) = drain(&lengths, &[request]);
        prop_assert!(cursor.advance_steps() <= lengths.len() + calls);
        // A segment index is passed at most once
        prop_assert!(cursor.advance_steps() < lengths.len());
    }
}

// ============================================================================
// TILE PLANNER
// ============================================================================

proptest! {
    /// Worker regions are disjoint and cover the output
    #[test]
    fn prop_partition_disjoint_and_covering(
        rows in 1usize..100,
        lengths in prop::collection::vec(0usize..300, 1..6),
        cores in 1usize..16,
    ) {
        let fixture = FixtureGenerator::new(0).generate(rows, &lengths, ElementWidth::B32);
        let table = fixture.table().expect("table");
        let config = EngineConfig::new(medium_device().with_core_count(cores));
        let plan = TilingPlanner::new(&config).plan(&table).expect("plan");
        let regions: Vec<_> = TilePlanner::new(&plan)
            .assignments()
            .expect("assignments")
            .into_iter()
            .map(|a| a.region)
            .collect();

        prop_assert!(plan.worker_count <= cores);
        let area: usize = regions.iter().map(|r| r.area()).sum();
        prop_assert_eq!(area, rows * table.total_axis_len());
        for (i, a) in regions.iter().enumerate() {
            prop_assert!(a.row_offset + a.rows <= rows);
            prop_assert!(a.col_offset + a.cols <= table.total_axis_len());
            for b in &regions[i + 1..] {
                prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }
}

// ============================================================================
// REPACK STRATEGY
// ============================================================================

proptest! {
    /// Same shape, same strategy, same index vectors
    #[test]
    fn prop_strategy_selection_pure(
        width in width_strategy(),
        rows in 1usize..64,
        cols in 0usize..600,
        pad in 0usize..100,
        segment_len in prop::option::of(1usize..40),
        vector_bytes in prop_oneof![Just(64usize), Just(128), Just(256)],
    ) {
        let shape = FragmentShape {
            width,
            rows,
            cols,
            stride: cols + pad,
            segment_len,
        };
        prop_assert_eq!(
            select_strategy(&shape, vector_bytes),
            select_strategy(&shape, vector_bytes)
        );

        let lanes = width.lanes(vector_bytes);
        prop_assert_eq!(
            scatter_index(cols, cols + pad, lanes),
            scatter_index(cols, cols + pad, lanes)
        );
        if let Some(seg) = segment_len {
            let stride = rows * seg + pad;
            prop_assert_eq!(
                gather_index(cols, seg, stride, lanes),
                gather_index(cols, seg, stride, lanes)
            );
        }
    }
}

// ============================================================================
// END TO END
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Engine output equals the row-by-row reference
    #[test]
    fn prop_concat_matches_naive(
        seed in any::<u64>(),
        width in width_strategy(),
        padding in 0usize..4,
        overlap in any::<bool>(),
    ) {
        let fixture = FixtureGenerator::new(seed)
            .with_row_padding(padding)
            .random(48, 8, 70, width);
        let table = fixture.table().expect("table");
        let config = EngineConfig::new(medium_device()).with_overlap_transfers(overlap);
        let (out, report) = concat_to_vec(&table, &config).expect("concat");
        prop_assert_eq!(out, naive_concat(&table));
        prop_assert_eq!(report.bytes_out(), fixture.output_bytes());
    }
}
