//! Test fixtures for concatenation
//!
//! Reproducible segment sets for unit, property and benchmark tests, plus a
//! row-by-row reference concatenation to compare the engine against.
//!
//! ```text
//! FixtureGenerator(seed) → ConcatFixture → SegmentTable → engine output
//!                                               ↓
//!                                         naive_concat  == ?
//! ```

pub mod generators;

pub use generators::{ConcatFixture, FixtureGenerator, SegmentSpec};

use crate::segment::SegmentTable;

/// Reference concatenation, one output row at a time
///
/// Element bytes are copied as-is, so the result is comparable to an engine
/// run at any processing width.
#[must_use]
pub fn naive_concat(table: &SegmentTable<'_>) -> Vec<u8> {
    let w = table.width().bytes();
    let mut out = Vec::with_capacity(table.rows() * table.total_axis_len() * w);
    for row in 0..table.rows() {
        for seg in table.segments().iter().filter(|seg| seg.axis_len() > 0) {
            let start = row * seg.row_stride() * w;
            out.extend_from_slice(&seg.data()[start..start + seg.axis_len() * w]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ElementWidth;
    use crate::segment::Segment;

    #[test]
    fn test_naive_concat_interleaves_rows() {
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6, 7, 8, 9, 10];
        let table = SegmentTable::new(
            vec![
                Segment::new(&a, 2, 2, ElementWidth::B8).expect("test"),
                Segment::new(&b, 2, 3, ElementWidth::B8).expect("test"),
            ],
            ElementWidth::B8,
        )
        .expect("test");
        assert_eq!(naive_concat(&table), vec![1, 2, 5, 6, 7, 3, 4, 8, 9, 10]);
    }

    #[test]
    fn test_naive_concat_skips_stride_padding() {
        let a = [1u8, 2, 0xee, 3, 4];
        let table = SegmentTable::new(
            vec![Segment::strided(&a, 2, 2, 3, ElementWidth::B8).expect("test")],
            ElementWidth::B8,
        )
        .expect("test");
        assert_eq!(naive_concat(&table), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_naive_concat_empty_strided_segment() {
        let a = [1u8, 2, 3, 4];
        let table = SegmentTable::new(
            vec![
                Segment::strided(&[], 2, 0, 3, ElementWidth::B8).expect("test"),
                Segment::new(&a, 2, 2, ElementWidth::B8).expect("test"),
            ],
            ElementWidth::B8,
        )
        .expect("test");
        assert_eq!(naive_concat(&table), vec![1, 2, 3, 4]);
        let (out, _) = crate::concat_to_vec(&table, &crate::EngineConfig::default()).expect("test");
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fixture_roundtrip_through_table() {
        let fixture = FixtureGenerator::new(7).generate(3, &[2, 0, 5], ElementWidth::B16);
        let table = fixture.table().expect("test");
        assert_eq!(table.total_axis_len(), 7);
        assert_eq!(naive_concat(&table).len(), 3 * 7 * 2);
    }
}
