//! Boundary Resolver (segment cursor)
//!
//! A worker walks its share of the concat axis tile by tile. For each tile it
//! asks the cursor for the next `length` output columns, and the cursor
//! answers with a [`SplitInfo`]: which segment the span starts in and at what
//! offset, and which segment it ends in and at what offset.
//!
//! The cursor only ever moves forward. Each call resumes from the previous
//! end position, so across a whole worker the scan visits every segment in
//! its range at most once, regardless of how many tiles are requested.
//!
//! ## Contents
//!
//! - [`Position`] - a `(segment, offset)` point on the concat axis
//! - [`SplitInfo`] - half-open span between two positions
//! - [`SegmentCursor`] - the resolver state carried across tiles
//! - [`Fragment`] - one segment's piece of a resolved span

use serde::{Deserialize, Serialize};

use crate::error::{ConcatError, Result};
use crate::segment::SegmentLengths;

/// A point on the concat axis: `offset` elements into `segment`
///
/// `offset == axis_len(segment)` is allowed and means "end of segment".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Segment index
    pub segment: usize,
    /// Element offset within the segment
    pub offset: usize,
}

impl Position {
    /// Create a position
    #[must_use]
    pub const fn new(segment: usize, offset: usize) -> Self {
        Self { segment, offset }
    }

    /// Position of an absolute column, biased to the end of a segment
    ///
    /// A column that falls exactly on a boundary resolves to the end of the
    /// earlier segment, so the result is usable as an upper bound.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `column` is past the total axis length, or
    /// propagates a lookup failure
    pub fn at_column<L: SegmentLengths + ?Sized>(lengths: &L, column: usize) -> Result<Self> {
        let count = lengths.segment_count();
        let mut prefix = 0usize;
        for segment in 0..count {
            let len = lengths.axis_len(segment)?;
            if column <= prefix + len {
                return Ok(Self::new(segment, column - prefix));
            }
            prefix += len;
        }
        Err(ConcatError::shape(format!(
            "column {column} past total axis length {prefix}"
        )))
    }
}

/// Span `[start, end)` of the concat axis, possibly crossing whole segments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitInfo {
    /// Segment the span starts in
    pub start_segment: usize,
    /// Offset within `start_segment`
    pub start_offset: usize,
    /// Segment the span ends in (inclusive)
    pub end_segment: usize,
    /// Offset within `end_segment` (exclusive)
    pub end_offset: usize,
}

impl SplitInfo {
    /// Empty span located at `position`
    #[must_use]
    pub const fn at(position: Position) -> Self {
        Self {
            start_segment: position.segment,
            start_offset: position.offset,
            end_segment: position.segment,
            end_offset: position.offset,
        }
    }

    /// Start position
    #[must_use]
    pub const fn start(&self) -> Position {
        Position::new(self.start_segment, self.start_offset)
    }

    /// End position
    #[must_use]
    pub const fn end(&self) -> Position {
        Position::new(self.end_segment, self.end_offset)
    }

    /// Whether the span covers nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start() == self.end()
    }

    /// Per-segment pieces of the span, skipping empty ones
    ///
    /// # Errors
    ///
    /// Propagates segment lookup failures
    pub fn fragments<L: SegmentLengths + ?Sized>(&self, lengths: &L) -> Result<Vec<Fragment>> {
        let mut out = Vec::with_capacity(self.end_segment + 1 - self.start_segment.min(self.end_segment));
        let mut at_column = 0;
        for segment in self.start_segment..=self.end_segment {
            let from = if segment == self.start_segment {
                self.start_offset
            } else {
                0
            };
            let to = if segment == self.end_segment {
                self.end_offset
            } else {
                lengths.axis_len(segment)?
            };
            if to > from {
                out.push(Fragment {
                    segment,
                    offset: from,
                    cols: to - from,
                    tile_col: at_column,
                });
                at_column += to - from;
            }
        }
        Ok(out)
    }
}

/// One segment's contribution to a resolved span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fragment {
    /// Source segment
    pub segment: usize,
    /// First column within the segment
    pub offset: usize,
    /// Column count
    pub cols: usize,
    /// First column within the tile the span fills
    pub tile_col: usize,
}

/// Result of one resolver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved span
    pub split: SplitInfo,
    /// Columns the span actually covers
    pub columns: usize,
    /// Request hit the cursor's upper bound before it was satisfied
    pub truncated: bool,
}

/// Forward-only resolver state for one worker
///
/// Plain value type; a worker owns exactly one per column band and passes it
/// by `&mut` through its tile loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCursor {
    split: SplitInfo,
    upper: Position,
    steps: usize,
}

impl SegmentCursor {
    /// Cursor over `[start, upper]`
    ///
    /// # Errors
    ///
    /// Returns `PlanMismatch` if `start` is past `upper`
    pub fn new(start: Position, upper: Position) -> Result<Self> {
        if start > upper {
            return Err(ConcatError::mismatch(format!(
                "cursor start {start:?} past upper bound {upper:?}"
            )));
        }
        Ok(Self {
            split: SplitInfo::at(start),
            upper,
            steps: 0,
        })
    }

    /// Cursor over the whole table, seeded at `(0, 0)`
    ///
    /// # Errors
    ///
    /// Returns `SegmentOutOfRange` for an empty table
    pub fn from_origin<L: SegmentLengths + ?Sized>(lengths: &L) -> Result<Self> {
        let count = lengths.segment_count();
        let last = count.checked_sub(1).ok_or(ConcatError::SegmentOutOfRange {
            index: 0,
            count: 0,
        })?;
        Self::new(Position::default(), Position::new(last, lengths.axis_len(last)?))
    }

    /// Last resolved span
    #[must_use]
    pub fn split(&self) -> SplitInfo {
        self.split
    }

    /// Position the next call resumes from
    #[must_use]
    pub fn position(&self) -> Position {
        self.split.end()
    }

    /// Upper bound of this cursor's range
    #[must_use]
    pub fn upper(&self) -> Position {
        self.upper
    }

    /// Segment-advance steps performed so far
    #[must_use]
    pub fn advance_steps(&self) -> usize {
        self.steps
    }

    /// Whether the cursor has reached its upper bound
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.position() >= self.upper
    }

    /// Axis length of `segment` clipped to the upper bound
    fn limit<L: SegmentLengths + ?Sized>(&self, lengths: &L, segment: usize) -> Result<usize> {
        let len = lengths.axis_len(segment)?;
        if segment != self.upper.segment {
            return Ok(len);
        }
        if self.upper.offset > len {
            return Err(ConcatError::mismatch(format!(
                "upper bound offset {} past end {len} of segment {segment}",
                self.upper.offset
            )));
        }
        Ok(self.upper.offset)
    }

    /// Resolve the next `length` columns
    ///
    /// Empty segments are skipped. A request running past the upper bound
    /// is clamped there and reported as truncated; once the cursor is
    /// exhausted every further call returns an empty, truncated span.
    ///
    /// # Errors
    ///
    /// Returns `PlanMismatch` if the cursor sits past the end of its segment
    /// (a bad seed), or propagates segment lookup failures
    pub fn resolve<L: SegmentLengths + ?Sized>(
        &mut self,
        lengths: &L,
        length: usize,
    ) -> Result<Resolution> {
        let mut segment = self.split.end_segment;
        let mut offset = self.split.end_offset;

        // Roll over finished (and empty) segments
        while segment < self.upper.segment && offset == lengths.axis_len(segment)? {
            segment += 1;
            offset = 0;
            self.steps += 1;
        }

        let limit = self.limit(lengths, segment)?;
        if offset > limit {
            return Err(ConcatError::mismatch(format!(
                "cursor offset {offset} past end {limit} of segment {segment}"
            )));
        }

        self.split.start_segment = segment;
        self.split.start_offset = offset;

        let available = limit - offset;
        if available >= length || segment == self.upper.segment {
            let take = available.min(length);
            self.split.end_segment = segment;
            self.split.end_offset = offset + take;
            return Ok(Resolution {
                split: self.split,
                columns: take,
                truncated: take < length,
            });
        }

        let mut covered = available;
        let mut current = segment;
        while current < self.upper.segment {
            current += 1;
            self.steps += 1;
            let len = self.limit(lengths, current)?;
            covered += len;
            if covered >= length {
                self.split.end_segment = current;
                self.split.end_offset = len - (covered - length);
                return Ok(Resolution {
                    split: self.split,
                    columns: length,
                    truncated: false,
                });
            }
        }

        self.split.end_segment = self.upper.segment;
        self.split.end_offset = self.upper.offset;
        Ok(Resolution {
            split: self.split,
            columns: covered,
            truncated: true,
        })
    }
}
