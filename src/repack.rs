//! Repack strategies
//!
//! After stage-in, a tile's fragments sit compactly in the staging slot: each
//! fragment is `rows × cols` contiguous elements starting at a block-aligned
//! offset. Repack moves them into the packed tile, where fragment `f`
//! occupies columns `[f.dst_col, f.dst_col + cols)` of every row and rows are
//! `stride` elements apart.
//!
//! The move is done with one of four strategies, chosen per fragment from
//! its shape alone:
//!
//! | Strategy | When | Vector op |
//! |---|---|---|
//! | `BlockCopy` | fragment fills the tile, or is very wide | contiguous row copies |
//! | `Scatter` | a row spans 1-4 vectors | lane-contiguous stores, index `base + lane` |
//! | `PackedScatter` | a row is under half a vector | cached index packs several rows per store |
//! | `Gather` | uniform whole segments | cached index reads across staged segments |
//!
//! Index vectors depend only on `(cols, stride, segment_len, segment_stride)`
//! and are cached per worker in an [`IndexCache`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dtype::{ElementWidth, IndexWidth};
use crate::error::{ConcatError, Result};

// ============================================================================
// Strategy selection
// ============================================================================

/// Layout of the gather index for uniform segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatherShape {
    /// A whole output row fits one vector; each vector covers several rows
    MultiRow {
        /// Rows gathered per vector op
        rows_per_vector: usize,
    },
    /// Rows are longer than a vector; each vector covers whole segments
    PerRow {
        /// Segments gathered per vector op
        segments_per_vector: usize,
    },
}

/// How one fragment is moved from staged to packed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepackStrategy {
    /// Plain row copies (one copy when the fragment fills the tile)
    BlockCopy,
    /// Per-row vector stores, `unroll` vectors per row
    Scatter {
        /// Vector ops per row (1..=4)
        unroll: u8,
    },
    /// Several narrow rows per vector store via a cached index
    PackedScatter {
        /// Rows stored per vector op
        rows_per_vector: usize,
    },
    /// Uniform segments read through a cached index
    Gather(GatherShape),
}

/// Shape facts strategy selection depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentShape {
    /// Element width
    pub width: ElementWidth,
    /// Rows in the tile
    pub rows: usize,
    /// Fragment columns
    pub cols: usize,
    /// Packed tile row stride
    pub stride: usize,
    /// Shared segment length when the fragment is a group of whole uniform
    /// segments
    pub segment_len: Option<usize>,
}

/// Pick the strategy for a fragment
///
/// Pure: the same shape and vector width always give the same strategy.
#[must_use]
pub fn select_strategy(shape: &FragmentShape, vector_bytes: usize) -> RepackStrategy {
    let lanes = shape.width.lanes(vector_bytes).max(1);
    let cols = shape.cols;

    if let Some(segment_len) = shape.segment_len {
        if segment_len > 0 && segment_len < lanes && cols > 0 {
            return if cols <= lanes {
                RepackStrategy::Gather(GatherShape::MultiRow {
                    rows_per_vector: lanes / cols,
                })
            } else {
                RepackStrategy::Gather(GatherShape::PerRow {
                    segments_per_vector: lanes / segment_len,
                })
            };
        }
    }

    if cols == 0 || cols == shape.stride || cols > 4 * lanes {
        RepackStrategy::BlockCopy
    } else if cols > 3 * lanes {
        RepackStrategy::Scatter { unroll: 4 }
    } else if cols > 2 * lanes {
        RepackStrategy::Scatter { unroll: 3 }
    } else if cols > lanes {
        RepackStrategy::Scatter { unroll: 2 }
    } else if cols * 2 >= lanes || shape.rows == 1 {
        RepackStrategy::Scatter { unroll: 1 }
    } else {
        RepackStrategy::PackedScatter {
            rows_per_vector: lanes / cols,
        }
    }
}

// ============================================================================
// Index vectors
// ============================================================================

/// Destination-index vector for packed scatter
///
/// Lane `v` stores to `(v / cols) * stride + v % cols`, so one vector covers
/// `lanes / cols` consecutive rows of a `cols`-wide fragment.
#[must_use]
pub fn scatter_index(cols: usize, stride: usize, lanes: usize) -> Vec<u32> {
    if cols == 0 {
        return Vec::new();
    }
    let used = lanes / cols * cols;
    (0..used)
        .map(|v| ((v / cols) * stride + v % cols) as u32)
        .collect()
}

/// Source-index vector for uniform gather
///
/// Staged segments are `segment_stride` apart, each `rows × segment_len`
/// contiguous. Lane `v` of an output row group of width `cols` reads
/// row `v / cols`, column `v % cols`:
///
/// ```text
/// src(v) = (c / segment_len) * segment_stride + r * segment_len + c % segment_len
/// ```
#[must_use]
pub fn gather_index(
    cols: usize,
    segment_len: usize,
    segment_stride: usize,
    lanes: usize,
) -> Vec<u32> {
    if cols == 0 || segment_len == 0 {
        return Vec::new();
    }
    let rows_per_vector = (lanes / cols).max(1);
    let used = (rows_per_vector * cols).min(lanes.max(cols));
    (0..used)
        .map(|v| {
            let r = v / cols;
            let c = v % cols;
            ((c / segment_len) * segment_stride + r * segment_len + c % segment_len) as u32
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IndexKind {
    Scatter,
    Gather,
}

/// Cache key for a generated index vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IndexKey {
    kind: IndexKind,
    cols: usize,
    stride: usize,
    segment_len: usize,
    segment_stride: usize,
}

/// Per-worker cache of index vectors
#[derive(Debug)]
pub struct IndexCache {
    lanes: usize,
    index_width: IndexWidth,
    entries: HashMap<IndexKey, Vec<u32>>,
    generated: usize,
    hits: usize,
}

impl IndexCache {
    /// Empty cache for vectors of `lanes` indices of `index_width`
    #[must_use]
    pub fn new(lanes: usize, index_width: IndexWidth) -> Self {
        Self {
            lanes,
            index_width,
            entries: HashMap::new(),
            generated: 0,
            hits: 0,
        }
    }

    /// Index vectors generated so far
    #[must_use]
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Lookups served from the cache
    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits
    }

    fn get_or_generate(&mut self, key: IndexKey) -> Result<&[u32]> {
        if self.entries.contains_key(&key) {
            self.hits += 1;
        } else {
            let index = match key.kind {
                IndexKind::Scatter => scatter_index(key.cols, key.stride, self.lanes),
                IndexKind::Gather => {
                    gather_index(key.cols, key.segment_len, key.segment_stride, self.lanes)
                },
            };
            let max = index.iter().copied().max().unwrap_or(0) as usize;
            if max > self.index_width.max_index() {
                return Err(ConcatError::CapacityExceeded {
                    needed: max,
                    capacity: self.index_width.max_index(),
                });
            }
            self.generated += 1;
            self.entries.insert(key, index);
        }
        self.entries
            .get(&key)
            .map(Vec::as_slice)
            .ok_or_else(|| ConcatError::InvalidConfiguration("index cache lost an entry".into()))
    }
}

// ============================================================================
// Apply
// ============================================================================

/// Placement of one staged fragment in the packed tile, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentCopy {
    /// Offset of the fragment in the staging slot
    pub src_offset: usize,
    /// First packed column
    pub dst_col: usize,
    /// Rows
    pub rows: usize,
    /// Columns
    pub cols: usize,
    /// Packed row stride
    pub stride: usize,
    /// For uniform gathers: segment length and staged segment stride
    pub segments: Option<(usize, usize)>,
}

#[inline]
fn move_element(dst: &mut [u8], di: usize, src: &[u8], si: usize, w: usize) {
    dst[di * w..(di + 1) * w].copy_from_slice(&src[si * w..(si + 1) * w]);
}

#[inline]
fn move_run(dst: &mut [u8], di: usize, src: &[u8], si: usize, n: usize, w: usize) {
    dst[di * w..(di + n) * w].copy_from_slice(&src[si * w..(si + n) * w]);
}

/// Moves staged fragments into packed layout and tracks strategy use
#[derive(Debug)]
pub struct Repacker {
    width: ElementWidth,
    vector_bytes: usize,
    lanes: usize,
    cache: IndexCache,
    counts: StrategyCounts,
}

/// Fragments repacked per strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCounts {
    /// `BlockCopy` fragments
    pub block_copy: usize,
    /// `Scatter` fragments
    pub scatter: usize,
    /// `PackedScatter` fragments
    pub packed_scatter: usize,
    /// `Gather` groups
    pub gather: usize,
}

impl StrategyCounts {
    fn record(&mut self, strategy: RepackStrategy) {
        match strategy {
            RepackStrategy::BlockCopy => self.block_copy += 1,
            RepackStrategy::Scatter { .. } => self.scatter += 1,
            RepackStrategy::PackedScatter { .. } => self.packed_scatter += 1,
            RepackStrategy::Gather(_) => self.gather += 1,
        }
    }

    /// Total fragments
    #[must_use]
    pub fn total(&self) -> usize {
        self.block_copy + self.scatter + self.packed_scatter + self.gather
    }

    /// Accumulate another count
    pub fn merge(&mut self, other: &Self) {
        self.block_copy += other.block_copy;
        self.scatter += other.scatter;
        self.packed_scatter += other.packed_scatter;
        self.gather += other.gather;
    }
}

impl Repacker {
    /// Repacker for one worker
    #[must_use]
    pub fn new(width: ElementWidth, vector_bytes: usize) -> Self {
        let lanes = width.lanes(vector_bytes).max(1);
        Self {
            width,
            vector_bytes,
            lanes,
            cache: IndexCache::new(lanes, width.index_width()),
            counts: StrategyCounts::default(),
        }
    }

    /// Index cache
    #[must_use]
    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Strategy use so far
    #[must_use]
    pub fn counts(&self) -> StrategyCounts {
        self.counts
    }

    /// Strategy for a fragment placement
    #[must_use]
    pub fn strategy_for(&self, copy: &FragmentCopy) -> RepackStrategy {
        select_strategy(
            &FragmentShape {
                width: self.width,
                rows: copy.rows,
                cols: copy.cols,
                stride: copy.stride,
                segment_len: copy.segments.map(|(len, _)| len),
            },
            self.vector_bytes,
        )
    }

    /// Move one fragment from `staged` into `packed`
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the fragment reaches past either buffer
    /// or an index would not fit the index width
    pub fn repack(&mut self, copy: &FragmentCopy, staged: &[u8], packed: &mut [u8]) -> Result<RepackStrategy> {
        let strategy = self.strategy_for(copy);
        if copy.rows == 0 || copy.cols == 0 {
            return Ok(strategy);
        }
        self.check_bounds(copy, staged.len(), packed.len())?;
        let w = self.width.bytes();
        let lanes = self.lanes;

        match strategy {
            RepackStrategy::BlockCopy => {
                if copy.cols == copy.stride && copy.dst_col == 0 {
                    move_run(packed, 0, staged, copy.src_offset, copy.rows * copy.cols, w);
                } else {
                    for r in 0..copy.rows {
                        let di = r * copy.stride + copy.dst_col;
                        let si = copy.src_offset + r * copy.cols;
                        move_run(packed, di, staged, si, copy.cols, w);
                    }
                }
            },
            RepackStrategy::Scatter { .. } => {
                for r in 0..copy.rows {
                    let base_dst = r * copy.stride + copy.dst_col;
                    let base_src = copy.src_offset + r * copy.cols;
                    let mut lane0 = 0;
                    while lane0 < copy.cols {
                        let n = lanes.min(copy.cols - lane0);
                        move_run(packed, base_dst + lane0, staged, base_src + lane0, n, w);
                        lane0 += lanes;
                    }
                }
            },
            RepackStrategy::PackedScatter { rows_per_vector } => {
                let index = self.cache.get_or_generate(IndexKey {
                    kind: IndexKind::Scatter,
                    cols: copy.cols,
                    stride: copy.stride,
                    segment_len: 0,
                    segment_stride: 0,
                })?;
                let groups = copy.rows.div_ceil(rows_per_vector);
                for g in 0..groups {
                    let rows_in = rows_per_vector.min(copy.rows - g * rows_per_vector);
                    let src_base = copy.src_offset + g * rows_per_vector * copy.cols;
                    let dst_base = g * rows_per_vector * copy.stride + copy.dst_col;
                    for (v, &dst) in index.iter().take(rows_in * copy.cols).enumerate() {
                        move_element(packed, dst_base + dst as usize, staged, src_base + v, w);
                    }
                }
            },
            RepackStrategy::Gather(shape) => {
                let (segment_len, segment_stride) = copy.segments.ok_or_else(|| {
                    ConcatError::InvalidConfiguration("gather without uniform segments".into())
                })?;
                match shape {
                    GatherShape::MultiRow { rows_per_vector } => {
                        let index = self.cache.get_or_generate(IndexKey {
                            kind: IndexKind::Gather,
                            cols: copy.cols,
                            stride: 0,
                            segment_len,
                            segment_stride,
                        })?;
                        let groups = copy.rows.div_ceil(rows_per_vector);
                        for g in 0..groups {
                            let rows_in = rows_per_vector.min(copy.rows - g * rows_per_vector);
                            let src_base = copy.src_offset + g * rows_per_vector * segment_len;
                            let dst_row = g * rows_per_vector;
                            for (v, &src) in index.iter().take(rows_in * copy.cols).enumerate() {
                                let di = (dst_row + v / copy.cols) * copy.stride
                                    + copy.dst_col
                                    + v % copy.cols;
                                move_element(packed, di, staged, src_base + src as usize, w);
                            }
                        }
                    },
                    GatherShape::PerRow {
                        segments_per_vector,
                    } => {
                        let reg = segments_per_vector * segment_len;
                        let index = self.cache.get_or_generate(IndexKey {
                            kind: IndexKind::Gather,
                            cols: reg,
                            stride: 0,
                            segment_len,
                            segment_stride,
                        })?;
                        for r in 0..copy.rows {
                            let mut j = 0;
                            while j * reg < copy.cols {
                                let n = reg.min(copy.cols - j * reg);
                                let src_base = copy.src_offset
                                    + r * segment_len
                                    + j * segments_per_vector * segment_stride;
                                let dst_base = r * copy.stride + copy.dst_col + j * reg;
                                for (v, &src) in index.iter().take(n).enumerate() {
                                    move_element(
                                        packed,
                                        dst_base + v,
                                        staged,
                                        src_base + src as usize,
                                        w,
                                    );
                                }
                                j += 1;
                            }
                        }
                    },
                }
            },
        }

        self.counts.record(strategy);
        Ok(strategy)
    }

    fn check_bounds(&self, copy: &FragmentCopy, staged: usize, packed: usize) -> Result<()> {
        let w = self.width.bytes();
        let src_end = match copy.segments {
            Some((segment_len, segment_stride)) if segment_len > 0 => {
                let segments = copy.cols.div_ceil(segment_len);
                copy.src_offset + (segments - 1) * segment_stride + copy.rows * segment_len
            },
            _ => copy.src_offset + copy.rows * copy.cols,
        };
        let dst_end = (copy.rows - 1) * copy.stride + copy.dst_col + copy.cols;
        if copy.dst_col + copy.cols > copy.stride {
            return Err(ConcatError::CapacityExceeded {
                needed: copy.dst_col + copy.cols,
                capacity: copy.stride,
            });
        }
        if src_end * w > staged {
            return Err(ConcatError::CapacityExceeded {
                needed: src_end * w,
                capacity: staged,
            });
        }
        if dst_end * w > packed {
            return Err(ConcatError::CapacityExceeded {
                needed: dst_end * w,
                capacity: packed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(width: ElementWidth, rows: usize, cols: usize, stride: usize) -> FragmentShape {
        FragmentShape {
            width,
            rows,
            cols,
            stride,
            segment_len: None,
        }
    }

    fn to_bytes(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Reference placement: row r of the fragment lands at r*stride + dst_col
    fn expected_packed(staged: &[u32], copy: &FragmentCopy, len: usize) -> Vec<u32> {
        let mut out = vec![0u32; len];
        for r in 0..copy.rows {
            for c in 0..copy.cols {
                let src = match copy.segments {
                    Some((seg, seg_stride)) => (c / seg) * seg_stride + r * seg + c % seg,
                    None => r * copy.cols + c,
                };
                out[r * copy.stride + copy.dst_col + c] = staged[copy.src_offset + src];
            }
        }
        out
    }

    fn run(width_lanes_vector: usize, copy: FragmentCopy) -> (RepackStrategy, Vec<u32>, Vec<u32>) {
        let staged: Vec<u32> = (0..1024).map(|i| i + 1).collect();
        let len = copy.rows * copy.stride;
        let mut packed = vec![0u8; len * 4];
        let mut repacker = Repacker::new(ElementWidth::B32, width_lanes_vector);
        let strategy = repacker
            .repack(&copy, &to_bytes(&staged), &mut packed)
            .expect("test");
        (strategy, from_bytes(&packed), expected_packed(&staged, &copy, len))
    }

    // ============================================================================
    // Selection
    // ============================================================================

    #[test]
    fn test_select_block_copy_when_filling_tile() {
        // B32, 256-byte vectors: 64 lanes
        let s = select_strategy(&shape(ElementWidth::B32, 4, 10, 10), 256);
        assert_eq!(s, RepackStrategy::BlockCopy);
    }

    #[test]
    fn test_select_thresholds_b32() {
        let at = |cols| select_strategy(&shape(ElementWidth::B32, 4, cols, 1024), 256);
        assert_eq!(at(257), RepackStrategy::BlockCopy);
        assert_eq!(at(256), RepackStrategy::Scatter { unroll: 4 });
        assert_eq!(at(193), RepackStrategy::Scatter { unroll: 4 });
        assert_eq!(at(192), RepackStrategy::Scatter { unroll: 3 });
        assert_eq!(at(128), RepackStrategy::Scatter { unroll: 2 });
        assert_eq!(at(64), RepackStrategy::Scatter { unroll: 1 });
        assert_eq!(at(32), RepackStrategy::Scatter { unroll: 1 });
        assert_eq!(
            at(31),
            RepackStrategy::PackedScatter { rows_per_vector: 2 }
        );
        assert_eq!(
            at(5),
            RepackStrategy::PackedScatter {
                rows_per_vector: 12
            }
        );
    }

    #[test]
    fn test_select_uses_index_width_lanes() {
        // B16 uses u16 indices: 128 lanes
        let s = select_strategy(&shape(ElementWidth::B16, 4, 100, 1024), 256);
        assert_eq!(s, RepackStrategy::Scatter { unroll: 1 });
        let s = select_strategy(&shape(ElementWidth::B16, 4, 129, 1024), 256);
        assert_eq!(s, RepackStrategy::Scatter { unroll: 2 });
    }

    #[test]
    fn test_select_single_row_never_packs() {
        let s = select_strategy(&shape(ElementWidth::B32, 1, 3, 64), 256);
        assert_eq!(s, RepackStrategy::Scatter { unroll: 1 });
    }

    #[test]
    fn test_select_uniform_gather() {
        let mut s = shape(ElementWidth::B32, 8, 12, 12);
        s.segment_len = Some(3);
        assert_eq!(
            select_strategy(&s, 256),
            RepackStrategy::Gather(GatherShape::MultiRow { rows_per_vector: 5 })
        );
        s.cols = 300;
        s.stride = 300;
        assert_eq!(
            select_strategy(&s, 256),
            RepackStrategy::Gather(GatherShape::PerRow {
                segments_per_vector: 21
            })
        );
    }

    #[test]
    fn test_select_is_pure() {
        let s = shape(ElementWidth::B8, 7, 9, 40);
        assert_eq!(select_strategy(&s, 256), select_strategy(&s, 256));
    }

    // ============================================================================
    // Index vectors
    // ============================================================================

    #[test]
    fn test_scatter_index() {
        // 8 lanes, 3-wide fragment in a 10-wide tile: 2 rows per vector
        assert_eq!(scatter_index(3, 10, 8), vec![0, 1, 2, 10, 11, 12]);
        assert!(scatter_index(0, 10, 8).is_empty());
    }

    #[test]
    fn test_gather_index_multi_row() {
        // Two segments of 2, staged 8 apart; rows of 4; 8 lanes -> 2 rows
        assert_eq!(gather_index(4, 2, 8, 8), vec![0, 1, 8, 9, 2, 3, 10, 11]);
    }

    #[test]
    fn test_gather_index_per_row() {
        // Row wider than the vector: single row of 3 segments
        assert_eq!(gather_index(6, 2, 16, 4), vec![0, 1, 16, 17, 32, 33]);
    }

    #[test]
    fn test_cache_reuses_by_width() {
        let mut cache = IndexCache::new(8, IndexWidth::U32);
        let key = IndexKey {
            kind: IndexKind::Scatter,
            cols: 3,
            stride: 10,
            segment_len: 0,
            segment_stride: 0,
        };
        cache.get_or_generate(key).expect("test");
        cache.get_or_generate(key).expect("test");
        assert_eq!(cache.generated(), 1);
        assert_eq!(cache.hits(), 1);
        cache
            .get_or_generate(IndexKey { cols: 2, ..key })
            .expect("test");
        assert_eq!(cache.generated(), 2);
    }

    #[test]
    fn test_cache_rejects_index_overflow() {
        let mut cache = IndexCache::new(128, IndexWidth::U16);
        let key = IndexKey {
            kind: IndexKind::Scatter,
            cols: 2,
            stride: 70_000,
            segment_len: 0,
            segment_stride: 0,
        };
        assert!(matches!(
            cache.get_or_generate(key),
            Err(ConcatError::CapacityExceeded { .. })
        ));
    }

    // ============================================================================
    // Apply
    // ============================================================================

    fn copy(src_offset: usize, dst_col: usize, rows: usize, cols: usize, stride: usize) -> FragmentCopy {
        FragmentCopy {
            src_offset,
            dst_col,
            rows,
            cols,
            stride,
            segments: None,
        }
    }

    #[test]
    fn test_apply_block_copy_full_tile() {
        let (s, got, want) = run(256, copy(8, 0, 3, 5, 5));
        assert_eq!(s, RepackStrategy::BlockCopy);
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_block_copy_wide() {
        // 32-byte vectors: 8 lanes, 40 cols > 4*8
        let (s, got, want) = run(32, copy(0, 3, 2, 40, 50));
        assert_eq!(s, RepackStrategy::BlockCopy);
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_scatter_unrolled() {
        let (s, got, want) = run(32, copy(16, 2, 3, 19, 24));
        assert_eq!(s, RepackStrategy::Scatter { unroll: 3 });
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_packed_scatter_with_tail_group() {
        // 64 lanes, 5 cols -> 12 rows per vector; 13 rows leaves a 1-row tail
        let (s, got, want) = run(256, copy(24, 4, 13, 5, 16));
        assert_eq!(
            s,
            RepackStrategy::PackedScatter {
                rows_per_vector: 12
            }
        );
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_gather_multi_row() {
        let mut c = copy(0, 0, 5, 6, 6);
        c.segments = Some((3, 16));
        let (s, got, want) = run(256, c);
        assert!(matches!(s, RepackStrategy::Gather(GatherShape::MultiRow { .. })));
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_gather_per_row() {
        // 8 lanes, segments of 3 -> 2 segments per vector; 5 segments per row
        let mut c = copy(8, 0, 3, 15, 15);
        c.segments = Some((3, 16));
        let (s, got, want) = run(32, c);
        assert_eq!(
            s,
            RepackStrategy::Gather(GatherShape::PerRow {
                segments_per_vector: 2
            })
        );
        assert_eq!(got, want);
    }

    #[test]
    fn test_apply_rejects_overflowing_fragment() {
        let staged = vec![0u8; 16];
        let mut packed = vec![0u8; 16];
        let mut repacker = Repacker::new(ElementWidth::B32, 256);
        let err = repacker
            .repack(&copy(0, 0, 2, 4, 4), &staged, &mut packed)
            .expect_err("test");
        assert!(matches!(err, ConcatError::CapacityExceeded { .. }));
    }

    #[test]
    fn test_apply_empty_fragment_is_noop() {
        let mut packed = vec![7u8; 8];
        let mut repacker = Repacker::new(ElementWidth::B32, 256);
        repacker
            .repack(&copy(0, 0, 2, 0, 2), &[], &mut packed)
            .expect("test");
        assert_eq!(packed, vec![7u8; 8]);
        assert_eq!(repacker.counts().total(), 0);
    }

    #[test]
    fn test_counts_merge() {
        let mut a = StrategyCounts {
            block_copy: 1,
            scatter: 2,
            packed_scatter: 3,
            gather: 4,
        };
        a.merge(&a.clone());
        assert_eq!(a.total(), 20);
    }
}
