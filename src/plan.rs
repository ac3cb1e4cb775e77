//! Tiling Plan and Tile Planner
//!
//! The [`TilingPlan`] is the flat parameter block a host hands to the engine:
//! tile factors, tail factors, how workers are partitioned, and where each
//! column band ends on the concat axis. It is computed once, validated
//! against the real inputs, and then read by every worker.
//!
//! The [`TilePlanner`] turns `(plan, worker_id)` into that worker's output
//! sub-rectangle, its tile ranges, and the seed of its boundary cursor.
//!
//! ## Partitioning
//!
//! ```text
//! Rows    : worker w owns row tiles [w*k, w*k + k) and every column tile
//! Columns : worker w = row_band * col_bands + col_band
//!           row band  -> one row tile
//!           col band  -> column tiles [b*k, b*k + k)
//! ```
//!
//! The last worker (or band) takes the tail count instead of `k`, and the
//! last row/column tile takes the tail factor.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::cursor::Position;
use crate::dtype::ElementWidth;
use crate::error::{ConcatError, Result};
use crate::segment::{SegmentLengths, SegmentTable};

/// Which output dimension is divided among workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionAxis {
    /// Contiguous runs of row tiles per worker
    Rows,
    /// Row bands times column bands
    Columns,
}

/// How segments are packed into staging tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentLayout {
    /// Variable lengths; tiles are cut by the boundary resolver
    Ragged,
    /// Every segment has the same length; tiles hold whole segments
    Uniform {
        /// Shared axis length
        segment_len: usize,
    },
}

/// Host-computed tiling parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingPlan {
    /// Width the segments are processed at
    pub element_width: ElementWidth,
    /// Output rows
    pub rows: usize,
    /// Output columns (sum of axis lengths)
    pub total_axis_len: usize,
    /// Number of segments
    pub segment_count: usize,
    /// Workers that own output; extra launched workers no-op
    pub worker_count: usize,
    /// Partition axis
    pub partition: PartitionAxis,
    /// Row bands
    pub row_bands: usize,
    /// Column bands per row band
    pub col_bands: usize,
    /// Rows per row tile
    pub tile_rows: usize,
    /// Rows in the last row tile
    pub tail_tile_rows: usize,
    /// Columns per column tile
    pub tile_cols: usize,
    /// Columns in the last column tile
    pub tail_tile_cols: usize,
    /// Row tiles over the whole output
    pub row_tiles: usize,
    /// Column tiles over the whole output
    pub col_tiles: usize,
    /// Tiles along the partitioned axis per worker (or band)
    pub tiles_per_worker: usize,
    /// Tiles along the partitioned axis for the last worker (or band)
    pub tail_tiles_per_worker: usize,
    /// Elements in one staging slot half
    pub slot_elements: usize,
    /// Segment packing layout
    pub layout: SegmentLayout,
    /// Where each column band ends on the concat axis
    pub band_ends: Vec<Position>,
}

impl TilingPlan {
    /// Plan for an output with no elements: no worker does anything
    #[must_use]
    pub fn empty(
        element_width: ElementWidth,
        rows: usize,
        total_axis_len: usize,
        segment_count: usize,
    ) -> Self {
        Self {
            element_width,
            rows,
            total_axis_len,
            segment_count,
            worker_count: 0,
            partition: PartitionAxis::Rows,
            row_bands: 0,
            col_bands: 0,
            tile_rows: 0,
            tail_tile_rows: 0,
            tile_cols: 0,
            tail_tile_cols: 0,
            row_tiles: 0,
            col_tiles: 0,
            tiles_per_worker: 0,
            tail_tiles_per_worker: 0,
            slot_elements: 0,
            layout: SegmentLayout::Ragged,
            band_ends: Vec::new(),
        }
    }

    /// Whether no worker owns output
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.worker_count == 0
    }

    /// Parse a plan from JSON (not validated; see [`TilingPlan::validate`])
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` on malformed JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns `ConfigParse` if serialization fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// First output column of column tile `tile`
    #[must_use]
    pub fn col_tile_offset(&self, tile: usize) -> usize {
        tile * self.tile_cols
    }

    /// Check the plan against the inputs it will run on
    ///
    /// # Errors
    ///
    /// Returns `PlanMismatch` if any factor fails to reconstruct the input
    /// geometry, or `CapacityExceeded` if a tile would not fit the device
    pub fn validate(&self, table: &SegmentTable<'_>, config: &EngineConfig) -> Result<()> {
        self.validate_geometry(table)?;
        if table.is_degenerate() {
            if self.worker_count != 0 {
                return Err(ConcatError::mismatch(format!(
                    "empty output but {} workers planned",
                    self.worker_count
                )));
            }
            return Ok(());
        }
        if self.worker_count == 0 {
            return Err(ConcatError::mismatch("non-empty output with no workers"));
        }
        self.validate_tiles()?;
        self.validate_partition()?;
        self.validate_bands(table)?;
        self.validate_capacity(config)?;
        if let SegmentLayout::Uniform { segment_len } = self.layout {
            let lengths = table.lengths();
            if segment_len == 0 || lengths.iter().any(|&len| len != segment_len) {
                return Err(ConcatError::mismatch(format!(
                    "uniform layout of length {segment_len} but segment lengths are {lengths:?}"
                )));
            }
        }
        Ok(())
    }

    fn validate_geometry(&self, table: &SegmentTable<'_>) -> Result<()> {
        if self.element_width != table.width() {
            return Err(ConcatError::mismatch(format!(
                "plan width {:?} but inputs are {:?}",
                self.element_width,
                table.width()
            )));
        }
        if self.rows != table.rows() {
            return Err(ConcatError::mismatch(format!(
                "plan has {} rows, inputs have {}",
                self.rows,
                table.rows()
            )));
        }
        if self.segment_count != table.len() {
            return Err(ConcatError::mismatch(format!(
                "plan has {} segments, inputs have {}",
                self.segment_count,
                table.len()
            )));
        }
        if self.total_axis_len != table.total_axis_len() {
            return Err(ConcatError::mismatch(format!(
                "plan total axis length {} but segment lengths sum to {}",
                self.total_axis_len,
                table.total_axis_len()
            )));
        }
        Ok(())
    }

    fn validate_tiles(&self) -> Result<()> {
        let factor_ok = |full: usize, tail: usize| full > 0 && tail > 0 && tail <= full;
        if !factor_ok(self.tile_rows, self.tail_tile_rows)
            || !factor_ok(self.tile_cols, self.tail_tile_cols)
            || !factor_ok(self.tiles_per_worker, self.tail_tiles_per_worker)
        {
            return Err(ConcatError::mismatch(
                "tile factors must be positive with tails no larger than the full factor",
            ));
        }
        if self.tile_rows > self.rows || self.tile_cols > self.total_axis_len {
            return Err(ConcatError::mismatch(format!(
                "{}x{} tiles exceed the {}x{} output",
                self.tile_rows, self.tile_cols, self.rows, self.total_axis_len
            )));
        }
        let rows = reconstruct(self.row_tiles, self.tile_rows, self.tail_tile_rows);
        if rows != Some(self.rows) {
            return Err(ConcatError::mismatch(format!(
                "{} row tiles of {} (tail {}) do not cover {} rows",
                self.row_tiles, self.tile_rows, self.tail_tile_rows, self.rows
            )));
        }
        let cols = reconstruct(self.col_tiles, self.tile_cols, self.tail_tile_cols);
        if cols != Some(self.total_axis_len) {
            return Err(ConcatError::mismatch(format!(
                "{} column tiles of {} (tail {}) do not cover {} columns",
                self.col_tiles, self.tile_cols, self.tail_tile_cols, self.total_axis_len
            )));
        }
        Ok(())
    }

    fn validate_partition(&self) -> Result<()> {
        let (bands, tiles) = match self.partition {
            PartitionAxis::Rows => {
                if self.col_bands != 1 || self.row_bands != self.worker_count {
                    return Err(ConcatError::mismatch(format!(
                        "row partition needs 1 column band and one row band per worker, got {}x{}",
                        self.row_bands, self.col_bands
                    )));
                }
                (self.worker_count, self.row_tiles)
            },
            PartitionAxis::Columns => {
                if self.row_bands != self.row_tiles
                    || self.row_bands.checked_mul(self.col_bands) != Some(self.worker_count)
                {
                    return Err(ConcatError::mismatch(format!(
                        "column partition of {}x{} bands does not match {} row tiles and {} workers",
                        self.row_bands, self.col_bands, self.row_tiles, self.worker_count
                    )));
                }
                (self.col_bands, self.col_tiles)
            },
        };
        if reconstruct(bands, self.tiles_per_worker, self.tail_tiles_per_worker) != Some(tiles) {
            return Err(ConcatError::mismatch(format!(
                "{bands} bands of {} tiles (tail {}) do not cover {tiles} tiles",
                self.tiles_per_worker, self.tail_tiles_per_worker
            )));
        }
        Ok(())
    }

    fn validate_bands(&self, table: &SegmentTable<'_>) -> Result<()> {
        if self.band_ends.len() != self.col_bands {
            return Err(ConcatError::mismatch(format!(
                "{} band ends for {} column bands",
                self.band_ends.len(),
                self.col_bands
            )));
        }
        let planner = TilePlanner::new(self);
        for (band, end) in self.band_ends.iter().enumerate() {
            let expected = planner.band_columns(band).end;
            let actual = column_of(table, *end)?;
            if actual != expected {
                return Err(ConcatError::mismatch(format!(
                    "column band {band} ends at {end:?} (column {actual}), expected column {expected}"
                )));
            }
        }
        Ok(())
    }

    fn validate_capacity(&self, config: &EngineConfig) -> Result<()> {
        let slot_capacity = config.device.slot_bytes() / self.element_width.bytes();
        if self.slot_elements > slot_capacity {
            return Err(ConcatError::CapacityExceeded {
                needed: self.slot_elements,
                capacity: slot_capacity,
            });
        }
        let tile = self
            .tile_rows
            .checked_mul(self.tile_cols)
            .ok_or_else(|| ConcatError::mismatch("tile size overflows"))?;
        if tile > self.slot_elements {
            return Err(ConcatError::CapacityExceeded {
                needed: tile,
                capacity: self.slot_elements,
            });
        }
        Ok(())
    }
}

/// `(count - 1) * full + tail`, or `None` if `count == 0` or it overflows
fn reconstruct(count: usize, full: usize, tail: usize) -> Option<usize> {
    count
        .checked_sub(1)?
        .checked_mul(full)?
        .checked_add(tail)
}

/// Absolute column of a position
///
/// # Errors
///
/// Returns `SegmentOutOfRange` or `PlanMismatch` if the position is outside
/// the table
pub fn column_of<L: SegmentLengths + ?Sized>(lengths: &L, position: Position) -> Result<usize> {
    let mut prefix = 0;
    for segment in 0..position.segment {
        prefix += lengths.axis_len(segment)?;
    }
    let len = lengths.axis_len(position.segment)?;
    if position.offset > len {
        return Err(ConcatError::mismatch(format!(
            "offset {} past end {len} of segment {}",
            position.offset, position.segment
        )));
    }
    Ok(prefix + position.offset)
}

/// Output sub-rectangle, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// First row
    pub row_offset: usize,
    /// Row count
    pub rows: usize,
    /// First column
    pub col_offset: usize,
    /// Column count
    pub cols: usize,
}

impl Region {
    /// Element count
    #[must_use]
    pub fn area(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether two regions share any element
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let rows = self.row_offset < other.row_offset + other.rows
            && other.row_offset < self.row_offset + self.rows;
        let cols = self.col_offset < other.col_offset + other.cols
            && other.col_offset < self.col_offset + self.cols;
        rows && cols && self.area() > 0 && other.area() > 0
    }

    /// Whether `(row, col)` lies inside
    #[must_use]
    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.row_offset..self.row_offset + self.rows).contains(&row)
            && (self.col_offset..self.col_offset + self.cols).contains(&col)
    }
}

/// Whole-segment packing for the uniform layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformPacking {
    /// Segments per staging tile
    pub per_tile: usize,
    /// Segments in the last tile
    pub tail: usize,
    /// Tiles needed for the band
    pub tiles: usize,
    /// Elements between staged segments (block aligned)
    pub segment_stride: usize,
}

/// One worker's share of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTiling {
    /// Worker index
    pub worker_id: usize,
    /// Row band
    pub row_band: usize,
    /// Column band
    pub col_band: usize,
    /// Output sub-rectangle owned by this worker
    pub region: Region,
    /// Row tiles this worker processes
    pub row_tiles: Range<usize>,
    /// Column tiles this worker processes
    pub col_tiles: Range<usize>,
    /// Cursor seed
    pub cursor_start: Position,
    /// Cursor upper bound
    pub cursor_end: Position,
}

/// Per-worker view over a [`TilingPlan`]
#[derive(Debug, Clone, Copy)]
pub struct TilePlanner<'p> {
    plan: &'p TilingPlan,
}

impl<'p> TilePlanner<'p> {
    /// Wrap a plan
    #[must_use]
    pub fn new(plan: &'p TilingPlan) -> Self {
        Self { plan }
    }

    /// Underlying plan
    #[must_use]
    pub fn plan(&self) -> &'p TilingPlan {
        self.plan
    }

    /// `(row_band, col_band)` of a worker, or `None` if it owns nothing
    #[must_use]
    pub fn bands(&self, worker_id: usize) -> Option<(usize, usize)> {
        if worker_id >= self.plan.worker_count || self.plan.col_bands == 0 {
            return None;
        }
        Some((worker_id / self.plan.col_bands, worker_id % self.plan.col_bands))
    }

    /// Tiles owned by band `band` along the partitioned axis
    fn band_tiles(&self, band: usize, bands: usize) -> Range<usize> {
        let start = band * self.plan.tiles_per_worker;
        let count = if band + 1 == bands {
            self.plan.tail_tiles_per_worker
        } else {
            self.plan.tiles_per_worker
        };
        start..start + count
    }

    /// `(first_row, rows)` of row tile `tile`
    #[must_use]
    pub fn row_tile(&self, tile: usize) -> (usize, usize) {
        let rows = if tile + 1 == self.plan.row_tiles {
            self.plan.tail_tile_rows
        } else {
            self.plan.tile_rows
        };
        (tile * self.plan.tile_rows, rows)
    }

    /// `(first_col, cols)` of column tile `tile`
    #[must_use]
    pub fn col_tile(&self, tile: usize) -> (usize, usize) {
        let cols = if tile + 1 == self.plan.col_tiles {
            self.plan.tail_tile_cols
        } else {
            self.plan.tile_cols
        };
        (self.plan.col_tile_offset(tile), cols)
    }

    /// Column tiles of column band `band`
    #[must_use]
    pub fn band_col_tiles(&self, band: usize) -> Range<usize> {
        match self.plan.partition {
            PartitionAxis::Rows => 0..self.plan.col_tiles,
            PartitionAxis::Columns => self.band_tiles(band, self.plan.col_bands),
        }
    }

    /// Output columns of column band `band`
    #[must_use]
    pub fn band_columns(&self, band: usize) -> Range<usize> {
        let tiles = self.band_col_tiles(band);
        if tiles.is_empty() {
            return 0..0;
        }
        let (start, _) = self.col_tile(tiles.start);
        let (last, cols) = self.col_tile(tiles.end - 1);
        start..last + cols
    }

    /// Where column band `band` starts on the concat axis
    #[must_use]
    pub fn band_start(&self, band: usize) -> Position {
        band.checked_sub(1)
            .and_then(|prev| self.plan.band_ends.get(prev))
            .copied()
            .unwrap_or_default()
    }

    /// Assignment for `worker_id`, or `None` for an over-provisioned worker
    ///
    /// # Errors
    ///
    /// Returns `PlanMismatch` if the plan has no band end for the worker
    pub fn assign(&self, worker_id: usize) -> Result<Option<WorkerTiling>> {
        let Some((row_band, col_band)) = self.bands(worker_id) else {
            return Ok(None);
        };
        let row_tiles = match self.plan.partition {
            PartitionAxis::Rows => self.band_tiles(row_band, self.plan.row_bands),
            PartitionAxis::Columns => row_band..row_band + 1,
        };
        let col_tiles = self.band_col_tiles(col_band);

        let (row_offset, _) = self.row_tile(row_tiles.start);
        let (last_row, last_rows) = self.row_tile(row_tiles.end.saturating_sub(1));
        let columns = self.band_columns(col_band);
        let cursor_end = *self.plan.band_ends.get(col_band).ok_or_else(|| {
            ConcatError::mismatch(format!("no band end for column band {col_band}"))
        })?;

        Ok(Some(WorkerTiling {
            worker_id,
            row_band,
            col_band,
            region: Region {
                row_offset,
                rows: last_row + last_rows - row_offset,
                col_offset: columns.start,
                cols: columns.end - columns.start,
            },
            row_tiles,
            col_tiles,
            cursor_start: self.band_start(col_band),
            cursor_end,
        }))
    }

    /// Assignments of every worker that owns output
    ///
    /// # Errors
    ///
    /// Propagates [`TilePlanner::assign`] failures
    pub fn assignments(&self) -> Result<Vec<WorkerTiling>> {
        (0..self.plan.worker_count)
            .filter_map(|w| self.assign(w).transpose())
            .collect()
    }

    /// Whole-segment packing for a band with `segments` segments and tiles
    /// of up to `rows` rows
    ///
    /// Returns `None` when the layout is ragged or a single segment's tile
    /// would not fit one slot.
    #[must_use]
    pub fn uniform_packing(
        &self,
        rows: usize,
        segments: usize,
        block_bytes: usize,
    ) -> Option<UniformPacking> {
        let SegmentLayout::Uniform { segment_len } = self.plan.layout else {
            return None;
        };
        if segments == 0 || rows == 0 {
            return None;
        }
        let per_block = self.plan.element_width.per_block(block_bytes);
        let budget = self.plan.slot_elements.checked_sub(rows.checked_mul(per_block)?)?;
        let per_segment = rows.checked_mul(segment_len)?.checked_add(per_block)?;
        let per_tile = (budget / per_segment).min(segments);
        if per_tile == 0 {
            return None;
        }
        let tiles = segments.div_ceil(per_tile);
        Some(UniformPacking {
            per_tile,
            tail: segments - (tiles - 1) * per_tile,
            tiles,
            segment_stride: align_up(rows * segment_len, per_block),
        })
    }
}

/// Round `n` up to a multiple of `align`
#[inline]
#[must_use]
pub fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Round `n` down to a multiple of `align`
#[inline]
#[must_use]
pub fn align_down(n: usize, align: usize) -> usize {
    n / align * align
}
