//! Host-side tiling plan builder
//!
//! Computes a [`TilingPlan`] from the segment shapes and the device limits.
//! The engine accepts any plan that validates; this builder produces one
//! that keeps every staging tile within a slot and spreads work over the
//! available cores.
//!
//! ## Algorithm
//!
//! 1. Pick the processing width (see [`lowered_width`]).
//! 2. Size the tile: as many columns as fit next to `least_rows` rows,
//!    rounded down to whole blocks; whole rows if the axis fits.
//! 3. Partition: many row tiles go to workers in contiguous runs. With few
//!    row tiles, idle cores borrow column work by halving the tile width
//!    until either every core has a column tile or the tile gets too small.
//! 4. Record where each column band ends on the concat axis.

use crate::config::EngineConfig;
use crate::cursor::Position;
use crate::dtype::{lowered_width, ElementWidth};
use crate::error::{ConcatError, Result};
use crate::plan::{align_down, PartitionAxis, SegmentLayout, TilePlanner, TilingPlan};
use crate::segment::SegmentTable;

/// Rows a tile is sized for before columns are chosen
pub const LEAST_ROWS: usize = 64;

/// Narrowest tile, in bytes, worth splitting columns down to
pub const LEAST_TILE_ROW_BYTES: usize = 256;

/// Smallest tile, in bytes, worth splitting columns down to
pub const LEAST_TILE_BYTES: usize = 2048;

/// Builds tiling plans for one device
#[derive(Debug, Clone)]
pub struct TilingPlanner {
    config: EngineConfig,
}

impl TilingPlanner {
    /// Planner for a config
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Width segments of `table` will be processed at
    #[must_use]
    pub fn processing_width(&self, table: &SegmentTable<'_>) -> ElementWidth {
        let strides: Vec<usize> = table.segments().iter().map(|s| s.row_stride()).collect();
        lowered_width(
            table.width(),
            &table.lengths(),
            &strides,
            self.config.device.block_bytes,
        )
    }

    /// Build a plan for `table`
    ///
    /// The plan's element width may differ from the table's; run it against
    /// `table.reinterpret(plan.element_width)`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if the device is unusable or too small
    /// for even one block-wide tile
    pub fn plan(&self, table: &SegmentTable<'_>) -> Result<TilingPlan> {
        self.config.validate()?;
        let width = self.processing_width(table);
        let table = table.reinterpret(width)?;
        if table.is_degenerate() {
            return Ok(TilingPlan::empty(
                width,
                table.rows(),
                table.total_axis_len(),
                table.len(),
            ));
        }

        let device = &self.config.device;
        let rows = table.rows();
        let total = table.total_axis_len();
        let lengths = table.lengths();
        let per_block = width.per_block(device.block_bytes);

        let slot_elements =
            (device.slot_bytes() / width.bytes()).min(width.index_width().max_index());
        let unaligned = lengths.iter().filter(|&&len| len % per_block != 0).count();
        let reserve = (unaligned + 2) * per_block;
        let usable = slot_elements.checked_sub(reserve).ok_or_else(|| {
            ConcatError::InvalidConfiguration(format!(
                "slot of {slot_elements} elements cannot hold padding for {unaligned} unaligned segments"
            ))
        })?;

        let least_rows = rows.min(LEAST_ROWS);
        let max_cols = align_down(usable / least_rows, per_block);
        if max_cols == 0 {
            return Err(ConcatError::InvalidConfiguration(format!(
                "slot of {slot_elements} elements is narrower than one block for {least_rows} rows"
            )));
        }

        let mut layout = self.uniform_layout(&lengths, width, unaligned);
        let mut align = per_block;
        let mut max_cols = max_cols;
        if let SegmentLayout::Uniform { segment_len } = layout {
            let whole = align_down(max_cols, segment_len);
            if whole == 0 {
                layout = SegmentLayout::Ragged;
            } else {
                max_cols = whole;
                align = segment_len;
            }
        }

        let mut tile_cols = total.min(max_cols);
        let tile_rows = (usable / tile_cols).min(rows);
        let row_tiles = rows.div_ceil(tile_rows);
        let mut col_tiles = total.div_ceil(tile_cols);

        let cores = device.core_count;
        let mut plan = TilingPlan {
            element_width: width,
            rows,
            total_axis_len: total,
            segment_count: table.len(),
            slot_elements,
            layout,
            ..TilingPlan::empty(width, rows, total, table.len())
        };

        if row_tiles > cores / 2 {
            let per_worker = row_tiles.div_ceil(cores);
            let workers = row_tiles.div_ceil(per_worker);
            plan.partition = PartitionAxis::Rows;
            plan.worker_count = workers;
            plan.row_bands = workers;
            plan.col_bands = 1;
            plan.tiles_per_worker = per_worker;
            plan.tail_tiles_per_worker = row_tiles - (workers - 1) * per_worker;
        } else {
            let spare = cores / row_tiles;
            let bytes = width.bytes();
            while col_tiles < spare {
                let half = align_down(tile_cols / 2, align);
                if half == 0
                    || half * bytes < LEAST_TILE_ROW_BYTES
                    || half * tile_rows * bytes < LEAST_TILE_BYTES
                {
                    break;
                }
                tile_cols = half;
                col_tiles = total.div_ceil(tile_cols);
            }
            if col_tiles > 1 {
                let per_band = col_tiles.div_ceil(spare);
                let bands = col_tiles.div_ceil(per_band);
                plan.partition = PartitionAxis::Columns;
                plan.col_bands = bands;
                plan.tiles_per_worker = per_band;
                plan.tail_tiles_per_worker = col_tiles - (bands - 1) * per_band;
            } else {
                plan.partition = PartitionAxis::Rows;
                plan.col_bands = 1;
                plan.tiles_per_worker = 1;
                plan.tail_tiles_per_worker = 1;
            }
            plan.row_bands = row_tiles;
            plan.worker_count = row_tiles * plan.col_bands;
        }

        plan.tile_rows = tile_rows;
        plan.tail_tile_rows = rows - (row_tiles - 1) * tile_rows;
        plan.tile_cols = tile_cols;
        plan.tail_tile_cols = total - (col_tiles - 1) * tile_cols;
        plan.row_tiles = row_tiles;
        plan.col_tiles = col_tiles;

        let planner = TilePlanner::new(&plan);
        let band_ends = (0..plan.col_bands)
            .map(|band| Position::at_column(&table, planner.band_columns(band).end))
            .collect::<Result<Vec<_>>>()?;
        plan.band_ends = band_ends;

        tracing::debug!(
            width = ?plan.element_width,
            workers = plan.worker_count,
            partition = ?plan.partition,
            tile_rows = plan.tile_rows,
            tile_cols = plan.tile_cols,
            layout = ?plan.layout,
            "built tiling plan"
        );

        plan.validate(&table, &self.config)?;
        Ok(plan)
    }

    fn uniform_layout(
        &self,
        lengths: &[usize],
        width: ElementWidth,
        unaligned: usize,
    ) -> SegmentLayout {
        let Some(&segment_len) = lengths.first() else {
            return SegmentLayout::Ragged;
        };
        let same = lengths.iter().all(|&len| len == segment_len);
        let narrow = segment_len * width.bytes() < self.config.device.vector_bytes / 2;
        if same && segment_len > 0 && unaligned > 0 && narrow {
            SegmentLayout::Uniform { segment_len }
        } else {
            SegmentLayout::Ragged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::segment::Segment;

    fn table_of<'a>(
        data: &'a [u8],
        rows: usize,
        lengths: &[usize],
        width: ElementWidth,
    ) -> SegmentTable<'a> {
        let segments = lengths
            .iter()
            .map(|&len| {
                let bytes = rows * len * width.bytes();
                Segment::new(&data[..bytes], rows, len, width).expect("test")
            })
            .collect();
        SegmentTable::new(segments, width).expect("test")
    }

    #[test]
    fn test_plan_degenerate() {
        let data = vec![0u8; 0];
        let table = table_of(&data, 3, &[0, 0], ElementWidth::B32);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert!(plan.is_empty());
        assert_eq!(plan.rows, 3);
    }

    #[test]
    fn test_plan_small_whole_rows() {
        let data = vec![0u8; 2 * 5 * 4];
        let table = table_of(&data, 2, &[3, 0, 5], ElementWidth::B32);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert_eq!(plan.worker_count, 1);
        assert_eq!(plan.partition, PartitionAxis::Rows);
        assert_eq!(plan.tile_cols, 8);
        assert_eq!(plan.tile_rows, 2);
        assert_eq!(plan.band_ends, vec![Position::new(2, 5)]);
        assert_eq!(plan.layout, SegmentLayout::Ragged);
    }

    #[test]
    fn test_plan_many_rows_splits_rows() {
        let data = vec![0u8; 4096 * 1000 * 4];
        let table = table_of(&data, 4096, &[1000, 37, 500], ElementWidth::B32);
        let config = EngineConfig::default();
        let plan = TilingPlanner::new(&config).plan(&table).expect("test");
        assert_eq!(plan.partition, PartitionAxis::Rows);
        assert!(plan.worker_count <= config.device.core_count);
        assert!(plan.tile_rows * plan.tile_cols <= plan.slot_elements);
        assert!(plan.col_tiles > 1);
        plan.validate(&table, &config).expect("test");
    }

    #[test]
    fn test_plan_wide_rows_splits_columns() {
        let data = vec![0u8; 8 * 4000 * 4];
        let table = table_of(&data, 8, &[4000, 3000], ElementWidth::B32);
        let config = EngineConfig::default();
        let plan = TilingPlanner::new(&config).plan(&table).expect("test");
        assert_eq!(plan.partition, PartitionAxis::Columns);
        assert_eq!(plan.row_bands, 1);
        assert!(plan.col_bands > 1);
        assert!(plan.worker_count <= config.device.core_count);
        assert_eq!(plan.tile_cols % 8, 0);
        assert_eq!(plan.band_ends.last(), Some(&Position::new(1, 3000)));
    }

    #[test]
    fn test_plan_uniform_layout() {
        let data = vec![0u8; 16 * 3 * 4];
        let table = table_of(&data, 16, &[3; 10], ElementWidth::B32);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert_eq!(plan.layout, SegmentLayout::Uniform { segment_len: 3 });
    }

    #[test]
    fn test_plan_uniform_aligned_stays_ragged() {
        let data = vec![0u8; 16 * 8 * 4];
        let table = table_of(&data, 16, &[8; 4], ElementWidth::B32);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert_eq!(plan.layout, SegmentLayout::Ragged);
    }

    #[test]
    fn test_plan_widens_even_bytes() {
        let data = vec![0u8; 4 * 6];
        let table = table_of(&data, 4, &[2, 6], ElementWidth::B8);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert_eq!(plan.element_width, ElementWidth::B16);
        assert_eq!(plan.total_axis_len, 4);
    }

    #[test]
    fn test_plan_splits_unaligned_b64() {
        let data = vec![0u8; 2 * 3 * 8];
        let table = table_of(&data, 2, &[3, 1], ElementWidth::B64);
        let plan = TilingPlanner::new(&EngineConfig::default())
            .plan(&table)
            .expect("test");
        assert_eq!(plan.element_width, ElementWidth::B32);
        assert_eq!(plan.total_axis_len, 8);
    }

    #[test]
    fn test_plan_small_device_many_tiles() {
        let data = vec![0u8; 8 * 300 * 4];
        let table = table_of(&data, 8, &[300, 17, 45], ElementWidth::B32);
        let config = EngineConfig::new(DeviceConfig::small());
        let plan = TilingPlanner::new(&config).plan(&table).expect("test");
        assert!(plan.row_tiles * plan.col_tiles > 4);
        assert!(plan.worker_count <= 4);
        plan.validate(&table, &config).expect("test");
    }

    #[test]
    fn test_plan_rejects_invalid_device() {
        let data = vec![0u8; 4];
        let table = table_of(&data, 1, &[1], ElementWidth::B32);
        let config = EngineConfig::new(DeviceConfig::default().with_core_count(0));
        assert!(TilingPlanner::new(&config).plan(&table).is_err());
    }
}
