//! Staging tiles and the two-slot ring
//!
//! A [`TileJob`] describes one pipeline iteration: which output rectangle the
//! tile fills, and which segment fragments feed it. Stage-in copies each
//! fragment's rows from the segment table into a staging slot, compacted to
//! `rows × cols` and padded to a block boundary. Stage-out writes the packed
//! tile to the output region.
//!
//! The [`StagingRing`] holds two slots. Job `k` always uses slot `k % 2`,
//! and each slot moves through `Free -> Staged -> Packed -> Free`, one stage
//! per transition. A stage waits until its slot reaches the state it
//! consumes, so with two slots stage-in of tile `k + 1` runs while tile `k`
//! is repacked or written out.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::config::STAGING_SLOTS;
use crate::cursor::Fragment;
use crate::dtype::ElementWidth;
use crate::error::{ConcatError, Result};
use crate::output::OutputRegion;
use crate::plan::{align_up, Region};
use crate::repack::FragmentCopy;
use crate::segment::SegmentTable;

// ============================================================================
// Tile jobs
// ============================================================================

/// One fragment of a tile, as staged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedFragment {
    /// Source segment
    pub segment: usize,
    /// First source column in the segment
    pub src_col: usize,
    /// Columns
    pub cols: usize,
    /// Element offset in the staging slot (block aligned)
    pub staged_offset: usize,
    /// First column in the packed tile
    pub dst_col: usize,
}

/// One pipeline iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileJob {
    /// Position in the worker's tile sequence
    pub seq: usize,
    /// First output row
    pub row_offset: usize,
    /// Rows
    pub rows: usize,
    /// First output column
    pub col_offset: usize,
    /// Columns actually covered
    pub cols: usize,
    /// Packed tile row stride
    pub stride: usize,
    /// Fragments in column order
    pub fragments: Vec<StagedFragment>,
    /// Segment length and staged segment stride when every fragment is a
    /// whole uniform segment
    pub uniform: Option<(usize, usize)>,
}

impl TileJob {
    /// Tile cut by the boundary resolver
    ///
    /// `stride` is the nominal tile width; a truncated tail tile keeps it so
    /// every tile shares one packed layout.
    #[must_use]
    pub fn ragged(
        seq: usize,
        (row_offset, rows): (usize, usize),
        col_offset: usize,
        stride: usize,
        fragments: &[Fragment],
        per_block: usize,
    ) -> Self {
        let mut staged_offset = 0;
        let mut cols = 0;
        let fragments = fragments
            .iter()
            .map(|f| {
                let staged = StagedFragment {
                    segment: f.segment,
                    src_col: f.offset,
                    cols: f.cols,
                    staged_offset,
                    dst_col: f.tile_col,
                };
                staged_offset += align_up(rows * f.cols, per_block);
                cols = cols.max(f.tile_col + f.cols);
                staged
            })
            .collect();
        Self {
            seq,
            row_offset,
            rows,
            col_offset,
            cols,
            stride: stride.max(cols),
            fragments,
            uniform: None,
        }
    }

    /// Tile of whole segments `first..first + count`, each `segment_len`
    /// wide, staged `segment_stride` apart
    #[must_use]
    pub fn uniform(
        seq: usize,
        (row_offset, rows): (usize, usize),
        col_offset: usize,
        (first, count): (usize, usize),
        segment_len: usize,
        segment_stride: usize,
    ) -> Self {
        let fragments = (0..count)
            .map(|k| StagedFragment {
                segment: first + k,
                src_col: 0,
                cols: segment_len,
                staged_offset: k * segment_stride,
                dst_col: k * segment_len,
            })
            .collect();
        let cols = count * segment_len;
        Self {
            seq,
            row_offset,
            rows,
            col_offset,
            cols,
            stride: cols,
            fragments,
            uniform: Some((segment_len, segment_stride)),
        }
    }

    /// Whether the tile covers no columns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }

    /// Staging elements needed, including padding
    #[must_use]
    pub fn staged_elements(&self, per_block: usize) -> usize {
        self.fragments
            .iter()
            .map(|f| f.staged_offset + align_up(self.rows * f.cols, per_block))
            .max()
            .unwrap_or(0)
    }

    /// Packed elements needed
    #[must_use]
    pub fn packed_elements(&self) -> usize {
        self.rows * self.stride
    }

    /// Output rectangle this tile fills
    #[must_use]
    pub fn region(&self) -> Region {
        Region {
            row_offset: self.row_offset,
            rows: self.rows,
            col_offset: self.col_offset,
            cols: self.cols,
        }
    }

    /// Per-fragment repack placements
    pub fn fragment_copies(&self) -> impl Iterator<Item = FragmentCopy> + '_ {
        self.fragments.iter().map(|f| FragmentCopy {
            src_offset: f.staged_offset,
            dst_col: f.dst_col,
            rows: self.rows,
            cols: f.cols,
            stride: self.stride,
            segments: None,
        })
    }

    /// Single placement covering every uniform segment, if the tile is
    /// uniform
    #[must_use]
    pub fn group_copy(&self) -> Option<FragmentCopy> {
        let (segment_len, segment_stride) = self.uniform?;
        Some(FragmentCopy {
            src_offset: 0,
            dst_col: 0,
            rows: self.rows,
            cols: self.cols,
            stride: self.stride,
            segments: Some((segment_len, segment_stride)),
        })
    }
}

// ============================================================================
// Stage-in / stage-out
// ============================================================================

/// Copy a tile's fragments from the segment table into `staged`
///
/// Each fragment lands as `rows × cols` contiguous elements at its staged
/// offset; the gap up to the next block boundary is zero-filled. Returns the
/// number of data bytes moved.
///
/// # Errors
///
/// Returns `CapacityExceeded` if the tile does not fit `staged`, or
/// propagates segment lookup failures
pub fn stage_in(
    table: &SegmentTable<'_>,
    job: &TileJob,
    staged: &mut [u8],
    per_block: usize,
) -> Result<usize> {
    let w = table.width().bytes();
    let needed = job.staged_elements(per_block) * w;
    if needed > staged.len() {
        return Err(ConcatError::CapacityExceeded {
            needed,
            capacity: staged.len(),
        });
    }
    let mut moved = 0;
    for frag in &job.fragments {
        let run = frag.cols * w;
        for r in 0..job.rows {
            let src = table.source(frag.segment, job.row_offset + r, frag.src_col, frag.cols)?;
            let at = (frag.staged_offset + r * frag.cols) * w;
            staged[at..at + run].copy_from_slice(src);
        }
        let data_end = (frag.staged_offset + job.rows * frag.cols) * w;
        let padded_end = (frag.staged_offset + align_up(job.rows * frag.cols, per_block)) * w;
        staged[data_end..padded_end].fill(0);
        moved += job.rows * run;
    }
    Ok(moved)
}

/// Write a packed tile to the output; returns bytes written
///
/// Exactly `job.cols` columns per row are written, even when the packed
/// stride is wider.
///
/// # Safety
///
/// Same contract as [`OutputRegion::write_rows`]: no concurrent access to
/// `region` of `output` while the call runs.
///
/// # Errors
///
/// Returns `InvalidShape` if the tile leaves the worker's region
pub unsafe fn stage_out(
    job: &TileJob,
    packed: &[u8],
    output: &OutputRegion<'_>,
    region: &Region,
    width: ElementWidth,
) -> Result<usize> {
    // SAFETY: forwarded from the caller.
    unsafe {
        output.write_rows(
            region,
            job.row_offset,
            job.col_offset,
            job.rows,
            job.cols,
            packed,
            job.stride,
        )?;
    }
    Ok(job.rows * job.cols * width.bytes())
}

// ============================================================================
// Two-slot ring
// ============================================================================

/// Which stage may take a slot next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for stage-in
    Free,
    /// Staged, waiting for repack
    Staged,
    /// Packed, waiting for stage-out
    Packed,
}

/// Buffers of one staging slot
#[derive(Debug)]
pub struct StagingSlot {
    /// Input staging
    pub staged: Vec<u8>,
    /// Output staging
    pub packed: Vec<u8>,
}

#[derive(Debug)]
struct RingFlags {
    states: [SlotState; STAGING_SLOTS],
    aborted: Option<String>,
}

/// Two staging slots with per-slot handoff flags
#[derive(Debug)]
pub struct StagingRing {
    worker: usize,
    slots: [Mutex<StagingSlot>; STAGING_SLOTS],
    flags: Mutex<RingFlags>,
    changed: Condvar,
}

impl StagingRing {
    /// Ring for `worker` with `slot_bytes` per staging half
    #[must_use]
    pub fn new(worker: usize, slot_bytes: usize) -> Self {
        let slot = || {
            Mutex::new(StagingSlot {
                staged: vec![0; slot_bytes],
                packed: vec![0; slot_bytes],
            })
        };
        Self {
            worker,
            slots: [slot(), slot()],
            flags: Mutex::new(RingFlags {
                states: [SlotState::Free; STAGING_SLOTS],
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Slot used by job `seq`
    #[must_use]
    pub const fn slot_for(seq: usize) -> usize {
        seq % STAGING_SLOTS
    }

    fn poisoned(&self) -> ConcatError {
        ConcatError::PipelineAborted {
            worker: self.worker,
            reason: "staging lock poisoned".to_string(),
        }
    }

    /// Current state of a slot
    ///
    /// # Errors
    ///
    /// Returns `PipelineAborted` if a lock is poisoned
    pub fn state(&self, slot: usize) -> Result<SlotState> {
        let flags = self.flags.lock().map_err(|_| self.poisoned())?;
        Ok(flags.states[slot])
    }

    /// Block until `slot` is in `expected`, then lock its buffers
    ///
    /// # Errors
    ///
    /// Returns `PipelineAborted` if another stage aborted the ring
    pub fn acquire(&self, slot: usize, expected: SlotState) -> Result<MutexGuard<'_, StagingSlot>> {
        let mut flags = self.flags.lock().map_err(|_| self.poisoned())?;
        loop {
            if let Some(reason) = &flags.aborted {
                return Err(ConcatError::PipelineAborted {
                    worker: self.worker,
                    reason: reason.clone(),
                });
            }
            if flags.states[slot] == expected {
                break;
            }
            flags = self.changed.wait(flags).map_err(|_| self.poisoned())?;
        }
        drop(flags);
        self.slots[slot].lock().map_err(|_| self.poisoned())
    }

    /// Hand `slot` to the stage that consumes `next`
    ///
    /// # Errors
    ///
    /// Returns `PipelineAborted` if a lock is poisoned
    pub fn release(&self, slot: usize, next: SlotState) -> Result<()> {
        let mut flags = self.flags.lock().map_err(|_| self.poisoned())?;
        flags.states[slot] = next;
        drop(flags);
        self.changed.notify_all();
        Ok(())
    }

    /// Stop every stage; waiters return `PipelineAborted`
    pub fn abort(&self, reason: &str) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.aborted.get_or_insert_with(|| reason.to_string());
        }
        self.changed.notify_all();
    }

    /// Exclusive access to a slot when no other stage runs
    ///
    /// # Errors
    ///
    /// Returns `PipelineAborted` if the slot lock is poisoned
    pub fn slot_mut(&mut self, slot: usize) -> Result<&mut StagingSlot> {
        let worker = self.worker;
        self.slots[slot]
            .get_mut()
            .map_err(|_| ConcatError::PipelineAborted {
                worker,
                reason: "staging lock poisoned".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::sync::Arc;

    fn frag(segment: usize, offset: usize, cols: usize, tile_col: usize) -> Fragment {
        Fragment {
            segment,
            offset,
            cols,
            tile_col,
        }
    }

    #[test]
    fn test_ragged_job_offsets_are_block_aligned() {
        let job = TileJob::ragged(
            0,
            (0, 2),
            5,
            8,
            &[frag(0, 1, 3, 0), frag(2, 0, 5, 3)],
            4,
        );
        assert_eq!(job.fragments[0].staged_offset, 0);
        // 2 rows * 3 cols = 6 -> aligned to 8
        assert_eq!(job.fragments[1].staged_offset, 8);
        assert_eq!(job.cols, 8);
        assert_eq!(job.staged_elements(4), 8 + 12);
        assert_eq!(job.packed_elements(), 16);
    }

    #[test]
    fn test_ragged_tail_keeps_stride() {
        let job = TileJob::ragged(3, (0, 2), 16, 8, &[frag(1, 2, 3, 0)], 4);
        assert_eq!(job.cols, 3);
        assert_eq!(job.stride, 8);
    }

    #[test]
    fn test_uniform_job() {
        let job = TileJob::uniform(0, (4, 2), 6, (2, 3), 3, 8);
        assert_eq!(job.cols, 9);
        assert_eq!(job.stride, 9);
        assert_eq!(job.fragments[2].segment, 4);
        assert_eq!(job.fragments[2].staged_offset, 16);
        let group = job.group_copy().expect("test");
        assert_eq!(group.segments, Some((3, 8)));
        assert_eq!(group.cols, 9);
    }

    #[test]
    fn test_stage_in_compacts_and_pads() {
        // Segment 0: 2 rows x 4 cols, stride 5 (bytes)
        let a: Vec<u8> = vec![1, 2, 3, 4, 99, 5, 6, 7, 8];
        let b: Vec<u8> = vec![10, 11, 12, 13];
        let table = SegmentTable::new(
            vec![
                Segment::strided(&a, 2, 4, 5, ElementWidth::B8).expect("test"),
                Segment::new(&b, 2, 2, ElementWidth::B8).expect("test"),
            ],
            ElementWidth::B8,
        )
        .expect("test");
        let job = TileJob::ragged(0, (0, 2), 0, 5, &[frag(0, 1, 3, 0), frag(1, 0, 2, 3)], 8);
        let mut staged = vec![0xffu8; 32];
        let moved = stage_in(&table, &job, &mut staged, 8).expect("test");
        assert_eq!(moved, 10);
        assert_eq!(&staged[..8], &[2, 3, 4, 6, 7, 8, 0, 0]);
        assert_eq!(&staged[8..16], &[10, 11, 12, 13, 0, 0, 0, 0]);
        assert_eq!(staged[16], 0xff);
    }

    #[test]
    fn test_stage_in_rejects_small_slot() {
        let a = vec![0u8; 64];
        let table = SegmentTable::new(
            vec![Segment::new(&a, 2, 32, ElementWidth::B8).expect("test")],
            ElementWidth::B8,
        )
        .expect("test");
        let job = TileJob::ragged(0, (0, 2), 0, 32, &[frag(0, 0, 32, 0)], 8);
        let mut staged = vec![0u8; 32];
        assert!(matches!(
            stage_in(&table, &job, &mut staged, 8),
            Err(ConcatError::CapacityExceeded { needed: 64, capacity: 32 })
        ));
    }

    #[test]
    fn test_stage_out_writes_only_covered_columns() {
        let mut buf = vec![0u8; 2 * 6];
        {
            let out = OutputRegion::new(&mut buf, 2, 6, ElementWidth::B8).expect("test");
            let job = TileJob::ragged(0, (0, 2), 4, 4, &[frag(0, 0, 2, 0)], 8);
            let packed = vec![1, 2, 9, 9, 3, 4, 9, 9];
            // SAFETY: single writer.
            let written = unsafe { stage_out(&job, &packed, &out, &out.bounds(), ElementWidth::B8) }
                .expect("test");
            assert_eq!(written, 4);
        }
        assert_eq!(buf, vec![0, 0, 0, 0, 1, 2, 0, 0, 0, 0, 3, 4]);
    }

    #[test]
    fn test_ring_handoff_across_threads() {
        let ring = Arc::new(StagingRing::new(0, 8));
        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for seq in 0..6u8 {
                    let slot = StagingRing::slot_for(seq as usize);
                    {
                        let mut guard = ring.acquire(slot, SlotState::Free).expect("test");
                        guard.staged[0] = seq;
                    }
                    ring.release(slot, SlotState::Staged).expect("test");
                }
            })
        };
        let mut seen = Vec::new();
        for seq in 0..6usize {
            let slot = StagingRing::slot_for(seq);
            {
                let guard = ring.acquire(slot, SlotState::Staged).expect("test");
                seen.push(guard.staged[0]);
            }
            ring.release(slot, SlotState::Free).expect("test");
        }
        producer.join().expect("test");
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_ring_abort_wakes_waiters() {
        let ring = Arc::new(StagingRing::new(7, 8));
        let waiter = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || ring.acquire(0, SlotState::Packed).map(|_| ()))
        };
        ring.abort("stage-in failed");
        let err = waiter.join().expect("test").expect_err("test");
        assert!(matches!(err, ConcatError::PipelineAborted { worker: 7, .. }));
        assert!(err.to_string().contains("stage-in failed"));
    }

    #[test]
    fn test_slot_states() {
        let mut ring = StagingRing::new(0, 4);
        assert_eq!(ring.state(1).expect("test"), SlotState::Free);
        ring.release(1, SlotState::Packed).expect("test");
        assert_eq!(ring.state(1).expect("test"), SlotState::Packed);
        assert_eq!(ring.slot_mut(0).expect("test").staged.len(), 4);
    }
}
