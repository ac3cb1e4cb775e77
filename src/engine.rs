//! Copy-repack engine
//!
//! Kernel entry ([`run_worker`]) and launch ([`launch`]). A worker:
//!
//! 1. asks the [`TilePlanner`] for its sub-rectangle (none: no-op),
//! 2. builds its tile schedule, driving one [`SegmentCursor`] across its
//!    column band (or packing whole segments for the uniform layout),
//! 3. streams the tiles through the two-slot staging ring:
//!    stage-in → repack → stage-out.
//!
//! With `overlap_transfers` the three stages run on their own threads and
//! hand slots to each other through the ring flags; otherwise they run in
//! order on the worker's thread. Workers are spread over `rayon`; the launch
//! returns only after every worker has joined.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::cursor::SegmentCursor;
use crate::error::{ConcatError, Result};
use crate::output::OutputRegion;
use crate::plan::{align_up, Region, SegmentLayout, TilePlanner, TilingPlan, WorkerTiling};
use crate::planner::TilingPlanner;
use crate::repack::{RepackStrategy, Repacker, StrategyCounts};
use crate::segment::SegmentTable;
use crate::staging::{stage_in, stage_out, SlotState, StagingRing, StagingSlot, TileJob};

// ============================================================================
// Reports
// ============================================================================

/// What one worker did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker index
    pub worker_id: usize,
    /// Worker owned no output and returned immediately
    pub idle: bool,
    /// Tiles streamed through the pipeline
    pub tiles: usize,
    /// Tiles that resolved to zero columns
    pub skipped_tiles: usize,
    /// Source bytes staged in (padding excluded)
    pub bytes_in: usize,
    /// Bytes written to the output
    pub bytes_out: usize,
    /// Segment-advance steps of the boundary cursor
    pub cursor_steps: usize,
    /// Index vectors generated
    pub index_generations: usize,
    /// Fragments per repack strategy
    pub strategies: StrategyCounts,
    /// Ran with overlapped stages
    pub overlapped: bool,
}

impl WorkerStats {
    fn idle(worker_id: usize) -> Self {
        Self {
            worker_id,
            idle: true,
            ..Self::default()
        }
    }
}

/// Result of a launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchReport {
    /// Workers launched
    pub block_dim: usize,
    /// Per-worker stats, by worker index
    pub workers: Vec<WorkerStats>,
}

impl LaunchReport {
    /// Workers that owned output
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.idle).count()
    }

    /// Tiles over all workers
    #[must_use]
    pub fn total_tiles(&self) -> usize {
        self.workers.iter().map(|w| w.tiles).sum()
    }

    /// Bytes written over all workers
    #[must_use]
    pub fn bytes_out(&self) -> usize {
        self.workers.iter().map(|w| w.bytes_out).sum()
    }

    /// Strategy use over all workers
    #[must_use]
    pub fn strategies(&self) -> StrategyCounts {
        let mut total = StrategyCounts::default();
        for worker in &self.workers {
            total.merge(&worker.strategies);
        }
        total
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Tiles a worker will stream, in order
#[derive(Debug, Clone, Default)]
struct Schedule {
    jobs: Vec<TileJob>,
    skipped: usize,
    cursor_steps: usize,
}

fn build_schedule(
    table: &SegmentTable<'_>,
    plan: &TilingPlan,
    tiling: &WorkerTiling,
    config: &EngineConfig,
) -> Result<Schedule> {
    let planner = TilePlanner::new(plan);
    let per_block = plan.element_width.per_block(config.device.block_bytes);

    if let Some(schedule) = uniform_schedule(plan, tiling, config)? {
        return Ok(schedule);
    }

    let mut schedule = Schedule::default();
    let mut cursor = SegmentCursor::new(tiling.cursor_start, tiling.cursor_end)?;
    for col_tile in tiling.col_tiles.clone() {
        let (col_offset, width) = planner.col_tile(col_tile);
        let resolution = cursor.resolve(table, width)?;
        if resolution.columns == 0 {
            schedule.skipped += tiling.row_tiles.len();
            continue;
        }
        if resolution.truncated {
            tracing::trace!(col_tile, columns = resolution.columns, width, "truncated tail tile");
        }
        let fragments = resolution.split.fragments(table)?;
        for row_tile in tiling.row_tiles.clone() {
            let seq = schedule.jobs.len();
            schedule.jobs.push(TileJob::ragged(
                seq,
                planner.row_tile(row_tile),
                col_offset,
                plan.tile_cols,
                &fragments,
                per_block,
            ));
        }
    }
    schedule.cursor_steps = cursor.advance_steps();
    Ok(schedule)
}

/// Whole-segment schedule, if the layout is uniform and the band starts and
/// ends on segment boundaries
fn uniform_schedule(
    plan: &TilingPlan,
    tiling: &WorkerTiling,
    config: &EngineConfig,
) -> Result<Option<Schedule>> {
    let SegmentLayout::Uniform { segment_len } = plan.layout else {
        return Ok(None);
    };
    let columns = tiling.region.col_offset..tiling.region.col_offset + tiling.region.cols;
    if segment_len == 0 || columns.start % segment_len != 0 || columns.end % segment_len != 0 {
        return Ok(None);
    }
    let first = columns.start / segment_len;
    let segments = columns.len() / segment_len;
    let planner = TilePlanner::new(plan);
    let Some(packing) = planner.uniform_packing(plan.tile_rows, segments, config.device.block_bytes)
    else {
        return Ok(None);
    };

    let per_block = plan.element_width.per_block(config.device.block_bytes);
    let mut schedule = Schedule::default();
    for row_tile in tiling.row_tiles.clone() {
        let (row_offset, rows) = planner.row_tile(row_tile);
        let segment_stride = align_up(rows * segment_len, per_block);
        for group in 0..packing.tiles {
            let count = if group + 1 == packing.tiles {
                packing.tail
            } else {
                packing.per_tile
            };
            let start = first + group * packing.per_tile;
            let seq = schedule.jobs.len();
            schedule.jobs.push(TileJob::uniform(
                seq,
                (row_offset, rows),
                start * segment_len,
                (start, count),
                segment_len,
                segment_stride,
            ));
        }
    }
    Ok(Some(schedule))
}

fn check_capacity(jobs: &[TileJob], slot_elements: usize, per_block: usize) -> Result<()> {
    for job in jobs {
        let needed = job.staged_elements(per_block).max(job.packed_elements());
        if needed > slot_elements {
            return Err(ConcatError::CapacityExceeded {
                needed,
                capacity: slot_elements,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Pipeline
// ============================================================================

/// Read-only state shared by the pipeline stages of one worker
struct StageContext<'a, 'b> {
    worker: usize,
    table: &'a SegmentTable<'b>,
    output: &'a OutputRegion<'b>,
    region: Region,
    per_block: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Moved {
    bytes_in: usize,
    bytes_out: usize,
}

fn repack_job(repacker: &mut Repacker, job: &TileJob, slot: &mut StagingSlot) -> Result<()> {
    let StagingSlot { staged, packed } = slot;
    if let Some(group) = job.group_copy() {
        if matches!(repacker.strategy_for(&group), RepackStrategy::Gather(_)) {
            repacker.repack(&group, staged, packed)?;
            return Ok(());
        }
    }
    for copy in job.fragment_copies() {
        repacker.repack(&copy, staged, packed)?;
    }
    Ok(())
}

fn run_sequential(
    ctx: &StageContext<'_, '_>,
    jobs: &[TileJob],
    ring: &mut StagingRing,
    repacker: &mut Repacker,
) -> Result<Moved> {
    let mut moved = Moved::default();
    let width = ctx.table.width();
    for job in jobs {
        let slot = ring.slot_mut(StagingRing::slot_for(job.seq))?;
        moved.bytes_in += stage_in(ctx.table, job, &mut slot.staged, ctx.per_block)?;
        repack_job(repacker, job, slot)?;
        // SAFETY: `ctx.region` belongs to this worker alone (`run_worker`
        // contract) and this is its only writer.
        moved.bytes_out +=
            unsafe { stage_out(job, &slot.packed, ctx.output, &ctx.region, width) }?;
        tracing::trace!(seq = job.seq, rows = job.rows, cols = job.cols, "tile done");
    }
    Ok(moved)
}

fn stage_in_all(ctx: &StageContext<'_, '_>, jobs: &[TileJob], ring: &StagingRing) -> Result<usize> {
    let mut moved = 0;
    for job in jobs {
        let slot = StagingRing::slot_for(job.seq);
        {
            let mut guard = ring.acquire(slot, SlotState::Free)?;
            moved += stage_in(ctx.table, job, &mut guard.staged, ctx.per_block)?;
        }
        ring.release(slot, SlotState::Staged)?;
    }
    Ok(moved)
}

fn repack_all(jobs: &[TileJob], ring: &StagingRing, repacker: &mut Repacker) -> Result<()> {
    for job in jobs {
        let slot = StagingRing::slot_for(job.seq);
        {
            let mut guard = ring.acquire(slot, SlotState::Staged)?;
            repack_job(repacker, job, &mut guard)?;
        }
        ring.release(slot, SlotState::Packed)?;
    }
    Ok(())
}

fn stage_out_all(ctx: &StageContext<'_, '_>, jobs: &[TileJob], ring: &StagingRing) -> Result<usize> {
    let width = ctx.table.width();
    let mut moved = 0;
    for job in jobs {
        let slot = StagingRing::slot_for(job.seq);
        {
            let guard = ring.acquire(slot, SlotState::Packed)?;
            // SAFETY: `ctx.region` belongs to this worker alone (`run_worker`
            // contract) and the stage-out thread is its only writer.
            moved += unsafe { stage_out(job, &guard.packed, ctx.output, &ctx.region, width) }?;
        }
        ring.release(slot, SlotState::Free)?;
        tracing::trace!(seq = job.seq, rows = job.rows, cols = job.cols, "tile done");
    }
    Ok(moved)
}

/// Aborts the ring if the owning stage unwinds, so peers blocked on a slot
/// flag wake up instead of waiting for a handoff that never comes
struct AbortOnPanic<'a> {
    ring: &'a StagingRing,
    stage: &'static str,
}

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.ring.abort(&format!("{} panicked", self.stage));
        }
    }
}

fn abort_on_error<T>(ring: &StagingRing, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        ring.abort(&err.to_string());
    }
    result
}

/// First error that is not a peer's abort, else the first error
fn root_cause(results: [Result<()>; 3]) -> Result<()> {
    let mut first = None;
    for result in results {
        match result {
            Ok(()) => {},
            Err(err @ ConcatError::PipelineAborted { .. }) => {
                first.get_or_insert(err);
            },
            Err(err) => return Err(err),
        }
    }
    first.map_or(Ok(()), Err)
}

fn run_overlapped(
    ctx: &StageContext<'_, '_>,
    jobs: &[TileJob],
    ring: &StagingRing,
    repacker: &mut Repacker,
) -> Result<Moved> {
    let worker = ctx.worker;
    let panicked = |stage: &str| ConcatError::PipelineAborted {
        worker,
        reason: format!("{stage} thread panicked"),
    };
    std::thread::scope(|s| {
        let inbound = s.spawn(|| {
            let _abort = AbortOnPanic { ring, stage: "stage-in" };
            abort_on_error(ring, stage_in_all(ctx, jobs, ring))
        });
        let outbound = s.spawn(|| {
            let _abort = AbortOnPanic { ring, stage: "stage-out" };
            abort_on_error(ring, stage_out_all(ctx, jobs, ring))
        });
        let repacked = {
            let _abort = AbortOnPanic { ring, stage: "repack" };
            abort_on_error(ring, repack_all(jobs, ring, repacker))
        };

        let inbound = inbound.join().unwrap_or_else(|_| {
            ring.abort("stage-in panicked");
            Err(panicked("stage-in"))
        });
        let outbound = outbound.join().unwrap_or_else(|_| {
            ring.abort("stage-out panicked");
            Err(panicked("stage-out"))
        });

        let mut moved = Moved::default();
        let inbound = inbound.map(|n| moved.bytes_in = n);
        let outbound = outbound.map(|n| moved.bytes_out = n);
        if let Err(err) = root_cause([inbound, repacked, outbound]) {
            tracing::warn!(worker, error = %err, "pipeline aborted");
            return Err(err);
        }
        Ok(moved)
    })
}

// ============================================================================
// Entry points
// ============================================================================

/// Kernel entry: run worker `worker_id` of a validated plan
///
/// A worker past the plan's worker count owns nothing and returns an idle
/// report immediately. [`launch`] is the safe way to run every worker.
///
/// ```compile_fail,E0133
/// use concatenar::{run_worker, EngineConfig, OutputRegion, SegmentTable, TilingPlan};
///
/// fn race(t: &SegmentTable<'_>, out: &OutputRegion<'_>, plan: &TilingPlan, c: &EngineConfig) {
///     let _ = run_worker(t, out, plan, c, 0);
/// }
/// ```
///
/// # Safety
///
/// The output region of `worker_id` must not be accessed by anyone else
/// while the call runs. This holds when `plan` passed
/// [`TilingPlan::validate`] for `table`, and concurrent calls sharing
/// `output` use distinct worker ids of that same plan.
///
/// # Errors
///
/// Returns `PlanMismatch` if `table` or `output` do not have the plan's
/// geometry, `CapacityExceeded` if a tile does not fit a slot, or a
/// pipeline failure
pub unsafe fn run_worker(
    table: &SegmentTable<'_>,
    output: &OutputRegion<'_>,
    plan: &TilingPlan,
    config: &EngineConfig,
    worker_id: usize,
) -> Result<WorkerStats> {
    let planner = TilePlanner::new(plan);
    let Some(tiling) = planner.assign(worker_id)? else {
        tracing::debug!(
            worker = worker_id,
            workers = plan.worker_count,
            "worker owns no output"
        );
        return Ok(WorkerStats::idle(worker_id));
    };
    if table.width() != plan.element_width
        || output.rows() != plan.rows
        || output.cols() != plan.total_axis_len
    {
        return Err(ConcatError::mismatch(format!(
            "worker {worker_id}: inputs or output do not match the plan geometry"
        )));
    }

    let span = tracing::debug_span!(
        "worker",
        worker = worker_id,
        row_band = tiling.row_band,
        col_band = tiling.col_band
    );
    let _guard = span.enter();

    let per_block = plan.element_width.per_block(config.device.block_bytes);
    let schedule = build_schedule(table, plan, &tiling, config)?;
    check_capacity(&schedule.jobs, plan.slot_elements, per_block)?;

    let ctx = StageContext {
        worker: worker_id,
        table,
        output,
        region: tiling.region,
        per_block,
    };
    let mut ring = StagingRing::new(worker_id, plan.slot_elements * plan.element_width.bytes());
    let mut repacker = Repacker::new(plan.element_width, config.device.vector_bytes);
    let overlapped = config.overlap_transfers && schedule.jobs.len() > 1;
    let moved = if overlapped {
        run_overlapped(&ctx, &schedule.jobs, &ring, &mut repacker)?
    } else {
        run_sequential(&ctx, &schedule.jobs, &mut ring, &mut repacker)?
    };

    let stats = WorkerStats {
        worker_id,
        idle: false,
        tiles: schedule.jobs.len(),
        skipped_tiles: schedule.skipped,
        bytes_in: moved.bytes_in,
        bytes_out: moved.bytes_out,
        cursor_steps: schedule.cursor_steps,
        index_generations: repacker.cache().generated(),
        strategies: repacker.counts(),
        overlapped,
    };
    tracing::debug!(
        tiles = stats.tiles,
        bytes_out = stats.bytes_out,
        cursor_steps = stats.cursor_steps,
        "worker finished"
    );
    Ok(stats)
}

/// Run every worker of `plan` and wait for all of them
///
/// `block_dim` is the number of workers launched; it may exceed the plan's
/// worker count, in which case the extra workers no-op. The table is viewed
/// at the plan's element width before validation.
///
/// # Errors
///
/// Returns the first worker's error; configuration errors are reported
/// before any worker starts
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(segments = table.len(), rows = table.rows(), workers = plan.worker_count, block_dim = block_dim)
)]
pub fn launch(
    table: &SegmentTable<'_>,
    output: &mut [u8],
    plan: &TilingPlan,
    config: &EngineConfig,
    block_dim: usize,
) -> Result<LaunchReport> {
    config.validate()?;
    let table = table.reinterpret(plan.element_width)?;
    plan.validate(&table, config)?;
    let region = OutputRegion::new(output, plan.rows, plan.total_axis_len, plan.element_width)?;

    let workers = (0..block_dim)
        .into_par_iter()
        // SAFETY: the plan is validated above and each worker index runs
        // once, so worker regions are disjoint.
        .map(|worker| unsafe { run_worker(&table, &region, plan, config, worker) })
        .collect::<Result<Vec<_>>>()?;

    let report = LaunchReport { block_dim, workers };
    tracing::debug!(
        active = report.active_workers(),
        tiles = report.total_tiles(),
        bytes_out = report.bytes_out(),
        "launch complete"
    );
    Ok(report)
}

/// Plan and launch in one call, writing into `output`
///
/// # Errors
///
/// Propagates planning and launch failures
pub fn concat(
    table: &SegmentTable<'_>,
    output: &mut [u8],
    config: &EngineConfig,
) -> Result<LaunchReport> {
    let plan = TilingPlanner::new(config).plan(table)?;
    launch(table, output, &plan, config, plan.worker_count)
}

/// Plan and launch into a freshly allocated buffer
///
/// # Errors
///
/// Propagates planning and launch failures
pub fn concat_to_vec(
    table: &SegmentTable<'_>,
    config: &EngineConfig,
) -> Result<(Vec<u8>, LaunchReport)> {
    let bytes = table.rows() * table.total_axis_len() * table.width().bytes();
    let mut output = vec![0u8; bytes];
    let report = concat(table, &mut output, config)?;
    Ok((output, report))
}
