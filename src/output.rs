//! Output region shared by all workers
//!
//! The output is one `rows × total_axis_len` buffer. Workers write to it
//! concurrently, each inside its own sub-rectangle. Writing is `unsafe`:
//! the bounds are checked, but disjointness between concurrent writers is the
//! caller's contract. [`crate::launch`] upholds it by validating the plan and
//! running each worker index once.

use std::marker::PhantomData;

use crate::dtype::ElementWidth;
use crate::error::{ConcatError, Result};
use crate::plan::Region;

/// Shared, row-addressable view of the output buffer
#[derive(Debug)]
pub struct OutputRegion<'a> {
    ptr: *mut u8,
    len: usize,
    rows: usize,
    cols: usize,
    width: ElementWidth,
    _marker: PhantomData<&'a mut [u8]>,
}

// SAFETY: `OutputRegion` hands out no references. Every write goes through
// the `unsafe` `write_rows`, whose callers guarantee concurrent writes are
// disjoint.
unsafe impl Send for OutputRegion<'_> {}
// SAFETY: see above.
unsafe impl Sync for OutputRegion<'_> {}

impl<'a> OutputRegion<'a> {
    /// Wrap an output buffer of `rows × cols` elements
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the buffer length is not exactly
    /// `rows * cols * width`
    pub fn new(buffer: &'a mut [u8], rows: usize, cols: usize, width: ElementWidth) -> Result<Self> {
        let expected = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(width.bytes()))
            .ok_or_else(|| ConcatError::shape("output size overflows"))?;
        if buffer.len() != expected {
            return Err(ConcatError::shape(format!(
                "output buffer has {} bytes, expected {expected} for {rows}x{cols}",
                buffer.len()
            )));
        }
        Ok(Self {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            rows,
            cols,
            width,
            _marker: PhantomData,
        })
    }

    /// Output rows
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Output columns
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The whole output as a region
    #[must_use]
    pub fn bounds(&self) -> Region {
        Region {
            row_offset: 0,
            rows: self.rows,
            col_offset: 0,
            cols: self.cols,
        }
    }

    /// Copy `rows × cols` elements from `src` (rows `src_stride` elements
    /// apart) to the output at `(row, col)`
    ///
    /// Writes outside `region` are rejected.
    ///
    /// ```compile_fail,E0133
    /// use concatenar::{ElementWidth, OutputRegion};
    ///
    /// let mut buf = [0u8; 4];
    /// let out = OutputRegion::new(&mut buf, 1, 4, ElementWidth::B8).unwrap();
    /// out.write_rows(&out.bounds(), 0, 0, 1, 4, &[1, 2, 3, 4], 4).unwrap();
    /// ```
    ///
    /// # Safety
    ///
    /// No other thread may write to `region`, or read or write an
    /// overlapping region of this output, while the call runs. A region
    /// obtained from one worker of a validated [`crate::TilingPlan`] is
    /// disjoint from every other worker's.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the block leaves `region`, the output, or
    /// `src`
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write_rows(
        &self,
        region: &Region,
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
        src: &[u8],
        src_stride: usize,
    ) -> Result<()> {
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        let inside = row >= region.row_offset
            && row + rows <= region.row_offset + region.rows
            && col >= region.col_offset
            && col + cols <= region.col_offset + region.cols
            && row + rows <= self.rows
            && col + cols <= self.cols;
        if !inside {
            return Err(ConcatError::shape(format!(
                "write of {rows}x{cols} at ({row}, {col}) leaves region {region:?}"
            )));
        }
        let w = self.width.bytes();
        let run = cols * w;
        if src_stride < cols || ((rows - 1) * src_stride + cols) * w > src.len() {
            return Err(ConcatError::shape(format!(
                "source of {} bytes too short for {rows}x{cols} at stride {src_stride}",
                src.len()
            )));
        }
        for r in 0..rows {
            let dst = ((row + r) * self.cols + col) * w;
            let from = r * src_stride * w;
            debug_assert!(dst + run <= self.len);
            // SAFETY: `dst + run <= len` because the block lies inside the
            // output (checked above), and `ptr` is valid for `len` bytes for
            // `'a`. The source slice is a separate allocation. The caller
            // guarantees no concurrent access to `region`, which holds this
            // range.
            unsafe {
                std::ptr::copy_nonoverlapping(src[from..from + run].as_ptr(), self.ptr.add(dst), run);
            }
        }
        Ok(())
    }
}
