//! Segment Table
//!
//! Every input tensor is viewed as a 2-D block `rows × axis_len`, where
//! `axis_len` folds the concat axis with all dimensions after it. The table
//! holds read-only references to the segments' bytes and answers two
//! questions for the rest of the engine: how long is segment `i` along the
//! axis, and where do the bytes for `(row, column)` of segment `i` live.
//!
//! ## Contents
//!
//! - [`fold_shape`] - N-D shape to `(rows, axis_len)`
//! - [`Segment`] - one input's 2-D view
//! - [`SegmentTable`] - the ordered, shared list of segments
//! - [`SegmentLengths`] - length lookup used by the boundary resolver

use crate::dtype::ElementWidth;
use crate::error::{ConcatError, Result};

/// Segment lengths held inline in the table, skipping the descriptor fetch
pub const PRELOADED_SEGMENTS: usize = 2;

/// Axis-length lookup over an ordered list of segments
///
/// Implemented by [`SegmentTable`] and by plain length slices, so the
/// resolver can be driven without any tensor data.
pub trait SegmentLengths {
    /// Number of segments
    fn segment_count(&self) -> usize;

    /// Axis length of segment `index`
    ///
    /// # Errors
    ///
    /// Returns `SegmentOutOfRange` if `index >= segment_count()`
    fn axis_len(&self, index: usize) -> Result<usize>;
}

impl SegmentLengths for [usize] {
    fn segment_count(&self) -> usize {
        self.len()
    }

    fn axis_len(&self, index: usize) -> Result<usize> {
        self.get(index)
            .copied()
            .ok_or(ConcatError::SegmentOutOfRange {
                index,
                count: self.len(),
            })
    }
}

impl SegmentLengths for Vec<usize> {
    fn segment_count(&self) -> usize {
        self.len()
    }

    fn axis_len(&self, index: usize) -> Result<usize> {
        self.as_slice().axis_len(index)
    }
}

/// Collapse a shape into the `(rows, axis_len)` view used for concatenation
///
/// `rows` is the product of dimensions before `axis`; `axis_len` is the
/// product of `axis` and everything after it.
///
/// # Errors
///
/// Returns `InvalidShape` if `axis` is out of bounds or the element count
/// overflows `usize`
pub fn fold_shape(shape: &[usize], axis: usize) -> Result<(usize, usize)> {
    if axis >= shape.len() {
        return Err(ConcatError::shape(format!(
            "concat axis {axis} out of bounds for rank {}",
            shape.len()
        )));
    }
    let product = |dims: &[usize]| {
        dims.iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| ConcatError::shape(format!("element count of {shape:?} overflows")))
    };
    let rows = product(&shape[..axis])?;
    let axis_len = product(&shape[axis..])?;
    // Guard the total too
    rows.checked_mul(axis_len)
        .ok_or_else(|| ConcatError::shape(format!("element count of {shape:?} overflows")))?;
    Ok((rows, axis_len))
}

/// One input tensor's 2-D view
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    data: &'a [u8],
    rows: usize,
    axis_len: usize,
    row_stride: usize,
}

impl<'a> Segment<'a> {
    /// Contiguous segment: rows are `axis_len` elements apart
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `data` is too short
    pub fn new(data: &'a [u8], rows: usize, axis_len: usize, width: ElementWidth) -> Result<Self> {
        Self::strided(data, rows, axis_len, axis_len, width)
    }

    /// Segment whose rows are `row_stride` elements apart
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `row_stride < axis_len` or `data` does not
    /// cover the last row
    pub fn strided(
        data: &'a [u8],
        rows: usize,
        axis_len: usize,
        row_stride: usize,
        width: ElementWidth,
    ) -> Result<Self> {
        if row_stride < axis_len {
            return Err(ConcatError::shape(format!(
                "row stride {row_stride} shorter than axis length {axis_len}"
            )));
        }
        let needed = if rows == 0 || axis_len == 0 {
            0
        } else {
            (rows - 1)
                .checked_mul(row_stride)
                .and_then(|n| n.checked_add(axis_len))
                .and_then(|n| n.checked_mul(width.bytes()))
                .ok_or_else(|| ConcatError::shape("segment byte size overflows"))?
        };
        if data.len() < needed {
            return Err(ConcatError::shape(format!(
                "segment has {} bytes, needs {needed} for {rows}x{axis_len} (stride {row_stride})",
                data.len()
            )));
        }
        Ok(Self {
            data,
            rows,
            axis_len,
            row_stride,
        })
    }

    /// Segment from an N-D shape and concat axis
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on a bad axis or short buffer
    pub fn from_shape(
        data: &'a [u8],
        shape: &[usize],
        axis: usize,
        width: ElementWidth,
    ) -> Result<Self> {
        let (rows, axis_len) = fold_shape(shape, axis)?;
        Self::new(data, rows, axis_len, width)
    }

    /// Rows in the 2-D view
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Elements along the concat axis
    #[must_use]
    pub fn axis_len(&self) -> usize {
        self.axis_len
    }

    /// Elements between consecutive rows
    #[must_use]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    /// Raw bytes
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Ordered, read-only list of segments shared by all workers
#[derive(Debug, Clone)]
pub struct SegmentTable<'a> {
    segments: Vec<Segment<'a>>,
    width: ElementWidth,
    rows: usize,
    total_axis_len: usize,
    preloaded: [usize; PRELOADED_SEGMENTS],
}

impl<'a> SegmentTable<'a> {
    /// Build a table
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the segments disagree on row count, or if
    /// the list is empty
    pub fn new(segments: Vec<Segment<'a>>, width: ElementWidth) -> Result<Self> {
        let first = segments
            .first()
            .ok_or_else(|| ConcatError::shape("concat needs at least one segment"))?;
        let rows = first.rows;
        if let Some((i, seg)) = segments.iter().enumerate().find(|(_, s)| s.rows != rows) {
            return Err(ConcatError::shape(format!(
                "segment {i} has {} rows, segment 0 has {rows}",
                seg.rows
            )));
        }
        let total_axis_len = segments
            .iter()
            .try_fold(0usize, |acc, s| acc.checked_add(s.axis_len))
            .ok_or_else(|| ConcatError::shape("total axis length overflows"))?;

        let mut preloaded = [0; PRELOADED_SEGMENTS];
        for (slot, seg) in preloaded.iter_mut().zip(&segments) {
            *slot = seg.axis_len;
        }

        Ok(Self {
            segments,
            width,
            rows,
            total_axis_len,
            preloaded,
        })
    }

    /// Contiguous segments from N-D shapes sharing everything but `axis`
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on mismatched ranks or dimensions
    pub fn from_shapes(
        inputs: &[(&'a [u8], &[usize])],
        axis: usize,
        width: ElementWidth,
    ) -> Result<Self> {
        let Some((_, reference)) = inputs.first() else {
            return Err(ConcatError::shape("concat needs at least one segment"));
        };
        let mut segments = Vec::with_capacity(inputs.len());
        for (i, (data, shape)) in inputs.iter().enumerate() {
            let same_rank = shape.len() == reference.len();
            let same_dims = same_rank
                && shape
                    .iter()
                    .zip(reference.iter())
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !same_dims {
                return Err(ConcatError::shape(format!(
                    "input {i} shape {shape:?} incompatible with {reference:?} on axis {axis}"
                )));
            }
            segments.push(Segment::from_shape(data, shape, axis, width)?);
        }
        Self::new(segments, width)
    }

    /// Number of segments
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the table has no segments (never true for a built table)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Element width
    #[must_use]
    pub fn width(&self) -> ElementWidth {
        self.width
    }

    /// Shared row count
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Sum of all axis lengths
    #[must_use]
    pub fn total_axis_len(&self) -> usize {
        self.total_axis_len
    }

    /// Whether the concatenation produces no elements
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.rows == 0 || self.total_axis_len == 0
    }

    /// Axis length of segment `index`
    ///
    /// # Errors
    ///
    /// Returns `SegmentOutOfRange` past the end of the table
    #[inline]
    pub fn length(&self, index: usize) -> Result<usize> {
        if index < PRELOADED_SEGMENTS && index < self.segments.len() {
            return Ok(self.preloaded[index]);
        }
        self.segment(index).map(|seg| seg.axis_len)
    }

    /// Segment `index`
    ///
    /// # Errors
    ///
    /// Returns `SegmentOutOfRange` past the end of the table
    pub fn segment(&self, index: usize) -> Result<&Segment<'a>> {
        self.segments
            .get(index)
            .ok_or(ConcatError::SegmentOutOfRange {
                index,
                count: self.segments.len(),
            })
    }

    /// All segments in order
    #[must_use]
    pub fn segments(&self) -> &[Segment<'a>] {
        &self.segments
    }

    /// Axis lengths of every segment
    #[must_use]
    pub fn lengths(&self) -> Vec<usize> {
        self.segments.iter().map(|s| s.axis_len).collect()
    }

    /// Byte offset of element `(row, col)` inside segment `index`
    ///
    /// # Errors
    ///
    /// Returns `SegmentOutOfRange` for a bad index, or `InvalidShape` if
    /// `(row, col)` is outside the segment
    pub fn source_offset(&self, index: usize, row: usize, col: usize) -> Result<usize> {
        let seg = self.segment(index)?;
        if row >= seg.rows || col > seg.axis_len {
            return Err(ConcatError::shape(format!(
                "element ({row}, {col}) outside segment {index} of {}x{}",
                seg.rows, seg.axis_len
            )));
        }
        Ok((row * seg.row_stride + col) * self.width.bytes())
    }

    /// Bytes for `cols` elements of segment `index` starting at `(row, col)`
    ///
    /// # Errors
    ///
    /// Returns an error if the run leaves the segment's row
    pub fn source(&self, index: usize, row: usize, col: usize, cols: usize) -> Result<&'a [u8]> {
        if cols == 0 {
            return Ok(&[]);
        }
        let start = self.source_offset(index, row, col)?;
        let seg = self.segment(index)?;
        if col + cols > seg.axis_len {
            return Err(ConcatError::shape(format!(
                "run of {cols} from column {col} leaves segment {index} (axis length {})",
                seg.axis_len
            )));
        }
        let end = start + cols * self.width.bytes();
        Ok(&seg.data[start..end])
    }

    /// Same bytes seen at another element width
    ///
    /// Lengths and strides are rescaled by the width ratio.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if rescaling to a wider element leaves a
    /// remainder
    pub fn reinterpret(&self, width: ElementWidth) -> Result<Self> {
        if width == self.width {
            return Ok(self.clone());
        }
        let from = self.width.bytes();
        let to = width.bytes();
        let rescale = |n: usize| -> Result<usize> {
            let bytes = n * from;
            if bytes % to == 0 {
                Ok(bytes / to)
            } else {
                Err(ConcatError::shape(format!(
                    "{n} elements of {from} bytes do not divide into {to}-byte elements"
                )))
            }
        };
        let segments = self
            .segments
            .iter()
            .map(|seg| {
                Segment::strided(
                    seg.data,
                    seg.rows,
                    rescale(seg.axis_len)?,
                    rescale(seg.row_stride)?,
                    width,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(segments, width)
    }
}

impl SegmentLengths for SegmentTable<'_> {
    fn segment_count(&self) -> usize {
        self.len()
    }

    fn axis_len(&self, index: usize) -> Result<usize> {
        self.length(index)
    }
}
