//! Seeded segment generators
//!
//! Deterministic: the same seed always yields the same lengths, strides and
//! bytes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dtype::ElementWidth;
use crate::error::Result;
use crate::segment::{Segment, SegmentTable};

/// Shape of one generated segment, in elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Length along the concatenation axis
    pub axis_len: usize,
    /// Distance between rows (`>= axis_len`)
    pub row_stride: usize,
}

/// Owned input buffers for one concatenation
#[derive(Debug, Clone)]
pub struct ConcatFixture {
    /// Rows shared by all segments
    pub rows: usize,
    /// Element width
    pub width: ElementWidth,
    /// Segment shapes
    pub specs: Vec<SegmentSpec>,
    /// Segment bytes, one buffer per segment
    pub buffers: Vec<Vec<u8>>,
}

impl ConcatFixture {
    /// Borrow the buffers as a segment table
    ///
    /// # Errors
    ///
    /// Propagates table construction errors
    pub fn table(&self) -> Result<SegmentTable<'_>> {
        let segments = self
            .specs
            .iter()
            .zip(&self.buffers)
            .map(|(spec, buf)| {
                Segment::strided(buf, self.rows, spec.axis_len, spec.row_stride, self.width)
            })
            .collect::<Result<Vec<_>>>()?;
        SegmentTable::new(segments, self.width)
    }

    /// Segment lengths
    #[must_use]
    pub fn lengths(&self) -> Vec<usize> {
        self.specs.iter().map(|s| s.axis_len).collect()
    }

    /// Output size in bytes
    #[must_use]
    pub fn output_bytes(&self) -> usize {
        self.rows * self.specs.iter().map(|s| s.axis_len).sum::<usize>() * self.width.bytes()
    }
}

/// Deterministic fixture generator
///
/// # Example
///
/// ```rust
/// use concatenar::dtype::ElementWidth;
/// use concatenar::testing::FixtureGenerator;
///
/// let fixture = FixtureGenerator::new(42).generate(4, &[3, 0, 5], ElementWidth::B32);
/// assert_eq!(fixture.output_bytes(), 4 * 8 * 4);
/// ```
#[derive(Debug, Clone)]
pub struct FixtureGenerator {
    seed: u64,
    max_padding: usize,
}

impl FixtureGenerator {
    /// Generator with a specific seed and contiguous rows
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_padding: 0,
        }
    }

    /// Pad each row by up to `max_padding` elements
    #[must_use]
    pub fn with_row_padding(mut self, max_padding: usize) -> Self {
        self.max_padding = max_padding;
        self
    }

    /// Fixture with the given lengths and random bytes
    #[must_use]
    pub fn generate(&self, rows: usize, lengths: &[usize], width: ElementWidth) -> ConcatFixture {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let specs = lengths
            .iter()
            .map(|&axis_len| SegmentSpec {
                axis_len,
                row_stride: axis_len + self.padding(&mut rng),
            })
            .collect();
        Self::fill(&mut rng, rows, specs, width)
    }

    /// Fixture with up to `max_segments` segments of up to `max_len`
    /// elements (zero lengths included) and `1..=max_rows` rows
    #[must_use]
    pub fn random(
        &self,
        max_rows: usize,
        max_segments: usize,
        max_len: usize,
        width: ElementWidth,
    ) -> ConcatFixture {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let rows = rng.gen_range(1..=max_rows.max(1));
        let count = rng.gen_range(1..=max_segments.max(1));
        let specs = (0..count)
            .map(|_| {
                let axis_len = rng.gen_range(0..=max_len);
                SegmentSpec {
                    axis_len,
                    row_stride: axis_len + self.padding(&mut rng),
                }
            })
            .collect();
        Self::fill(&mut rng, rows, specs, width)
    }

    fn padding(&self, rng: &mut StdRng) -> usize {
        if self.max_padding == 0 {
            0
        } else {
            rng.gen_range(0..=self.max_padding)
        }
    }

    fn fill(
        rng: &mut StdRng,
        rows: usize,
        specs: Vec<SegmentSpec>,
        width: ElementWidth,
    ) -> ConcatFixture {
        let buffers = specs
            .iter()
            .map(|spec| {
                let elements = rows * spec.row_stride;
                (0..elements * width.bytes()).map(|_| rng.gen::<u8>()).collect()
            })
            .collect();
        ConcatFixture {
            rows,
            width,
            specs,
            buffers,
        }
    }
}
