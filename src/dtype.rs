//! Element widths
//!
//! The engine moves raw bytes; the only thing it needs to know about an
//! element type is its width. The width decides how many elements make one
//! transfer block and which index type the vector repack strategies use.

use serde::{Deserialize, Serialize};

use crate::error::{ConcatError, Result};

/// Byte width of one tensor element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementWidth {
    /// 1-byte elements (int8, uint8, bool)
    B8,
    /// 2-byte elements (f16, bf16, int16)
    B16,
    /// 4-byte elements (f32, int32)
    B32,
    /// 8-byte elements (f64, int64)
    B64,
}

impl ElementWidth {
    /// Width from a byte count
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedElementWidth` for anything but 1, 2, 4 or 8
    pub fn from_bytes(bytes: usize) -> Result<Self> {
        match bytes {
            1 => Ok(Self::B8),
            2 => Ok(Self::B16),
            4 => Ok(Self::B32),
            8 => Ok(Self::B64),
            other => Err(ConcatError::UnsupportedElementWidth(other)),
        }
    }

    /// Bytes per element
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::B8 => 1,
            Self::B16 => 2,
            Self::B32 => 4,
            Self::B64 => 8,
        }
    }

    /// Elements per transfer block
    #[must_use]
    pub const fn per_block(self, block_bytes: usize) -> usize {
        block_bytes / self.bytes()
    }

    /// Index type used by vector scatter and gather for this width
    #[must_use]
    pub const fn index_width(self) -> IndexWidth {
        match self {
            Self::B8 | Self::B16 => IndexWidth::U16,
            Self::B32 | Self::B64 => IndexWidth::U32,
        }
    }

    /// Vector lanes for one register of `vector_bytes`, counted in index
    /// elements
    #[must_use]
    pub const fn lanes(self, vector_bytes: usize) -> usize {
        vector_bytes / self.index_width().bytes()
    }
}

/// Index element type for per-lane index vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexWidth {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexWidth {
    /// Bytes per index
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Largest index value representable
    #[must_use]
    pub const fn max_index(self) -> usize {
        match self {
            Self::U16 => u16::MAX as usize,
            Self::U32 => u32::MAX as usize,
        }
    }
}

/// Pick the width to process segments at
///
/// Narrower elements can be moved together as one wider element when every
/// length is divisible by the ratio, and wide elements can be split. The
/// result is the width the repack should use; `lengths` are in elements of
/// `width` and `strides` are row strides in the same unit.
///
/// - 8-byte elements not all block-aligned move as pairs of 4-byte elements
///   (wide indices are not needed and lanes double).
/// - 1-byte elements move as 2-byte elements when every length and stride is
///   even.
#[must_use]
pub fn lowered_width(
    width: ElementWidth,
    lengths: &[usize],
    strides: &[usize],
    block_bytes: usize,
) -> ElementWidth {
    match width {
        ElementWidth::B64 => {
            let per_block = width.per_block(block_bytes);
            let aligned = lengths.iter().all(|len| len % per_block == 0);
            if aligned {
                ElementWidth::B64
            } else {
                ElementWidth::B32
            }
        },
        ElementWidth::B8 => {
            let even = lengths.iter().chain(strides).all(|n| n % 2 == 0);
            if even && !lengths.is_empty() {
                ElementWidth::B16
            } else {
                ElementWidth::B8
            }
        },
        other => other,
    }
}
