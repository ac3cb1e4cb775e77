//! Error types for concatenar
//!
//! Errors fall into three groups:
//!
//! - **Configuration**: the inputs or the tiling plan are inconsistent with
//!   each other. Unrecoverable; the whole launch aborts.
//! - **Capacity**: a staging tile or index vector would not fit the device.
//!   A planner contract violation, also fatal.
//! - **Pipeline**: a stage of the overlapped pipeline failed and its peers
//!   unwound.
//!
//! Degenerate inputs (empty segments, empty tail tiles, idle workers) are not
//! errors and never reach this module.

use thiserror::Error;

/// Result type alias for concatenar operations
pub type Result<T> = std::result::Result<T, ConcatError>;

/// Error type for all concatenar operations
#[derive(Error, Debug)]
pub enum ConcatError {
    /// Shape or buffer geometry does not describe a valid segment
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape problem
        reason: String,
    },

    /// Device or engine configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Segment lookup past the end of the table
    #[error("Segment index {index} out of range for table of {count} segments")]
    SegmentOutOfRange {
        /// Requested segment index
        index: usize,
        /// Number of segments in the table
        count: usize,
    },

    /// Tiling plan disagrees with the actual inputs
    #[error("Tiling plan does not match inputs: {reason}")]
    PlanMismatch {
        /// Which parameter disagreed
        reason: String,
    },

    /// Element width the engine cannot move
    #[error("Unsupported element width: {0} bytes")]
    UnsupportedElementWidth(usize),

    /// Staging tile or index vector larger than the device allows
    #[error("Capacity exceeded: need {needed}, have {capacity}")]
    CapacityExceeded {
        /// Elements (or index value) required
        needed: usize,
        /// Elements (or index value) available
        capacity: usize,
    },

    /// A pipeline stage failed and the worker unwound
    #[error("Pipeline aborted on worker {worker}: {reason}")]
    PipelineAborted {
        /// Worker whose pipeline aborted
        worker: usize,
        /// Failure reported by the first failing stage
        reason: String,
    },

    /// JSON configuration or plan could not be parsed
    #[error("Failed to parse: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ConcatError {
    /// Whether the error means the plan or inputs are wrong (as opposed to a
    /// capacity or pipeline failure)
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidShape { .. }
                | Self::InvalidConfiguration(_)
                | Self::SegmentOutOfRange { .. }
                | Self::PlanMismatch { .. }
                | Self::UnsupportedElementWidth(_)
                | Self::ConfigParse(_)
        )
    }

    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }

    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        Self::PlanMismatch {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_segment_out_of_range() {
        let err = ConcatError::SegmentOutOfRange { index: 7, count: 3 };
        assert_eq!(
            err.to_string(),
            "Segment index 7 out of range for table of 3 segments"
        );
    }

    #[test]
    fn test_error_display_capacity() {
        let err = ConcatError::CapacityExceeded {
            needed: 4096,
            capacity: 1024,
        };
        assert!(err.to_string().contains("need 4096"));
        assert!(err.to_string().contains("have 1024"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(ConcatError::shape("bad").is_configuration_error());
        assert!(ConcatError::mismatch("rows").is_configuration_error());
        assert!(ConcatError::InvalidConfiguration("x".into()).is_configuration_error());
        assert!(!ConcatError::CapacityExceeded {
            needed: 2,
            capacity: 1
        }
        .is_configuration_error());
        assert!(!ConcatError::PipelineAborted {
            worker: 0,
            reason: "stage-in".into()
        }
        .is_configuration_error());
    }

    #[test]
    fn test_from_serde_json_error() {
        let parse_err = serde_json::from_str::<u32>("not a number").expect_err("test");
        let err: ConcatError = parse_err.into();
        assert!(matches!(err, ConcatError::ConfigParse(_)));
        assert!(err.is_configuration_error());
    }
}
