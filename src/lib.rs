//! # Concatenar
//!
//! Axis concatenation of N tensors on a many-core vector device model.
//!
//! Every input is folded to a 2-D view `(rows, axis_len)`; the output is
//! `(rows, Σ axis_len)`. Concatenation is pure data movement: the elements
//! are never interpreted, only moved.
//!
//! ## Pipeline
//!
//! ```text
//! SegmentTable ──► TilingPlanner ──► TilingPlan ──► launch (P workers)
//!                                                      │
//!                    SegmentCursor ◄── TilePlanner ◄───┤ per worker
//!                          │                           │
//!                          ▼                           ▼
//!                   stage-in ──► repack ──► stage-out (two staging slots)
//! ```
//!
//! - [`segment`]: per-input lengths, rows and strides
//! - [`cursor`]: maps a column range onto segment fragments
//! - [`plan`] / [`planner`]: tile and worker geometry, validated up front
//! - [`repack`]: block copy, scatter and gather strategies
//! - [`staging`] / [`engine`]: the double-buffered pipeline and its launch
//!
//! ## Example
//!
//! ```rust
//! use concatenar::{concat_to_vec, ElementWidth, EngineConfig, Segment, SegmentTable};
//!
//! let a = [1u8, 2, 3, 4];
//! let b = [5u8, 6];
//! let table = SegmentTable::new(
//!     vec![
//!         Segment::new(&a, 2, 2, ElementWidth::B8).unwrap(),
//!         Segment::new(&b, 2, 1, ElementWidth::B8).unwrap(),
//!     ],
//!     ElementWidth::B8,
//! )
//! .unwrap();
//!
//! let (out, _report) = concat_to_vec(&table, &EngineConfig::default()).unwrap();
//! assert_eq!(out, vec![1, 2, 5, 3, 4, 6]);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)] // index vectors are range-checked before narrowing
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::similar_names)]

pub mod config;
pub mod cursor;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod output;
pub mod plan;
pub mod planner;
pub mod repack;
pub mod segment;
pub mod staging;
pub mod testing;

pub use config::{DeviceConfig, EngineConfig};
pub use cursor::{Position, SegmentCursor, SplitInfo};
pub use dtype::ElementWidth;
pub use engine::{concat, concat_to_vec, launch, run_worker, LaunchReport, WorkerStats};
pub use error::{ConcatError, Result};
pub use output::OutputRegion;
pub use plan::{TilePlanner, TilingPlan};
pub use planner::TilingPlanner;
pub use segment::{Segment, SegmentTable};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
