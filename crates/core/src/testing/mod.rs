//! Testing utilities for staged processing.
//!
//! This module provides a recording downstream step and a batch type that
//! remembers which processor slots touched it, so tests can assert ordering
//! and coverage without real payloads.
//!
//! # Example
//!
//! ```rust,ignore
//! use batchstage_core::testing::{SlotMarks, TrackingStep};
//!
//! let downstream = Arc::new(TrackingStep::new());
//! processor.set_downstream(downstream.clone());
//!
//! processor.receive(1, SlotMarks::new(4)).await?;
//! processor.end_of_upstream().await;
//!
//! assert_eq!(downstream.tickets(), vec![1]);
//! assert_eq!(downstream.incomplete_batches(), 0);
//! ```

mod slot_marks;
mod tracking_step;

pub use slot_marks::SlotMarks;
pub use tracking_step::TrackingStep;
