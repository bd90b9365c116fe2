//! Staged batch processing.
//!
//! A stage is a chain of steps sharing one [`StageControl`]. Batches enter
//! the first step tagged with consecutive tickets and each step passes them
//! on in that same order. The [`ForkedProcessorStep`] spreads the work of
//! every batch over a resizable set of processor slots; the [`DeadEndStep`]
//! terminates a chain.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use batchstage_core::staging::{DeadEndStep, ForkedProcessorStep, Stage, StageControl, Step};
//!
//! let control = Arc::new(StageControl::new("nodes"));
//! let mut stage = Stage::new(Arc::clone(&control), Duration::from_millis(10));
//!
//! let processor = stage.add(Arc::new(ForkedProcessorStep::new(
//!     Arc::clone(&control),
//!     "ENCODE",
//!     &config.staging,
//!     |slot: usize, processors: usize, batch: &Vec<u64>| -> anyhow::Result<()> {
//!         for id in batch.iter().filter(|id| **id as usize % processors == slot) {
//!             // work on the part of the batch this slot owns
//!         }
//!         Ok(())
//!     },
//! )));
//! let end = stage.add(Arc::new(DeadEndStep::new(Arc::clone(&control), "END")));
//! processor.set_downstream(end);
//!
//! let execution = stage.execute().await?;
//! for (ticket, batch) in batches.into_iter().enumerate() {
//!     processor.receive(ticket as u64, batch).await?;
//! }
//! processor.end_of_upstream().await;
//! execution.await_completion().await?;
//! ```

mod control;
mod dead_end;
mod forked;
mod stage;
mod step;
mod types;

pub use control::StageControl;
pub use dead_end::DeadEndStep;
pub use forked::{ForkedProcess, ForkedProcessorStep};
pub use stage::{Stage, StageExecution, StageStats};
pub use step::{OrderingGuarantees, Step, StepControl, StepStats, TicketSequence};
pub use types::{PanicCause, StageError, StepError, StepState, Ticket};
