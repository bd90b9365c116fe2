//! Downstream step that records what it receives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::staging::{
    OrderingGuarantees, PanicCause, Step, StepControl, StepError, StepState, StepStats, Ticket,
};

use super::SlotMarks;

/// Records tickets in arrival order and checks every batch was fully
/// processed.
///
/// Never fails a `receive`, so tests can inspect violations afterwards.
#[derive(Debug, Default)]
pub struct TrackingStep {
    tickets: Mutex<Vec<Ticket>>,
    incomplete: AtomicU64,
    ended: AtomicBool,
    panicked: AtomicBool,
}

impl TrackingStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tickets received, in arrival order.
    pub fn tickets(&self) -> Vec<Ticket> {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of batches received.
    pub fn received(&self) -> usize {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Batches that arrived with at least one slot missing.
    pub fn incomplete_batches(&self) -> u64 {
        self.incomplete.load(Ordering::SeqCst)
    }

    /// Whether the received tickets are consecutive and increasing.
    pub fn in_order(&self) -> bool {
        self.tickets().windows(2).all(|pair| pair[1] == pair[0] + 1)
    }

    /// Whether end of upstream was signalled.
    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepControl for TrackingStep {
    fn name(&self) -> &str {
        "TRACKING"
    }

    async fn start(&self, _ordering: OrderingGuarantees) -> Result<(), StepError> {
        Ok(())
    }

    async fn end_of_upstream(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    fn is_completed(&self) -> bool {
        self.ended() || self.panicked.load(Ordering::SeqCst)
    }

    fn receive_panic(&self, _cause: &PanicCause) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    fn stats(&self) -> StepStats {
        let state = if self.panicked.load(Ordering::SeqCst) {
            StepState::Aborted
        } else if self.ended() {
            StepState::Completed
        } else {
            StepState::Running
        };
        let received = self.received() as u64;
        StepStats {
            received_batches: received,
            done_batches: received,
            ..StepStats::new("TRACKING", state)
        }
    }

    async fn close(&self) {}
}

#[async_trait]
impl Step<SlotMarks> for TrackingStep {
    async fn receive(&self, ticket: Ticket, batch: SlotMarks) -> Result<u64, StepError> {
        if !batch.is_complete() {
            self.incomplete.fetch_add(1, Ordering::SeqCst);
        }
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ticket);
        Ok(0)
    }
}
