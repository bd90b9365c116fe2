//! The step contract every pipeline stage member implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{PanicCause, StepError, StepState, Ticket};

/// Ordering guarantees established upstream of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingGuarantees(u32);

impl OrderingGuarantees {
    /// Nothing is known about upstream delivery order.
    pub const NONE: Self = Self(0);

    /// Batches are already delivered in ticket order.
    pub const ORDER_SEND_DOWNSTREAM: Self = Self(1);

    /// Whether all flags of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Lifecycle operations shared by all steps, independent of the batch type.
///
/// This is what a stage coordinator and [`super::StageControl`] hold on to.
#[async_trait]
pub trait StepControl: Send + Sync {
    /// Display name of the step.
    fn name(&self) -> &str;

    /// Initialise the step. The downstream must be wired before this.
    async fn start(&self, ordering: OrderingGuarantees) -> Result<(), StepError>;

    /// No further batches will be received. Returns once in-flight work has
    /// been drained (or the step was aborted).
    async fn end_of_upstream(&self);

    /// Non-blocking poll of the terminal state, aborted included.
    fn is_completed(&self) -> bool;

    /// Abort the step, discarding undelivered work.
    ///
    /// Must be callable concurrently with `receive`.
    fn receive_panic(&self, cause: &PanicCause);

    /// Point-in-time snapshot. Never fails.
    fn stats(&self) -> StepStats;

    /// Release resources. Safe to call repeatedly, after completion or panic.
    async fn close(&self);
}

/// A step that admits ticketed batches of type `T`.
#[async_trait]
pub trait Step<T: Send + 'static>: StepControl {
    /// Admit one batch. Tickets must be strictly consecutive.
    ///
    /// Returns the current backlog of the step. Awaits while the step is at
    /// capacity.
    async fn receive(&self, ticket: Ticket, batch: T) -> Result<u64, StepError>;
}

/// Verifies that tickets arrive strictly consecutive.
///
/// The first ticket seen becomes the base of the sequence.
#[derive(Debug, Clone, Default)]
pub struct TicketSequence {
    last: Option<Ticket>,
}

impl TicketSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `ticket` if it is the expected next one.
    pub fn check(&mut self, step: &str, ticket: Ticket) -> Result<(), StepError> {
        if let Some(last) = self.last {
            let Some(expected) = last.checked_add(1) else {
                return Err(StepError::TicketsExhausted {
                    step: step.to_string(),
                    actual: ticket,
                });
            };
            if expected != ticket {
                return Err(StepError::TicketOutOfOrder {
                    step: step.to_string(),
                    expected,
                    actual: ticket,
                });
            }
        }
        self.last = Some(ticket);
        Ok(())
    }

    /// The ticket expected next, if any ticket has been seen and the
    /// sequence is not exhausted.
    pub fn expected(&self) -> Option<Ticket> {
        self.last.and_then(|last| last.checked_add(1))
    }
}

/// Observability snapshot of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStats {
    /// Step name.
    pub name: String,
    /// Lifecycle state when the snapshot was taken.
    pub state: StepState,
    /// Batches admitted.
    pub received_batches: u64,
    /// Batches finished and passed on.
    pub done_batches: u64,
    /// Batches admitted but not yet passed on.
    pub in_flight: u64,
    /// Processor count applied to newly admitted batches.
    pub processors: usize,
    /// Upper bound for `processors`.
    pub max_processors: usize,
    /// Sum of per-batch processing time.
    pub total_processing_ms: u64,
    /// Mean per-batch processing time.
    pub avg_processing_ms: f64,
    /// Time spent handing batches to the downstream step.
    pub downstream_wait_ms: u64,
}

impl StepStats {
    /// Empty stats for a step in `state`.
    pub fn new(name: impl Into<String>, state: StepState) -> Self {
        Self {
            name: name.into(),
            state,
            received_batches: 0,
            done_batches: 0,
            in_flight: 0,
            processors: 1,
            max_processors: 1,
            total_processing_ms: 0,
            avg_processing_ms: 0.0,
            downstream_wait_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_flags() {
        let none = OrderingGuarantees::NONE;
        assert!(!none.contains(OrderingGuarantees::ORDER_SEND_DOWNSTREAM));
        assert!(none.contains(OrderingGuarantees::NONE));

        let ordered = none.with(OrderingGuarantees::ORDER_SEND_DOWNSTREAM);
        assert!(ordered.contains(OrderingGuarantees::ORDER_SEND_DOWNSTREAM));
    }

    #[test]
    fn test_sequence_accepts_any_base() {
        let mut sequence = TicketSequence::new();
        assert_eq!(sequence.expected(), None);
        sequence.check("step", 7).unwrap();
        sequence.check("step", 8).unwrap();
        assert_eq!(sequence.expected(), Some(9));
    }

    #[test]
    fn test_sequence_rejects_gap() {
        let mut sequence = TicketSequence::new();
        sequence.check("step", 0).unwrap();
        let err = sequence.check("step", 2).unwrap_err();
        assert!(matches!(
            err,
            StepError::TicketOutOfOrder {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        // A rejected ticket does not move the sequence.
        sequence.check("step", 1).unwrap();
    }

    #[test]
    fn test_sequence_rejects_duplicate() {
        let mut sequence = TicketSequence::new();
        sequence.check("step", 1).unwrap();
        assert!(sequence.check("step", 1).is_err());
    }

    #[test]
    fn test_sequence_exhausted_after_max_ticket() {
        let mut sequence = TicketSequence::new();
        sequence.check("step", u64::MAX - 1).unwrap();
        sequence.check("step", u64::MAX).unwrap();
        assert_eq!(sequence.expected(), None);

        let err = sequence.check("step", 0).unwrap_err();
        assert!(matches!(
            err,
            StepError::TicketsExhausted { actual: 0, .. }
        ));
    }

    #[test]
    fn test_stats_serialize() {
        let stats = StepStats::new("PROCESSOR", StepState::Running);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["name"], "PROCESSOR");
        assert_eq!(json["state"], "running");
        assert_eq!(json["done_batches"], 0);
    }
}
