//! Terminal step that sinks every batch it receives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::metrics;

use super::control::StageControl;
use super::step::{OrderingGuarantees, Step, StepControl, StepStats, TicketSequence};
use super::types::{PanicCause, StepError, StepState, Ticket};

/// End of a pipeline that needs no further processing.
pub struct DeadEndStep {
    name: String,
    control: Arc<StageControl>,
    ordering: RwLock<Option<OrderingGuarantees>>,
    sequence: Mutex<TicketSequence>,
    received: AtomicU64,
    state: RwLock<StepState>,
    abort_cause: OnceLock<PanicCause>,
}

impl DeadEndStep {
    pub fn new(control: Arc<StageControl>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            control,
            ordering: RwLock::new(None),
            sequence: Mutex::new(TicketSequence::new()),
            received: AtomicU64::new(0),
            state: RwLock::new(StepState::Created),
            abort_cause: OnceLock::new(),
        }
    }

    /// Batches sunk so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    fn state(&self) -> StepState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: StepState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !current.is_terminal() {
            *current = state;
        }
    }
}

#[async_trait]
impl StepControl for DeadEndStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, ordering: OrderingGuarantees) -> Result<(), StepError> {
        let mut current = self.ordering.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(StepError::AlreadyStarted(self.name.clone()));
        }
        *current = Some(ordering);
        self.set_state(StepState::Running);
        Ok(())
    }

    async fn end_of_upstream(&self) {
        self.set_state(StepState::Completed);
        info!(step = %self.name, batches = self.received(), "Step completed");
    }

    fn is_completed(&self) -> bool {
        self.state().is_terminal()
    }

    fn receive_panic(&self, cause: &PanicCause) {
        if self.abort_cause.set(Arc::clone(cause)).is_ok() {
            self.set_state(StepState::Aborted);
        }
    }

    fn stats(&self) -> StepStats {
        let received = self.received();
        StepStats {
            received_batches: received,
            done_batches: received,
            ..StepStats::new(self.name.clone(), self.state())
        }
    }

    async fn close(&self) {
        debug!(step = %self.name, "Step closed");
    }
}

#[async_trait]
impl<T: Send + 'static> Step<T> for DeadEndStep {
    async fn receive(&self, ticket: Ticket, batch: T) -> Result<u64, StepError> {
        self.control.assert_healthy()?;
        if let Some(cause) = self.abort_cause.get() {
            return Err(StepError::StagePanicked(Arc::clone(cause)));
        }

        let ordering = *self.ordering.read().unwrap_or_else(PoisonError::into_inner);
        let Some(ordering) = ordering else {
            return Err(StepError::NotStarted(self.name.clone()));
        };
        if self.state() != StepState::Running {
            return Err(StepError::Closed(self.name.clone()));
        }

        if !ordering.contains(OrderingGuarantees::ORDER_SEND_DOWNSTREAM) {
            let checked = self
                .sequence
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .check(&self.name, ticket);
            if let Err(e) = checked {
                self.control.panic(anyhow::Error::new(e.clone()));
                return Err(e);
            }
        }

        drop(batch);
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::BATCHES_RECEIVED
            .with_label_values(&[self.name.as_str()])
            .inc();
        metrics::BATCHES_FORWARDED
            .with_label_values(&[self.name.as_str()])
            .inc();
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_end() -> (Arc<StageControl>, DeadEndStep) {
        let control = Arc::new(StageControl::new("test"));
        let step = DeadEndStep::new(Arc::clone(&control), "END");
        (control, step)
    }

    #[tokio::test]
    async fn test_sinks_batches_in_order() {
        let (control, step) = dead_end();
        step.start(OrderingGuarantees::NONE).await.unwrap();

        for ticket in 0..5u64 {
            step.receive(ticket, vec![ticket; 3]).await.unwrap();
        }
        assert!(!step.is_completed());
        step.end_of_upstream().await;

        assert!(step.is_completed());
        assert_eq!(step.received(), 5);
        assert_eq!(step.stats().done_batches, 5);
        control.assert_healthy().unwrap();
    }

    #[tokio::test]
    async fn test_rejects_duplicate_ticket() {
        let (control, step) = dead_end();
        step.start(OrderingGuarantees::NONE).await.unwrap();

        step.receive(1, "a").await.unwrap();
        let result = step.receive(1, "b").await;
        assert!(matches!(result, Err(StepError::TicketOutOfOrder { .. })));
        assert!(!control.is_healthy());
    }

    #[tokio::test]
    async fn test_receive_before_start() {
        let (_control, step) = dead_end();
        let result = step.receive(1, ()).await;
        assert!(matches!(result, Err(StepError::NotStarted(_))));
    }

    #[tokio::test]
    async fn test_panic_completes_step() {
        let (control, step) = dead_end();
        step.start(OrderingGuarantees::NONE).await.unwrap();

        let cause = control.panic(anyhow::anyhow!("boom"));
        step.receive_panic(&cause);

        assert!(step.is_completed());
        assert_eq!(step.stats().state, StepState::Aborted);
        assert!(matches!(
            step.receive(1, ()).await,
            Err(StepError::StagePanicked(_))
        ));
    }
}
