//! Types shared by the staging module.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a batch in the total order of a pipeline.
pub type Ticket = u64;

/// The first failure recorded for a stage.
///
/// Shared by reference so that every participant observes the identical cause.
pub type PanicCause = Arc<anyhow::Error>;

/// Errors returned by step operations.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// A ticket arrived with a gap or as a duplicate.
    #[error("step '{step}' expected ticket {expected}, got {actual}")]
    TicketOutOfOrder {
        step: String,
        expected: Ticket,
        actual: Ticket,
    },

    /// A ticket arrived after the last representable ticket.
    #[error("step '{step}' received ticket {actual} after the last ticket")]
    TicketsExhausted { step: String, actual: Ticket },

    /// The owning stage has panicked.
    #[error("stage panicked: {0}")]
    StagePanicked(PanicCause),

    /// Batches were sent to a step that has not been started.
    #[error("step '{0}' has not been started")]
    NotStarted(String),

    /// The step was started twice.
    #[error("step '{0}' is already started")]
    AlreadyStarted(String),

    /// The step no longer admits batches (end of upstream or closed).
    #[error("step '{0}' no longer admits batches")]
    Closed(String),
}

/// Errors reported by a stage as a whole.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The stage recorded a panic; carries the first cause.
    #[error("stage '{stage}' panicked: {cause}")]
    Panicked { stage: String, cause: PanicCause },
}

impl StageError {
    /// The recorded panic cause.
    pub fn cause(&self) -> &PanicCause {
        match self {
            StageError::Panicked { cause, .. } => cause,
        }
    }
}

impl From<StageError> for StepError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Panicked { cause, .. } => StepError::StagePanicked(cause),
        }
    }
}

/// Lifecycle of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Running,
    /// End of upstream observed, in-flight batches still being finished.
    Draining,
    Completed,
    /// A panic truncated the lifecycle.
    Aborted,
}

impl StepState {
    /// Whether the state is terminal for polling purposes.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Aborted)
    }
}
