//! Stage control: the shared failure domain of a stage.

use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tokio::sync::watch;
use tracing::{debug, error};

use crate::metrics;

use super::step::StepControl;
use super::types::{PanicCause, StageError};

/// Health register shared by every step of one stage.
///
/// The first recorded panic wins and is never cleared. Registered steps are
/// told about it immediately so they can stop doing new work.
pub struct StageControl {
    name: String,
    cause: OnceLock<PanicCause>,
    steps: Mutex<Vec<Weak<dyn StepControl>>>,
    panicked_tx: watch::Sender<bool>,
}

impl StageControl {
    /// Create a healthy stage control.
    pub fn new(name: impl Into<String>) -> Self {
        let (panicked_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            cause: OnceLock::new(),
            steps: Mutex::new(Vec::new()),
            panicked_tx,
        }
    }

    /// Name of the stage this control belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a step that should receive panic notifications.
    ///
    /// Steps are held weakly. A step registered after the stage already
    /// panicked is told about the cause right away.
    pub fn register(&self, step: &Arc<dyn StepControl>) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(step));

        if let Some(cause) = self.cause.get() {
            step.receive_panic(cause);
        }
    }

    /// Record a fatal failure for the stage.
    ///
    /// Returns the cause the stage holds afterwards, which is `cause` only if
    /// the stage was healthy.
    pub fn panic(&self, cause: anyhow::Error) -> PanicCause {
        let mut recorded = false;
        let held = Arc::clone(self.cause.get_or_init(|| {
            recorded = true;
            Arc::new(cause)
        }));

        if !recorded {
            debug!(stage = %self.name, "Stage already panicked, ignoring later failure");
            return held;
        }

        error!(stage = %self.name, "Stage panicked: {:#}", held);
        metrics::STAGE_PANICS.inc();
        self.panicked_tx.send_replace(true);

        // Collect first so no lock is held while steps react.
        let steps: Vec<Arc<dyn StepControl>> = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for step in steps {
            step.receive_panic(&held);
        }

        held
    }

    /// Fails with the recorded cause if the stage is unhealthy.
    pub fn assert_healthy(&self) -> Result<(), StageError> {
        match self.cause.get() {
            Some(cause) => Err(StageError::Panicked {
                stage: self.name.clone(),
                cause: Arc::clone(cause),
            }),
            None => Ok(()),
        }
    }

    /// Whether no panic has been recorded.
    pub fn is_healthy(&self) -> bool {
        self.cause.get().is_none()
    }

    /// The recorded panic cause, if any.
    pub fn panic_cause(&self) -> Option<PanicCause> {
        self.cause.get().cloned()
    }

    /// Resolves once the stage has panicked.
    pub async fn panicked(&self) {
        wait_until_set(self.panicked_tx.subscribe()).await;
    }
}

impl std::fmt::Debug for StageControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageControl")
            .field("name", &self.name)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

/// Resolves once the watched flag is `true`.
///
/// Never resolves if the sender goes away first.
pub(crate) async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    loop {
        let set = *rx.borrow_and_update();
        if set {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
