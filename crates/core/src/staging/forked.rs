//! Forked processor step.
//!
//! Every admitted batch is handed to `P` processor slots which run the
//! caller's [`ForkedProcess`] concurrently. A single forwarder task waits for
//! batches in admission order and passes each one downstream once all of its
//! slots have finished, so emission order is ticket order no matter which
//! batch finishes first.
//!
//! The slot table is sized to the configured maximum when the step starts.
//! Changing the processor count only changes how many of those slots new
//! batches are sent to. Each slot works through its batches in ticket order,
//! and the first batch admitted under a new count waits until every earlier
//! batch has been processed. A sub-unit owned by `unit % processors` is
//! therefore never worked on by two slots at once, nor out of ticket order.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StagingConfig;
use crate::metrics;

use super::control::{wait_until_set, StageControl};
use super::step::{OrderingGuarantees, Step, StepControl, StepStats, TicketSequence};
use super::types::{PanicCause, StepError, StepState, Ticket};

/// The per-slot operation of a forked step.
///
/// `forked_process` is called once per active slot for every batch, with the
/// processor count that was in effect when the batch was admitted. The
/// implementation decides which part of the batch a slot owns, typically
/// `unit % processors == slot`.
#[async_trait]
pub trait ForkedProcess<T: Send + Sync + 'static>: Send + Sync + 'static {
    async fn forked_process(&self, slot: usize, processors: usize, batch: &T)
        -> anyhow::Result<()>;
}

/// Synchronous operations are treated as blocking work. On a multi-thread
/// runtime they run through `block_in_place`, so slots busy with CPU work do
/// not starve the forwarder and admission tasks.
#[async_trait]
impl<T, F> ForkedProcess<T> for F
where
    T: Send + Sync + 'static,
    F: Fn(usize, usize, &T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn forked_process(
        &self,
        slot: usize,
        processors: usize,
        batch: &T,
    ) -> anyhow::Result<()> {
        match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self(slot, processors, batch))
            }
            _ => self(slot, processors, batch),
        }
    }
}

/// Tracks the outstanding slots of one admitted batch.
struct BatchTracker {
    ticket: Ticket,
    processors: usize,
    admitted_at: Instant,
    outstanding: AtomicUsize,
    outcome: Mutex<Option<oneshot::Sender<Result<(), PanicCause>>>>,
    settled_tx: watch::Sender<bool>,
}

impl BatchTracker {
    fn new(
        ticket: Ticket,
        processors: usize,
        outcome: oneshot::Sender<Result<(), PanicCause>>,
    ) -> Self {
        Self {
            ticket,
            processors,
            admitted_at: Instant::now(),
            outstanding: AtomicUsize::new(processors),
            outcome: Mutex::new(Some(outcome)),
            settled_tx: watch::channel(false).0,
        }
    }

    /// Mark one slot as finished. Returns the batch processing time when it
    /// was the last one.
    fn slot_done(&self) -> Option<Duration> {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.resolve(Ok(()));
            Some(self.admitted_at.elapsed())
        } else {
            None
        }
    }

    fn fail(&self, cause: PanicCause) {
        self.resolve(Err(cause));
    }

    fn resolve(&self, outcome: Result<(), PanicCause>) {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
        self.settled_tx.send_replace(true);
    }

    /// Resolves once every slot finished or one of them failed.
    async fn settled(&self) {
        wait_until_set(self.settled_tx.subscribe()).await;
    }
}

/// One slot's share of a batch.
struct SlotJob<T> {
    batch: Arc<T>,
    tracker: Arc<BatchTracker>,
}

/// An admitted batch waiting to be forwarded.
struct InFlight<T> {
    ticket: Ticket,
    batch: Arc<T>,
    outcome: oneshot::Receiver<Result<(), PanicCause>>,
}

/// Admission side state, serialized by `receive`.
struct Admission<T> {
    ordering: OrderingGuarantees,
    sequence: TicketSequence,
    slots: Vec<mpsc::Sender<SlotJob<T>>>,
    queue: Option<mpsc::Sender<InFlight<T>>>,
    last: Option<Arc<BatchTracker>>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    done: AtomicU64,
    in_flight: AtomicU64,
    processing_nanos: AtomicU64,
    downstream_nanos: AtomicU64,
}

/// State shared between the step handle, its slots and its forwarder.
struct Shared<T, F> {
    name: String,
    control: Arc<StageControl>,
    op: F,
    max_processors: usize,
    processors: AtomicUsize,
    state: RwLock<StepState>,
    abort_cause: OnceLock<PanicCause>,
    aborted_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
    counters: Counters,
    _batch: std::marker::PhantomData<fn(T)>,
}

impl<T, F> Shared<T, F>
where
    T: Send + Sync + 'static,
    F: ForkedProcess<T>,
{
    fn state(&self) -> StepState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `state` unless the step already reached a terminal state.
    fn set_state(&self, state: StepState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !current.is_terminal() {
            *current = state;
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort_cause.get().is_some()
    }

    /// Record `err` as the stage panic and abort this step.
    fn fail(&self, err: anyhow::Error) -> PanicCause {
        let cause = self.control.panic(err);
        self.abort(&cause);
        cause
    }

    fn abort(&self, cause: &PanicCause) {
        if self.abort_cause.set(Arc::clone(cause)).is_ok() {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != StepState::Completed {
                warn!(step = %self.name, "Aborting step: {}", cause);
                *state = StepState::Aborted;
            }
        }
        self.aborted_tx.send_replace(true);
    }

    async fn run_slot(self: Arc<Self>, slot: usize, mut jobs: mpsc::Receiver<SlotJob<T>>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = wait_until_set(self.aborted_tx.subscribe()) => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let SlotJob { batch, tracker } = job;
            let started = Instant::now();
            let result = AssertUnwindSafe(self.op.forked_process(
                slot,
                tracker.processors,
                &batch,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_payload_error(payload)));
            drop(batch);

            let outcome = if result.is_ok() { "success" } else { "failed" };
            metrics::FORKED_PROCESS_DURATION
                .with_label_values(&[self.name.as_str(), outcome])
                .observe(started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    if let Some(elapsed) = tracker.slot_done() {
                        self.counters
                            .processing_nanos
                            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    error!(
                        step = %self.name,
                        slot,
                        ticket = tracker.ticket,
                        "Forked processing failed: {:#}",
                        e
                    );
                    let cause = self.fail(e);
                    tracker.fail(cause);
                }
            }
        }
        debug!(step = %self.name, slot, "Processor slot stopped");
    }

    async fn run_forwarder(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<InFlight<T>>,
        downstream: Option<Arc<dyn Step<T>>>,
    ) {
        // Whether a popped batch has not been forwarded.
        let mut holding = false;
        loop {
            let entry = tokio::select! {
                biased;
                _ = wait_until_set(self.aborted_tx.subscribe()) => break,
                entry = queue.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            let InFlight {
                ticket,
                batch,
                outcome,
            } = entry;
            holding = true;
            let outcome = tokio::select! {
                biased;
                _ = wait_until_set(self.aborted_tx.subscribe()) => break,
                outcome = outcome => outcome,
            };
            match outcome {
                Ok(Ok(())) => {}
                // The failing slot already recorded the cause.
                Ok(Err(_)) => break,
                Err(_) => {
                    self.fail(anyhow::anyhow!(
                        "processor slots of step '{}' exited before finishing ticket {}",
                        self.name,
                        ticket
                    ));
                    break;
                }
            }

            let Ok(batch) = Arc::try_unwrap(batch) else {
                self.fail(anyhow::anyhow!(
                    "batch {} of step '{}' is still shared after processing",
                    ticket,
                    self.name
                ));
                break;
            };

            if let Some(downstream) = &downstream {
                let started = Instant::now();
                if let Err(e) = downstream.receive(ticket, batch).await {
                    self.fail(anyhow::Error::new(e).context(format!(
                        "step '{}' failed to forward ticket {}",
                        self.name, ticket
                    )));
                    break;
                }
                self.counters
                    .downstream_nanos
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }

            holding = false;
            self.counters.done.fetch_add(1, Ordering::Relaxed);
            self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            metrics::BATCHES_FORWARDED
                .with_label_values(&[self.name.as_str()])
                .inc();
            debug!(step = %self.name, ticket, "Forwarded batch");
        }

        // Undelivered batches are discarded and leave the backlog.
        let mut discarded = u64::from(holding);
        queue.close();
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        drop(queue);
        if discarded > 0 {
            self.counters
                .in_flight
                .fetch_sub(discarded, Ordering::Relaxed);
            debug!(step = %self.name, discarded, "Discarded undelivered batches");
        }

        if self.is_aborted() {
            info!(step = %self.name, "Forwarder stopped after abort");
        } else {
            if let Some(downstream) = &downstream {
                downstream.end_of_upstream().await;
            }
            self.set_state(StepState::Completed);
            info!(
                step = %self.name,
                batches = self.counters.done.load(Ordering::Relaxed),
                "Step completed"
            );
        }
        self.finished_tx.send_replace(true);
    }
}

fn panic_payload_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow::anyhow!("forked process panicked: {}", message)
}

/// A step that forks the processing of every batch across a resizable set
/// of processor slots and forwards batches in ticket order.
pub struct ForkedProcessorStep<T, F> {
    shared: Arc<Shared<T, F>>,
    max_queue_size: usize,
    downstream: Mutex<Option<Arc<dyn Step<T>>>>,
    admission: tokio::sync::Mutex<Option<Admission<T>>>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T, F> ForkedProcessorStep<T, F>
where
    T: Send + Sync + 'static,
    F: ForkedProcess<T>,
{
    /// Creates a new forked step belonging to the stage behind `control`.
    pub fn new(
        control: Arc<StageControl>,
        name: impl Into<String>,
        config: &StagingConfig,
        op: F,
    ) -> Self {
        let name = name.into();
        let max_processors = config.max_number_of_processors();
        let processors = config.initial_processors();
        let (aborted_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);

        metrics::ACTIVE_PROCESSORS
            .with_label_values(&[name.as_str()])
            .set(processors as i64);

        Self {
            shared: Arc::new(Shared {
                name,
                control,
                op,
                max_processors,
                processors: AtomicUsize::new(processors),
                state: RwLock::new(StepState::Created),
                abort_cause: OnceLock::new(),
                aborted_tx,
                finished_tx,
                counters: Counters::default(),
                _batch: std::marker::PhantomData,
            }),
            max_queue_size: config.max_queue_size.max(1),
            downstream: Mutex::new(None),
            admission: tokio::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wire the step batches are forwarded to. Must be called before `start`.
    ///
    /// Without a downstream, processed batches are dropped.
    pub fn set_downstream(&self, downstream: Arc<dyn Step<T>>) {
        *self
            .downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(downstream);
    }

    /// Apply `delta` to the processor count and return the result.
    ///
    /// The count is clamped to `[1, max_number_of_processors]`; out of range
    /// requests are not errors. Batches already admitted keep their count.
    pub fn processors(&self, delta: isize) -> usize {
        let max = self.shared.max_processors;
        let clamp = |current: usize| current.saturating_add_signed(delta).clamp(1, max);
        let previous = match self.shared.processors.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |current| Some(clamp(current)),
        ) {
            Ok(previous) | Err(previous) => previous,
        };
        let current = clamp(previous);

        if current != previous {
            metrics::ACTIVE_PROCESSORS
                .with_label_values(&[self.shared.name.as_str()])
                .set(current as i64);
            debug!(step = %self.shared.name, previous, current, "Processor count changed");
        }
        current
    }

    /// Upper bound for the processor count.
    pub fn max_processors(&self) -> usize {
        self.shared.max_processors
    }

    fn closed_error(&self) -> StepError {
        match self.shared.abort_cause.get() {
            Some(cause) => StepError::StagePanicked(Arc::clone(cause)),
            None => StepError::Closed(self.shared.name.clone()),
        }
    }
}

#[async_trait]
impl<T, F> StepControl for ForkedProcessorStep<T, F>
where
    T: Send + Sync + 'static,
    F: ForkedProcess<T>,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn start(&self, ordering: OrderingGuarantees) -> Result<(), StepError> {
        let mut admission = self.admission.lock().await;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StepError::AlreadyStarted(self.shared.name.clone()));
        }

        let mut tasks = Vec::with_capacity(self.shared.max_processors + 1);
        let mut slots = Vec::with_capacity(self.shared.max_processors);
        for slot in 0..self.shared.max_processors {
            let (tx, rx) = mpsc::channel(self.max_queue_size);
            slots.push(tx);
            tasks.push(tokio::spawn(
                Arc::clone(&self.shared).run_slot(slot, rx),
            ));
        }

        let downstream = self
            .downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (queue_tx, queue_rx) = mpsc::channel(self.max_queue_size);
        tasks.push(tokio::spawn(
            Arc::clone(&self.shared).run_forwarder(queue_rx, downstream),
        ));

        *admission = Some(Admission {
            ordering,
            sequence: TicketSequence::new(),
            slots,
            queue: Some(queue_tx),
            last: None,
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        self.shared.set_state(StepState::Running);

        info!(
            step = %self.shared.name,
            processors = self.shared.processors.load(Ordering::Relaxed),
            max_processors = self.shared.max_processors,
            "Step started"
        );
        Ok(())
    }

    async fn end_of_upstream(&self) {
        {
            let mut admission = self.admission.lock().await;
            match admission.as_mut() {
                Some(admission) => {
                    // Draining must be set before the forwarder can complete.
                    self.shared.set_state(StepState::Draining);
                    // Closing the queue lets the forwarder drain and finish.
                    admission.queue = None;
                }
                None => {
                    // Without a forwarder nobody else will finish the step.
                    if !self.started.load(Ordering::SeqCst) {
                        self.shared.set_state(StepState::Completed);
                        self.shared.finished_tx.send_replace(true);
                    }
                }
            }
        }
        debug!(step = %self.shared.name, "End of upstream");
        wait_until_set(self.shared.finished_tx.subscribe()).await;
    }

    fn is_completed(&self) -> bool {
        self.shared.state().is_terminal()
    }

    fn receive_panic(&self, cause: &PanicCause) {
        self.shared.abort(cause);
    }

    fn stats(&self) -> StepStats {
        let counters = &self.shared.counters;
        let done = counters.done.load(Ordering::Relaxed);
        let total_processing_ms =
            Duration::from_nanos(counters.processing_nanos.load(Ordering::Relaxed)).as_millis()
                as u64;
        StepStats {
            name: self.shared.name.clone(),
            state: self.shared.state(),
            received_batches: counters.received.load(Ordering::Relaxed),
            done_batches: done,
            in_flight: counters.in_flight.load(Ordering::Relaxed),
            processors: self.shared.processors.load(Ordering::Relaxed),
            max_processors: self.shared.max_processors,
            total_processing_ms,
            avg_processing_ms: if done == 0 {
                0.0
            } else {
                total_processing_ms as f64 / done as f64
            },
            downstream_wait_ms: Duration::from_nanos(
                counters.downstream_nanos.load(Ordering::Relaxed),
            )
            .as_millis() as u64,
        }
    }

    async fn close(&self) {
        // Dropping the senders stops the slots once their queues are empty.
        self.admission.lock().await.take();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tasks.is_empty() {
            return;
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(step = %self.shared.name, "Step task ended abnormally: {}", e);
            }
        }
        debug!(step = %self.shared.name, "Step closed");
    }
}

#[async_trait]
impl<T, F> Step<T> for ForkedProcessorStep<T, F>
where
    T: Send + Sync + 'static,
    F: ForkedProcess<T>,
{
    async fn receive(&self, ticket: Ticket, batch: T) -> Result<u64, StepError> {
        self.shared.control.assert_healthy()?;
        if self.shared.is_aborted() {
            return Err(self.closed_error());
        }

        let mut guard = self.admission.lock().await;
        let Some(admission) = guard.as_mut() else {
            return Err(if self.started.load(Ordering::SeqCst) {
                self.closed_error()
            } else {
                StepError::NotStarted(self.shared.name.clone())
            });
        };
        let Some(queue) = admission.queue.clone() else {
            return Err(self.closed_error());
        };

        if !admission
            .ordering
            .contains(OrderingGuarantees::ORDER_SEND_DOWNSTREAM)
        {
            if let Err(e) = admission.sequence.check(&self.shared.name, ticket) {
                self.shared.fail(anyhow::Error::new(e.clone()));
                return Err(e);
            }
        }

        let processors = self.shared.processors.load(Ordering::SeqCst);
        if let Some(previous) = admission.last.take() {
            if previous.processors != processors {
                debug!(
                    step = %self.shared.name,
                    ticket,
                    previous = previous.processors,
                    processors,
                    "Processor count changed, waiting for earlier batches"
                );
                tokio::select! {
                    biased;
                    _ = wait_until_set(self.shared.aborted_tx.subscribe()) => {
                        return Err(self.closed_error());
                    }
                    _ = previous.settled() => {}
                }
                if self.shared.is_aborted() {
                    return Err(self.closed_error());
                }
            }
        }

        let batch = Arc::new(batch);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let tracker = Arc::new(BatchTracker::new(ticket, processors, outcome_tx));
        admission.last = Some(Arc::clone(&tracker));

        for slot in &admission.slots[..processors] {
            let job = SlotJob {
                batch: Arc::clone(&batch),
                tracker: Arc::clone(&tracker),
            };
            if slot.send(job).await.is_err() {
                if !self.shared.is_aborted() {
                    self.shared.fail(anyhow::anyhow!(
                        "processor slot of step '{}' is gone",
                        self.shared.name
                    ));
                }
                return Err(self.closed_error());
            }
        }
        drop(tracker);

        self.shared.counters.received.fetch_add(1, Ordering::Relaxed);
        let depth = self.shared.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::BATCHES_RECEIVED
            .with_label_values(&[self.shared.name.as_str()])
            .inc();

        let entry = InFlight {
            ticket,
            batch,
            outcome: outcome_rx,
        };
        if queue.send(entry).await.is_err() {
            self.shared.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            return Err(self.closed_error());
        }

        debug!(step = %self.shared.name, ticket, processors, "Admitted batch");
        Ok(depth)
    }
}

impl<T, F> std::fmt::Debug for ForkedProcessorStep<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkedProcessorStep")
            .field("name", &self.shared.name)
            .field("max_processors", &self.shared.max_processors)
            .finish()
    }
}
