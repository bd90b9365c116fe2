//! Stage coordination: starting a set of steps and watching them finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::control::StageControl;
use super::step::{OrderingGuarantees, StepControl, StepStats};
use super::types::{StageError, StepError};

/// A set of steps sharing one [`StageControl`].
pub struct Stage {
    control: Arc<StageControl>,
    ordering: OrderingGuarantees,
    poll_interval: Duration,
    steps: Vec<Arc<dyn StepControl>>,
}

impl Stage {
    /// Creates an empty stage.
    pub fn new(control: Arc<StageControl>, poll_interval: Duration) -> Self {
        Self {
            control,
            ordering: OrderingGuarantees::NONE,
            poll_interval,
            steps: Vec::new(),
        }
    }

    /// Sets the ordering guarantees every step is started with.
    pub fn with_ordering(mut self, ordering: OrderingGuarantees) -> Self {
        self.ordering = ordering;
        self
    }

    /// The control shared by the steps of this stage.
    pub fn control(&self) -> &Arc<StageControl> {
        &self.control
    }

    /// Adds a step, in pipeline order, and registers it for panic
    /// notifications. Returns the step for wiring.
    pub fn add<S>(&mut self, step: Arc<S>) -> Arc<S>
    where
        S: StepControl + 'static,
    {
        let as_control: Arc<dyn StepControl> = step.clone();
        self.control.register(&as_control);
        self.steps.push(as_control);
        step
    }

    /// Start every step, downstream first, and hand back the execution.
    ///
    /// If a step fails to start, the steps started so far are closed.
    pub async fn execute(self) -> Result<StageExecution, StepError> {
        info!(stage = %self.control.name(), steps = self.steps.len(), "Starting stage");

        for (started, step) in self.steps.iter().rev().enumerate() {
            if let Err(e) = step.start(self.ordering).await {
                warn!(stage = %self.control.name(), step = %step.name(), "Failed to start step: {}", e);
                for step in self.steps.iter().rev().take(started) {
                    step.close().await;
                }
                return Err(e);
            }
        }

        Ok(StageExecution {
            control: self.control,
            poll_interval: self.poll_interval,
            steps: self.steps,
            started_at: Utc::now(),
        })
    }
}

/// Snapshot of a running stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage name.
    pub stage: String,
    /// When the stage was started.
    pub started_at: DateTime<Utc>,
    /// Whether no panic has been recorded.
    pub healthy: bool,
    /// Per-step stats, in pipeline order.
    pub steps: Vec<StepStats>,
}

/// Handle to a started stage.
pub struct StageExecution {
    control: Arc<StageControl>,
    poll_interval: Duration,
    steps: Vec<Arc<dyn StepControl>>,
    started_at: DateTime<Utc>,
}

impl StageExecution {
    /// Whether any step is still working. Fails if the stage panicked.
    pub fn still_executing(&self) -> Result<bool, StageError> {
        self.control.assert_healthy()?;
        Ok(self.steps.iter().any(|step| !step.is_completed()))
    }

    /// Wait until every step completed or the stage panicked, then close all
    /// steps. Re-raises the stage panic cause.
    pub async fn await_completion(&self) -> Result<(), StageError> {
        loop {
            match self.still_executing() {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
            tokio::select! {
                _ = self.control.panicked() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.close().await;
        self.control.assert_healthy()?;

        info!(
            stage = %self.control.name(),
            elapsed_ms = (Utc::now() - self.started_at).num_milliseconds(),
            "Stage completed"
        );
        Ok(())
    }

    /// Close every step. Safe to call more than once.
    pub async fn close(&self) {
        for step in &self.steps {
            step.close().await;
        }
        debug!(stage = %self.control.name(), "Stage closed");
    }

    /// The control shared by the steps of this stage.
    pub fn control(&self) -> &Arc<StageControl> {
        &self.control
    }

    /// Stats of every step, in pipeline order.
    pub fn stats(&self) -> StageStats {
        StageStats {
            stage: self.control.name().to_string(),
            started_at: self.started_at,
            healthy: self.control.is_healthy(),
            steps: self.steps.iter().map(|step| step.stats()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;
    use crate::staging::{DeadEndStep, ForkedProcessorStep, Step};
    use crate::testing::SlotMarks;

    fn stage(name: &str) -> Stage {
        Stage::new(Arc::new(StageControl::new(name)), Duration::from_millis(5))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stage_runs_to_completion() {
        let mut stage = stage("nodes");
        let control = Arc::clone(stage.control());
        let config = StagingConfig::default().with_max_processors(3);

        let processor: Arc<ForkedProcessorStep<SlotMarks, _>> =
            stage.add(Arc::new(ForkedProcessorStep::new(
                Arc::clone(&control),
                "PROCESSOR",
                &config,
                |slot: usize, _processors: usize, batch: &SlotMarks| -> anyhow::Result<()> {
                    batch.mark(slot)
                },
            )));
        let end = stage.add(Arc::new(DeadEndStep::new(Arc::clone(&control), "END")));
        processor.set_downstream(end.clone());

        let execution = stage.execute().await.unwrap();
        for ticket in 0..20 {
            processor.receive(ticket, SlotMarks::new(3)).await.unwrap();
        }
        assert!(execution.still_executing().unwrap());
        processor.end_of_upstream().await;

        execution.await_completion().await.unwrap();
        assert_eq!(end.received(), 20);

        let stats = execution.stats();
        assert!(stats.healthy);
        assert_eq!(stats.steps.len(), 2);
        assert_eq!(stats.steps[0].name, "PROCESSOR");
        assert_eq!(stats.steps[0].done_batches, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stage_of_chained_forked_steps_completes() {
        let mut stage = stage("chain");
        let control = Arc::clone(stage.control());
        let config = StagingConfig::default().with_max_processors(3);

        let first: Arc<ForkedProcessorStep<SlotMarks, _>> =
            stage.add(Arc::new(ForkedProcessorStep::new(
                Arc::clone(&control),
                "MARK",
                &config,
                |slot: usize, _processors: usize, batch: &SlotMarks| -> anyhow::Result<()> {
                    batch.mark(slot)
                },
            )));
        let second: Arc<ForkedProcessorStep<SlotMarks, _>> =
            stage.add(Arc::new(ForkedProcessorStep::new(
                Arc::clone(&control),
                "CHECK",
                &config.clone().with_max_processors(1),
                |_slot: usize, _processors: usize, batch: &SlotMarks| -> anyhow::Result<()> {
                    anyhow::ensure!(batch.is_complete(), "batch not fully marked");
                    Ok(())
                },
            )));
        let end = stage.add(Arc::new(DeadEndStep::new(Arc::clone(&control), "END")));
        first.set_downstream(second.clone());
        second.set_downstream(end.clone());

        let execution = stage.execute().await.unwrap();
        for ticket in 0..5 {
            first.receive(ticket, SlotMarks::new(3)).await.unwrap();
        }
        // Let every step run idle before the end of upstream arrives.
        while end.received() < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        first.end_of_upstream().await;

        tokio::time::timeout(Duration::from_secs(10), execution.await_completion())
            .await
            .expect("stage should complete")
            .unwrap();
        let stats = execution.stats();
        assert!(stats
            .steps
            .iter()
            .all(|step| step.state == crate::staging::StepState::Completed));
        assert_eq!(end.received(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stage_reraises_panic() {
        let mut stage = stage("relationships");
        let control = Arc::clone(stage.control());
        let config = StagingConfig::default().with_max_processors(2);

        let processor: Arc<ForkedProcessorStep<u32, _>> =
            stage.add(Arc::new(ForkedProcessorStep::new(
                Arc::clone(&control),
                "PROCESSOR",
                &config,
                |_slot: usize, _processors: usize, _batch: &u32| -> anyhow::Result<()> {
                    anyhow::bail!("corrupt record")
                },
            )));
        let end = stage.add(Arc::new(DeadEndStep::new(Arc::clone(&control), "END")));
        processor.set_downstream(end.clone());

        let execution = stage.execute().await.unwrap();
        // The failure may already have closed admission when this returns.
        let _ = processor.receive(1, 7).await;

        let err = execution.await_completion().await.unwrap_err();
        assert_eq!(err.cause().to_string(), "corrupt record");
        assert!(end.is_completed());
        assert_eq!(end.received(), 0);
        assert!(execution.still_executing().is_err());
    }

    #[tokio::test]
    async fn test_execute_fails_on_started_step() {
        let mut stage = stage("nodes");
        let control = Arc::clone(stage.control());
        let end = stage.add(Arc::new(DeadEndStep::new(control, "END")));
        end.start(OrderingGuarantees::NONE).await.unwrap();

        let result = stage.execute().await;
        assert!(matches!(result, Err(StepError::AlreadyStarted(_))));
    }
}
