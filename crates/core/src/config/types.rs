use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Configuration for staged processing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StagingConfig {
    /// Upper bound for the processor count of forked steps.
    #[serde(default = "default_max_processors")]
    pub max_number_of_processors: usize,
    /// Processor count forked steps start with (default: the maximum).
    #[serde(default)]
    pub initial_processors: Option<usize>,
    /// Batches a step may hold in flight before `receive` waits.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Interval at which a stage execution polls its steps for completion.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            max_number_of_processors: default_max_processors(),
            initial_processors: None,
            max_queue_size: default_max_queue_size(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl StagingConfig {
    /// Upper bound for the processor count, never below one.
    pub fn max_number_of_processors(&self) -> usize {
        self.max_number_of_processors.max(1)
    }

    /// Processor count a forked step starts with, clamped into range.
    pub fn initial_processors(&self) -> usize {
        let max = self.max_number_of_processors();
        self.initial_processors.unwrap_or(max).clamp(1, max)
    }

    /// Sets the maximum number of processors.
    pub fn with_max_processors(mut self, max: usize) -> Self {
        self.max_number_of_processors = max;
        self
    }

    /// Sets the initial number of processors.
    pub fn with_initial_processors(mut self, initial: usize) -> Self {
        self.initial_processors = Some(initial);
        self
    }

    /// Sets the in-flight queue size.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the completion poll interval.
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }
}

fn default_max_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_queue_size() -> usize {
    16
}

fn default_poll_interval() -> u64 {
    10
}

/// Synthetic workload driven by the runner binary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Number of batches to push through the stage.
    #[serde(default = "default_batches")]
    pub batches: u64,
    /// Records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Change the processor count every this many batches (0 disables).
    #[serde(default = "default_resize_every")]
    pub resize_every: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batches: default_batches(),
            batch_size: default_batch_size(),
            resize_every: default_resize_every(),
        }
    }
}

fn default_batches() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10_000
}

fn default_resize_every() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_full_config() {
        let toml = r#"
[staging]
max_number_of_processors = 8
initial_processors = 2
max_queue_size = 32
poll_interval_ms = 5

[runner]
batches = 50
batch_size = 100
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.staging.max_number_of_processors(), 8);
        assert_eq!(config.staging.initial_processors(), 2);
        assert_eq!(config.staging.max_queue_size, 32);
        assert_eq!(config.staging.poll_interval_ms, 5);
        assert_eq!(config.runner.batches, 50);
        assert_eq!(config.runner.batch_size, 100);
        assert_eq!(config.runner.resize_every, 100); // default
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.staging.max_number_of_processors() >= 1);
        assert_eq!(config.staging.max_queue_size, 16);
        assert_eq!(config.staging.poll_interval_ms, 10);
        assert!(config.staging.initial_processors.is_none());
    }

    #[test]
    fn test_initial_processors_clamped() {
        let config = StagingConfig::default()
            .with_max_processors(4)
            .with_initial_processors(9);
        assert_eq!(config.initial_processors(), 4);

        let config = StagingConfig::default()
            .with_max_processors(4)
            .with_initial_processors(0);
        assert_eq!(config.initial_processors(), 1);
    }

    #[test]
    fn test_initial_processors_defaults_to_max() {
        let config = StagingConfig::default().with_max_processors(6);
        assert_eq!(config.initial_processors(), 6);
    }
}
