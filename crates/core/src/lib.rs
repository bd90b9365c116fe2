pub mod config;
pub mod metrics;
pub mod staging;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, RunnerConfig,
    StagingConfig,
};
pub use staging::{
    DeadEndStep, ForkedProcess, ForkedProcessorStep, OrderingGuarantees, PanicCause, Stage,
    StageControl, StageError, StageExecution, StageStats, Step, StepControl, StepError,
    StepState, StepStats, Ticket,
};
