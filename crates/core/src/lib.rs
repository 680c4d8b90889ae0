pub mod config;
pub mod config_loader;
pub mod error;
pub mod job;
pub mod metrics;
pub mod params;
pub mod traits;

pub use config::{AppConfig, DatabaseConfig, EngineConfig, RunnerConfig};
pub use config_loader::ConfigLoader;
pub use error::EngineError;
pub use job::{
    DateRange, ExecutionParams, Fold, FoldResult, Job, JobDefinition, JobError, JobErrorCode,
    JobId, JobKind, JobStatus, JobSummary, SlippageConfig, SweepRequest, VariantResult,
    WalkForwardSpec, WalkForwardSummary, WindowSpec,
};
pub use metrics::{Objective, VariantMetrics};
pub use params::{ParamValue, ParameterRange, Variant};
pub use traits::{BacktestRunner, EvaluationRequest, ResultStore};
