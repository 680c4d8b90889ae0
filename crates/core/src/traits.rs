use crate::job::{DateRange, FoldResult, Job, JobId, JobSummary, SlippageConfig, VariantResult};
use crate::metrics::VariantMetrics;
use crate::params::Variant;
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Input of a single backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub job_id: JobId,
    pub strategy_id: i64,
    pub instrument_id: i64,
    pub bar: String,
    /// `None` evaluates over all available data.
    pub date_range: Option<DateRange>,
    pub params: Variant,
    pub cash: Decimal,
    pub commission: Decimal,
    pub slippage: SlippageConfig,
}

/// External capability that backtests one parameter set.
#[async_trait]
pub trait BacktestRunner: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<VariantMetrics>;

    /// Span of bars available for an instrument, used when a walk-forward
    /// job has no explicit date range.
    async fn data_span(&self, instrument_id: i64, bar: &str) -> Result<DateRange>;
}

/// Append-only sink for job headers and result rows.
///
/// Header writes replace the previous header of the same job. Result rows are
/// only ever appended.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_header(&self, job: &Job) -> Result<()>;
    async fn append_variant(&self, job_id: JobId, result: &VariantResult) -> Result<()>;
    async fn append_fold(&self, job_id: JobId, result: &FoldResult) -> Result<()>;
    /// Header plus every row written so far.
    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>>;
    /// Newest first.
    async fn list_jobs(&self) -> Result<Vec<JobSummary>>;
}
