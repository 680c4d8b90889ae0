//! Job data model: submission definitions, lifecycle state, and results.
//!
//! A `Job` is mutated only through the transition methods below, which the
//! orchestrator's controller calls from a single task per job.

use crate::metrics::{Objective, VariantMetrics};
use crate::params::{ordered, ParameterRange, Variant};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Optimization,
    WalkForward,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Optimization => "optimization",
            Self::WalkForward => "walk_forward",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "optimization" => Some(Self::Optimization),
            "walk_forward" => Some(Self::WalkForward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Cause of a job-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    /// Operator cancelled the job.
    Cancelled,
    /// The result store rejected a write.
    StoreUnavailable,
    /// Setup failed after submission (data span lookup, grid expansion).
    SetupFailed,
    /// The data span is too short for a single train/test window.
    InsufficientHistory,
    /// The worker pool stopped before every unit reported.
    WorkerLost,
}

impl JobErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::StoreUnavailable => "store_unavailable",
            Self::SetupFailed => "setup_failed",
            Self::InsufficientHistory => "insufficient_history",
            Self::WorkerLost => "worker_lost",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cancelled" => Some(Self::Cancelled),
            "store_unavailable" => Some(Self::StoreUnavailable),
            "setup_failed" => Some(Self::SetupFailed),
            "insufficient_history" => Some(Self::InsufficientHistory),
            "worker_lost" => Some(Self::WorkerLost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(JobErrorCode::Cancelled, "job cancelled by request")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Half-open calendar range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub const fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Slippage settings forwarded to the backtest runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippageConfig {
    /// Fractional slippage per fill.
    #[serde(default)]
    pub perc: Decimal,
    /// Fixed price slippage per fill.
    #[serde(default)]
    pub fixed: Decimal,
    /// Apply slippage to fills at the bar open.
    #[serde(default = "default_slip_open")]
    pub slip_open: bool,
}

const fn default_slip_open() -> bool {
    true
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            perc: Decimal::ZERO,
            fixed: Decimal::ZERO,
            slip_open: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default = "default_cash")]
    pub cash: Decimal,
    #[serde(default = "default_commission")]
    pub commission: Decimal,
    #[serde(default)]
    pub slippage: SlippageConfig,
    /// Worker pool size; the engine default applies when unset.
    #[serde(default)]
    pub maxcpus: Option<usize>,
    /// Explicit evaluation range; the instrument's full span when unset.
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

fn default_cash() -> Decimal {
    Decimal::from(10_000)
}

fn default_commission() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            cash: default_cash(),
            commission: default_commission(),
            slippage: SlippageConfig::default(),
            maxcpus: None,
            date_range: None,
        }
    }
}

/// What to sweep and how to evaluate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    pub strategy_id: i64,
    pub instrument_id: i64,
    pub bar: String,
    /// Named ranges in declaration order.
    #[serde(with = "ordered")]
    pub param_ranges: Vec<(String, ParameterRange)>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub execution: ExecutionParams,
}

/// Train/test/step month counts for rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    #[serde(default = "default_train_months")]
    pub train_months: i32,
    #[serde(default = "default_test_months")]
    pub test_months: i32,
    #[serde(default = "default_step_months")]
    pub step_months: i32,
}

const fn default_train_months() -> i32 {
    12
}

const fn default_test_months() -> i32 {
    3
}

const fn default_step_months() -> i32 {
    3
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            train_months: default_train_months(),
            test_months: default_test_months(),
            step_months: default_step_months(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WalkForwardSpec {
    #[serde(default)]
    pub windows: WindowSpec,
    #[serde(default)]
    pub objective: Objective,
}

/// Everything a job was submitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub request: SweepRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk_forward: Option<WalkForwardSpec>,
}

impl JobDefinition {
    #[must_use]
    pub const fn kind(&self) -> JobKind {
        if self.walk_forward.is_some() {
            JobKind::WalkForward
        } else {
            JobKind::Optimization
        }
    }
}

/// One train/test window pair. Both windows are half-open and
/// `train_end == test_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub fold_index: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

impl Fold {
    #[must_use]
    pub const fn train_range(&self) -> DateRange {
        DateRange::new(self.train_start, self.train_end)
    }

    #[must_use]
    pub const fn test_range(&self) -> DateRange {
        DateRange::new(self.test_start, self.test_end)
    }
}

/// Outcome of one optimization variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    /// Position of the variant in grid order.
    pub index: usize,
    pub variant_params: Variant,
    #[serde(flatten)]
    pub metrics: VariantMetrics,
    /// Runner failure message, when the unit failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: Fold,
    /// `None` when no training variant produced the objective.
    pub best_params: Option<Variant>,
    pub train_objective_value: Option<f64>,
    /// Out-of-sample metrics of `best_params` on the test window.
    pub test_metrics: Option<VariantMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub definition: JobDefinition,
    pub status: JobStatus,
    pub progress: u8,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub total_variants: usize,
    pub total_folds: usize,
    pub total_units: usize,
    pub completed_units: usize,
    /// Set while no unit has completed within the stall window.
    #[serde(default)]
    pub stalled: bool,
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variants: Vec<VariantResult>,
    #[serde(default)]
    pub folds: Vec<FoldResult>,
    pub best_final_value: Option<f64>,
    pub best_params: Option<Variant>,
}

impl Job {
    #[must_use]
    pub fn new(id: JobId, definition: JobDefinition, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: definition.kind(),
            definition,
            status: JobStatus::Queued,
            progress: 0,
            submitted_at,
            started_at: None,
            ended_at: None,
            error: None,
            total_variants: 0,
            total_folds: 0,
            total_units: 0,
            completed_units: 0,
            stalled: false,
            last_progress_at: None,
            variants: Vec::new(),
            folds: Vec::new(),
            best_final_value: None,
            best_params: None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy of the job without its variant and fold rows.
    #[must_use]
    pub fn header(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            definition: self.definition.clone(),
            status: self.status,
            progress: self.progress,
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            error: self.error.clone(),
            total_variants: self.total_variants,
            total_folds: self.total_folds,
            total_units: self.total_units,
            completed_units: self.completed_units,
            stalled: self.stalled,
            last_progress_at: self.last_progress_at,
            variants: Vec::new(),
            folds: Vec::new(),
            best_final_value: self.best_final_value,
            best_params: self.best_params.clone(),
        }
    }

    /// `queued -> running`. Records the unit totals used as the progress
    /// denominator. No-op unless the job is queued.
    pub fn start(
        &mut self,
        total_variants: usize,
        total_folds: usize,
        total_units: usize,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.total_variants = total_variants;
        self.total_folds = total_folds;
        self.total_units = total_units;
        self.started_at = Some(now);
        self.last_progress_at = Some(now);
        true
    }

    /// Counts `units` completed units and recomputes progress.
    ///
    /// Progress is `floor(100 * completed / total)`, held at 99 until the
    /// terminal transition so that 100 always means finished.
    pub fn record_completed(&mut self, units: usize, now: DateTime<Utc>) {
        if self.status != JobStatus::Running || units == 0 {
            return;
        }
        self.completed_units = (self.completed_units + units).min(self.total_units);
        self.last_progress_at = Some(now);
        self.stalled = false;
        let computed = if self.total_units == 0 {
            0
        } else {
            (self.completed_units * 100 / self.total_units).min(99)
        };
        // progress never moves backwards
        #[allow(clippy::cast_possible_truncation)]
        let computed = computed as u8;
        self.progress = self.progress.max(computed);
    }

    #[must_use]
    pub const fn all_units_completed(&self) -> bool {
        self.completed_units >= self.total_units
    }

    /// `running -> succeeded`. Returns `false` if the job was already terminal.
    pub fn succeed(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Succeeded;
        self.finish(now);
        true
    }

    /// `queued | running -> failed`. Returns `false` if the job was already terminal.
    pub fn fail(&mut self, error: JobError, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.finish(now);
        true
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.progress = 100;
        self.stalled = false;
        self.ended_at = Some(now);
    }

    #[must_use]
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            kind: self.kind,
            status: self.status,
            progress: self.progress,
            strategy_id: self.definition.request.strategy_id,
            instrument_id: self.definition.request.instrument_id,
            bar: self.definition.request.bar.clone(),
            submitted_at: self.submitted_at,
            ended_at: self.ended_at,
            total_units: self.total_units,
            completed_units: self.completed_units,
            best_final_value: self.best_final_value,
            stalled: self.stalled,
            error_code: self.error.as_ref().map(|e| e.code),
        }
    }

    /// Aggregate of out-of-sample results; `None` for optimization jobs.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn walk_forward_summary(&self) -> Option<WalkForwardSummary> {
        if self.kind != JobKind::WalkForward {
            return None;
        }

        let evaluated: Vec<&VariantMetrics> = self
            .folds
            .iter()
            .filter_map(|f| f.test_metrics.as_ref())
            .collect();
        let finals: Vec<f64> = evaluated.iter().filter_map(|m| m.final_value).collect();
        let sharpes: Vec<f64> = evaluated.iter().filter_map(|m| m.sharpe).collect();
        let mean = |values: &[f64]| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };

        let mut distinct: Vec<&Variant> = Vec::new();
        for params in self.folds.iter().filter_map(|f| f.best_params.as_ref()) {
            if !distinct.contains(&params) {
                distinct.push(params);
            }
        }

        Some(WalkForwardSummary {
            folds_total: self.total_folds,
            folds_evaluated: evaluated.len(),
            folds_skipped: self.folds.iter().filter(|f| f.best_params.is_none()).count(),
            total_oos_final_value: (!finals.is_empty()).then(|| finals.iter().sum()),
            mean_oos_final_value: mean(&finals),
            mean_oos_sharpe: mean(&sharpes),
            distinct_best_params: distinct.len(),
        })
    }
}

/// Listing view of a job without its result rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    pub strategy_id: i64,
    pub instrument_id: i64,
    pub bar: String,
    pub submitted_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_units: usize,
    pub completed_units: usize,
    pub best_final_value: Option<f64>,
    pub stalled: bool,
    pub error_code: Option<JobErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardSummary {
    pub folds_total: usize,
    /// Folds with an out-of-sample result.
    pub folds_evaluated: usize,
    /// Folds where no training variant produced the objective.
    pub folds_skipped: usize,
    pub total_oos_final_value: Option<f64>,
    pub mean_oos_final_value: Option<f64>,
    pub mean_oos_sharpe: Option<f64>,
    /// Number of distinct parameter sets chosen across folds.
    pub distinct_best_params: usize,
}
