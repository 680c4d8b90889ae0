//! Bounded worker pool that evaluates work units against the backtest runner.
//!
//! The pool holds no result state: each finished unit is sent once as a
//! [`UnitOutcome`] on the channel given at construction, and the receiver
//! decides what to do with it.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use stratlab_core::{
    BacktestRunner, DateRange, EvaluationRequest, Fold, JobId, SlippageConfig, Variant,
    VariantMetrics,
};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// One backtest invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    /// Optimization variant over the job's date range.
    Variant { index: usize, params: Variant },
    /// Walk-forward training pass over a fold's train window.
    Train {
        fold: Fold,
        index: usize,
        params: Variant,
    },
    /// Out-of-sample pass of a fold's selected parameters over its test window.
    Test { fold: Fold, params: Variant },
}

impl WorkUnit {
    #[must_use]
    pub const fn params(&self) -> &Variant {
        match self {
            Self::Variant { params, .. } | Self::Train { params, .. } | Self::Test { params, .. } => {
                params
            }
        }
    }

    /// Date range the unit evaluates over, given the job's explicit range.
    #[must_use]
    pub const fn date_range(&self, job_range: Option<DateRange>) -> Option<DateRange> {
        match self {
            Self::Variant { .. } => job_range,
            Self::Train { fold, .. } => Some(fold.train_range()),
            Self::Test { fold, .. } => Some(fold.test_range()),
        }
    }
}

/// Result of one unit. `Err` carries the runner's failure message.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: WorkUnit,
    pub result: Result<VariantMetrics, String>,
}

/// Job-wide inputs shared by every evaluation request.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub job_id: JobId,
    pub strategy_id: i64,
    pub instrument_id: i64,
    pub bar: String,
    pub cash: Decimal,
    pub commission: Decimal,
    pub slippage: SlippageConfig,
    pub date_range: Option<DateRange>,
}

impl EvaluationContext {
    #[must_use]
    pub fn request_for(&self, unit: &WorkUnit) -> EvaluationRequest {
        EvaluationRequest {
            job_id: self.job_id,
            strategy_id: self.strategy_id,
            instrument_id: self.instrument_id,
            bar: self.bar.clone(),
            date_range: unit.date_range(self.date_range),
            params: unit.params().clone(),
            cash: self.cash,
            commission: self.commission,
            slippage: self.slippage,
        }
    }
}

/// Scheduling interface used by the job controller.
///
/// Implementations must deliver exactly one outcome per submitted unit that
/// was dispatched, and must stop dispatching once cancelled.
pub trait WorkerPool: Send + Sync {
    /// Appends units to the FIFO queue.
    fn submit(&self, units: Vec<WorkUnit>);

    /// Stops dispatching queued units. In-flight units still report.
    fn cancel(&self);

    /// No further submissions; the pool releases its outcome sender once the
    /// queue drains.
    fn close(&self);

    fn is_cancelled(&self) -> bool;
}

/// Builds one pool per job.
pub trait WorkerPoolFactory: Send + Sync {
    fn create(
        &self,
        context: EvaluationContext,
        concurrency: usize,
        outcomes: mpsc::UnboundedSender<UnitOutcome>,
    ) -> Arc<dyn WorkerPool>;
}

/// In-process pool of tokio tasks sharing a runner.
pub struct VariantExecutor {
    queue: Mutex<Option<mpsc::UnboundedSender<WorkUnit>>>,
    cancelled: Arc<AtomicBool>,
}

impl VariantExecutor {
    /// Starts the dispatcher task. `concurrency` is raised to 1 if zero.
    #[must_use]
    pub fn spawn(
        runner: Arc<dyn BacktestRunner>,
        context: EvaluationContext,
        concurrency: usize,
        outcomes: mpsc::UnboundedSender<UnitOutcome>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        tokio::spawn(dispatch(
            queue_rx,
            runner,
            Arc::new(context),
            Arc::new(Semaphore::new(concurrency.max(1))),
            Arc::clone(&cancelled),
            outcomes,
        ));

        Self {
            queue: Mutex::new(Some(queue_tx)),
            cancelled,
        }
    }

    /// Evaluates `units` with at most `concurrency` in flight and calls
    /// `on_complete` once per finished unit, in completion order.
    pub async fn run<F>(
        runner: Arc<dyn BacktestRunner>,
        context: EvaluationContext,
        units: Vec<WorkUnit>,
        concurrency: usize,
        mut on_complete: F,
    ) where
        F: FnMut(UnitOutcome) + Send,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = Self::spawn(runner, context, concurrency, tx);
        pool.submit(units);
        pool.close();

        while let Some(outcome) = rx.recv().await {
            on_complete(outcome);
        }
    }

    fn with_queue(&self, f: impl FnOnce(&mut Option<mpsc::UnboundedSender<WorkUnit>>)) {
        // a poisoned lock only means another caller panicked mid-submit
        let mut guard = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

impl WorkerPool for VariantExecutor {
    fn submit(&self, units: Vec<WorkUnit>) {
        self.with_queue(|queue| {
            let Some(tx) = queue.as_ref() else {
                warn!(units = units.len(), "Submit on closed worker pool ignored");
                return;
            };
            for unit in units {
                if tx.send(unit).is_err() {
                    break;
                }
            }
        });
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.close();
    }

    fn close(&self) {
        self.with_queue(|queue| {
            queue.take();
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

async fn dispatch(
    mut queue: mpsc::UnboundedReceiver<WorkUnit>,
    runner: Arc<dyn BacktestRunner>,
    context: Arc<EvaluationContext>,
    slots: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
    outcomes: mpsc::UnboundedSender<UnitOutcome>,
) {
    while let Some(unit) = queue.recv().await {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        // cancellation may have arrived while every slot was busy
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        let runner = Arc::clone(&runner);
        let context = Arc::clone(&context);
        let outcomes = outcomes.clone();
        tokio::spawn(async move {
            let request = context.request_for(&unit);
            debug!(job_id = %context.job_id, params = %request.params, "Evaluating unit");
            // a panicking runner must still produce an outcome
            let evaluation = tokio::spawn(async move { runner.evaluate(&request).await });
            let result = match evaluation.await {
                Ok(result) => result
                    .map(VariantMetrics::sanitized)
                    .map_err(|e| format!("{e:#}")),
                Err(e) => Err(format!("runner task aborted: {e}")),
            };
            drop(permit);
            if outcomes.send(UnitOutcome { unit, result }).is_err() {
                debug!(job_id = %context.job_id, "Outcome receiver dropped");
            }
        });
    }

    let skipped = queue.len();
    if skipped > 0 {
        debug!(job_id = %context.job_id, skipped, "Dispatcher stopped with queued units");
    }
}

/// Creates a [`VariantExecutor`] per job over a shared runner.
pub struct TokioPoolFactory {
    runner: Arc<dyn BacktestRunner>,
}

impl TokioPoolFactory {
    #[must_use]
    pub fn new(runner: Arc<dyn BacktestRunner>) -> Self {
        Self { runner }
    }
}

impl WorkerPoolFactory for TokioPoolFactory {
    fn create(
        &self,
        context: EvaluationContext,
        concurrency: usize,
        outcomes: mpsc::UnboundedSender<UnitOutcome>,
    ) -> Arc<dyn WorkerPool> {
        Arc::new(VariantExecutor::spawn(
            Arc::clone(&self.runner),
            context,
            concurrency,
            outcomes,
        ))
    }
}
