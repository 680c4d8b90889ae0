//! Per-job actor that owns the job's state machine.
//!
//! Workers never touch the `Job`. They send [`UnitOutcome`]s over a channel,
//! and this task applies them one at a time, writes through the result store,
//! and publishes each new state on a watch channel.

use crate::commands::JobCommand;
use crate::executor::{EvaluationContext, UnitOutcome, WorkUnit, WorkerPool, WorkerPoolFactory};
use crate::plan::JobPlan;
use anyhow::Error;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use stratlab_core::{
    BacktestRunner, DateRange, Fold, FoldResult, Job, JobError, JobErrorCode, JobKind,
    JobStatus, Objective, ResultStore, Variant, VariantMetrics, VariantResult,
};
use stratlab_sweep::ranking;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Training progress of one walk-forward fold.
struct FoldProgress {
    fold: Fold,
    expected: usize,
    results: Vec<VariantResult>,
    train_objective_value: Option<f64>,
}

/// State that exists only once units are dispatched.
struct Dispatch {
    pool: Arc<dyn WorkerPool>,
    outcomes: mpsc::UnboundedReceiver<UnitOutcome>,
    folds: Vec<FoldProgress>,
}

/// Units and totals produced by job setup.
struct Prepared {
    units: Vec<WorkUnit>,
    folds: Vec<FoldProgress>,
    total_variants: usize,
    total_units: usize,
}

pub struct JobController {
    job: Job,
    plan: JobPlan,
    runner: Arc<dyn BacktestRunner>,
    store: Arc<dyn ResultStore>,
    pools: Arc<dyn WorkerPoolFactory>,
    commands: mpsc::Receiver<JobCommand>,
    job_tx: watch::Sender<Job>,
    stall_window: Duration,
    terminal_persisted: bool,
}

impl JobController {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Job,
        plan: JobPlan,
        runner: Arc<dyn BacktestRunner>,
        store: Arc<dyn ResultStore>,
        pools: Arc<dyn WorkerPoolFactory>,
        commands: mpsc::Receiver<JobCommand>,
        job_tx: watch::Sender<Job>,
        stall_window: Duration,
    ) -> Self {
        Self {
            job,
            plan,
            runner,
            store,
            pools,
            commands,
            job_tx,
            stall_window: stall_window.max(Duration::from_millis(1)),
            terminal_persisted: false,
        }
    }

    /// Drives the job to a terminal state, then waits for in-flight units.
    ///
    /// Returns `true` when the terminal header reached the result store, so
    /// the stored copy can answer for the job from then on.
    pub async fn run(mut self) -> bool {
        let job_id = self.job.id;
        info!(%job_id, kind = self.job.kind.as_str(), "Job controller starting");

        self.drive().await;

        // cancels that raced with the exit find the job already terminal
        self.commands.close();
        while let Ok(JobCommand::Cancel(reply)) = self.commands.try_recv() {
            let _ = reply.send(false);
        }
        info!(%job_id, status = %self.job.status, "Job controller stopped");
        self.terminal_persisted
    }

    async fn drive(&mut self) {
        if let Err(e) = self.store.save_header(&self.job).await {
            self.fail_store(&e, None).await;
            return;
        }

        let prepared = match self.prepare().await {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(job_id = %self.job.id, error = %err, "Job setup failed");
                self.fail(err, None).await;
                return;
            }
        };

        if self.cancel_requested().await {
            return;
        }

        let Some(mut dispatch) = self.start(prepared).await else {
            return;
        };
        self.event_loop(&mut dispatch).await;

        if !self.job.is_terminal() {
            self.fail(
                JobError::new(
                    JobErrorCode::WorkerLost,
                    "worker pool stopped before all units reported",
                ),
                Some(&dispatch),
            )
            .await;
        }
    }

    // ============================================
    // Setup
    // ============================================

    async fn prepare(&self) -> Result<Prepared, JobError> {
        let variants: Vec<Variant> = self.plan.grid.expand();

        let Some(walk_forward) = self.plan.walk_forward else {
            let units: Vec<WorkUnit> = variants
                .into_iter()
                .enumerate()
                .map(|(index, params)| WorkUnit::Variant { index, params })
                .collect();
            return Ok(Prepared {
                total_variants: units.len(),
                total_units: units.len(),
                units,
                folds: Vec::new(),
            });
        };

        let span = self.data_span().await?;
        let folds = walk_forward.scheduler.generate(span.start, span.end);
        if folds.is_empty() {
            return Err(JobError::new(
                JobErrorCode::InsufficientHistory,
                format!("data span {span} is too short for the requested windows"),
            ));
        }

        let mut units = Vec::with_capacity(folds.len() * variants.len());
        for fold in &folds {
            for (index, params) in variants.iter().enumerate() {
                units.push(WorkUnit::Train {
                    fold: *fold,
                    index,
                    params: params.clone(),
                });
            }
        }

        // each fold adds one out-of-sample unit after its training sweep
        let total_units = units.len() + folds.len();
        Ok(Prepared {
            units,
            folds: folds
                .into_iter()
                .map(|fold| FoldProgress {
                    fold,
                    expected: variants.len(),
                    results: Vec::new(),
                    train_objective_value: None,
                })
                .collect(),
            total_variants: variants.len(),
            total_units,
        })
    }

    async fn data_span(&self) -> Result<DateRange, JobError> {
        let request = &self.job.definition.request;
        if let Some(range) = request.execution.date_range {
            return Ok(range);
        }
        let span = self
            .runner
            .data_span(request.instrument_id, &request.bar)
            .await
            .map_err(|e| {
                JobError::new(
                    JobErrorCode::SetupFailed,
                    format!("data span lookup failed: {e:#}"),
                )
            })?;
        debug!(job_id = %self.job.id, %span, "Resolved data span");
        Ok(span)
    }

    /// Applies a cancel that arrived during setup.
    async fn cancel_requested(&mut self) -> bool {
        let mut cancelled = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                JobCommand::Cancel(reply) => {
                    if !cancelled {
                        warn!(job_id = %self.job.id, "Job cancelled before dispatch");
                        self.fail(JobError::cancelled(), None).await;
                    }
                    let _ = reply.send(!cancelled);
                    cancelled = true;
                }
            }
        }
        cancelled
    }

    async fn start(&mut self, prepared: Prepared) -> Option<Dispatch> {
        let job_id = self.job.id;
        self.job.start(
            prepared.total_variants,
            prepared.folds.len(),
            prepared.total_units,
            Utc::now(),
        );
        if let Err(e) = self.store.save_header(&self.job).await {
            self.fail_store(&e, None).await;
            return None;
        }
        self.publish();
        info!(
            %job_id,
            total_variants = self.job.total_variants,
            total_folds = self.job.total_folds,
            total_units = self.job.total_units,
            concurrency = self.plan.concurrency,
            "Job running"
        );

        let request = &self.job.definition.request;
        let context = EvaluationContext {
            job_id,
            strategy_id: request.strategy_id,
            instrument_id: request.instrument_id,
            bar: request.bar.clone(),
            cash: request.execution.cash,
            commission: request.execution.commission,
            slippage: request.execution.slippage,
            date_range: request.execution.date_range,
        };
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let pool = self.pools.create(context, self.plan.concurrency, outcome_tx);
        pool.submit(prepared.units);

        let mut dispatch = Dispatch {
            pool,
            outcomes,
            folds: prepared.folds,
        };

        // folds whose training sweep is empty resolve immediately
        for index in 0..dispatch.folds.len() {
            if dispatch.folds[index].expected == 0 {
                self.close_training(index, &mut dispatch).await;
            }
        }
        self.finalize_if_complete(&dispatch).await;
        Some(dispatch)
    }

    // ============================================
    // Event loop
    // ============================================

    async fn event_loop(&mut self, dispatch: &mut Dispatch) {
        let mut stall_check = tokio::time::interval(self.stall_window);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_progress = Instant::now();
        let mut commands_open = true;

        loop {
            tokio::select! {
                outcome = dispatch.outcomes.recv() => match outcome {
                    Some(outcome) => {
                        last_progress = Instant::now();
                        self.apply(outcome, dispatch).await;
                        self.finalize_if_complete(dispatch).await;
                    }
                    None => break,
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(JobCommand::Cancel(reply)) => {
                        let cancelled = self.cancel(dispatch).await;
                        let _ = reply.send(cancelled);
                    }
                    None => commands_open = false,
                },
                _ = stall_check.tick() => self.check_stall(last_progress),
            }
        }
    }

    async fn apply(&mut self, outcome: UnitOutcome, dispatch: &mut Dispatch) {
        match outcome.unit {
            WorkUnit::Variant { index, params } => {
                let result = self.variant_result(index, params, outcome.result);
                let stored = self.store.append_variant(self.job.id, &result).await;
                insert_in_grid_order(&mut self.job.variants, result);
                match stored {
                    Ok(()) => self.complete_units(1, dispatch).await,
                    Err(e) => self.fail_store(&e, Some(&*dispatch)).await,
                }
            }
            WorkUnit::Train {
                fold,
                index,
                params,
            } => {
                let result = self.variant_result(index, params, outcome.result);
                if self.job.is_terminal() {
                    return;
                }
                let position = fold.fold_index;
                insert_in_grid_order(&mut dispatch.folds[position].results, result);
                self.complete_units(1, dispatch).await;
                if self.job.is_terminal() {
                    return;
                }
                let progress = &dispatch.folds[position];
                if progress.results.len() == progress.expected {
                    self.close_training(position, dispatch).await;
                }
            }
            WorkUnit::Test { fold, params } => {
                let (test_metrics, test_error) = match outcome.result {
                    Ok(metrics) => (Some(metrics), None),
                    Err(message) => {
                        warn!(
                            job_id = %self.job.id,
                            fold = fold.fold_index,
                            error = %message,
                            "Out-of-sample evaluation failed"
                        );
                        (None, Some(message))
                    }
                };
                let result = FoldResult {
                    fold,
                    best_params: Some(params),
                    train_objective_value: dispatch.folds[fold.fold_index].train_objective_value,
                    test_metrics,
                    test_error,
                };
                self.record_fold(result, dispatch).await;
            }
        }
    }

    fn variant_result(
        &self,
        index: usize,
        params: Variant,
        result: Result<VariantMetrics, String>,
    ) -> VariantResult {
        match result {
            Ok(metrics) => {
                debug!(job_id = %self.job.id, index, %params, "Unit completed");
                VariantResult {
                    index,
                    variant_params: params,
                    metrics,
                    error: None,
                }
            }
            Err(message) => {
                warn!(job_id = %self.job.id, index, %params, error = %message, "Unit failed");
                VariantResult {
                    index,
                    variant_params: params,
                    metrics: VariantMetrics::default(),
                    error: Some(message),
                }
            }
        }
    }

    /// Picks the fold's best training variant and dispatches its
    /// out-of-sample unit, or records a skipped fold when none qualifies.
    async fn close_training(&mut self, position: usize, dispatch: &mut Dispatch) {
        let objective = self
            .plan
            .walk_forward
            .map_or(Objective::FinalValue, |wf| wf.objective);
        let progress = &mut dispatch.folds[position];
        let fold = progress.fold;

        match ranking::best(&progress.results, objective) {
            Some(best) => {
                let params = best.variant_params.clone();
                progress.train_objective_value = best.metrics.objective_value(objective);
                info!(
                    job_id = %self.job.id,
                    fold = fold.fold_index,
                    %objective,
                    value = progress.train_objective_value,
                    %params,
                    "Fold training complete"
                );
                // training rows are not kept once a winner is chosen
                progress.results = Vec::new();
                dispatch.pool.submit(vec![WorkUnit::Test { fold, params }]);
            }
            None => {
                warn!(
                    job_id = %self.job.id,
                    fold = fold.fold_index,
                    %objective,
                    "No training variant produced the objective, skipping out-of-sample run"
                );
                progress.results = Vec::new();
                let result = FoldResult {
                    fold,
                    best_params: None,
                    train_objective_value: None,
                    test_metrics: None,
                    test_error: None,
                };
                self.record_fold(result, dispatch).await;
            }
        }
    }

    async fn record_fold(&mut self, result: FoldResult, dispatch: &Dispatch) {
        let stored = self.store.append_fold(self.job.id, &result).await;
        self.job.folds.push(result);
        self.job.folds.sort_by_key(|f| f.fold.fold_index);
        match stored {
            Ok(()) => self.complete_units(1, dispatch).await,
            Err(e) => self.fail_store(&e, Some(dispatch)).await,
        }
    }

    async fn complete_units(&mut self, units: usize, dispatch: &Dispatch) {
        let before = self.job.progress;
        self.job.record_completed(units, Utc::now());
        if self.job.progress != before && !self.job.all_units_completed() {
            // header writes follow whole-percent changes only
            if let Err(e) = self.store.save_header(&self.job).await {
                self.fail_store(&e, Some(dispatch)).await;
                return;
            }
        }
        self.publish();
    }

    // ============================================
    // Terminal transitions
    // ============================================

    async fn finalize_if_complete(&mut self, dispatch: &Dispatch) {
        if self.job.status == JobStatus::Running && self.job.all_units_completed() {
            self.finalize(dispatch).await;
        }
    }

    /// `running -> succeeded`. A no-op on a terminal job.
    async fn finalize(&mut self, dispatch: &Dispatch) {
        if self.job.is_terminal() {
            return;
        }

        let mut finished = self.job.clone();
        if finished.kind == JobKind::Optimization {
            if let Some(best) = ranking::best(&finished.variants, Objective::FinalValue) {
                finished.best_final_value = best.metrics.final_value;
                finished.best_params = Some(best.variant_params.clone());
            }
        }
        finished.succeed(Utc::now());

        if let Err(e) = self.store.save_header(&finished).await {
            self.fail_store(&e, Some(dispatch)).await;
            return;
        }

        self.job = finished;
        self.terminal_persisted = true;
        dispatch.pool.close();
        self.publish();
        info!(
            job_id = %self.job.id,
            completed = self.job.completed_units,
            best_final_value = self.job.best_final_value,
            "Job succeeded"
        );
    }

    async fn cancel(&mut self, dispatch: &Dispatch) -> bool {
        dispatch.pool.cancel();
        if self.job.is_terminal() {
            return false;
        }
        warn!(
            job_id = %self.job.id,
            completed = self.job.completed_units,
            total = self.job.total_units,
            "Job cancelled"
        );
        self.fail(JobError::cancelled(), Some(dispatch)).await;
        true
    }

    async fn fail_store(&mut self, err: &Error, dispatch: Option<&Dispatch>) {
        error!(job_id = %self.job.id, error = %err, "Result store write failed");
        self.fail(
            JobError::new(
                JobErrorCode::StoreUnavailable,
                format!("result store unavailable: {err:#}"),
            ),
            dispatch,
        )
        .await;
    }

    /// `queued | running -> failed`. Already-written results stay in place.
    async fn fail(&mut self, err: JobError, dispatch: Option<&Dispatch>) {
        if let Some(dispatch) = dispatch {
            dispatch.pool.cancel();
        }
        if !self.job.fail(err, Utc::now()) {
            return;
        }
        match self.store.save_header(&self.job).await {
            Ok(()) => self.terminal_persisted = true,
            Err(e) => {
                error!(job_id = %self.job.id, error = %e, "Failed job header write failed");
            }
        }
        self.publish();
        info!(
            job_id = %self.job.id,
            error = ?self.job.error,
            "Job failed"
        );
    }

    fn check_stall(&mut self, last_progress: Instant) {
        if self.job.status != JobStatus::Running || self.job.stalled {
            return;
        }
        let idle = last_progress.elapsed();
        if idle >= self.stall_window {
            self.job.stalled = true;
            warn!(
                job_id = %self.job.id,
                idle_secs = idle.as_secs(),
                completed = self.job.completed_units,
                total = self.job.total_units,
                "Job stalled: no unit completed within the stall window"
            );
            self.publish();
        }
    }

    fn publish(&self) {
        self.job_tx.send_replace(self.job.clone());
    }
}

/// Keeps results sorted by grid index whatever order workers finish in, so
/// ranking ties resolve to the earlier variant.
fn insert_in_grid_order(results: &mut Vec<VariantResult>, result: VariantResult) {
    let at = results.partition_point(|r| r.index < result.index);
    results.insert(at, result);
}
