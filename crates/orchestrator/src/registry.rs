use crate::controller::JobController;
use crate::executor::{TokioPoolFactory, WorkerPoolFactory};
use crate::handle::JobHandle;
use crate::plan::JobPlan;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stratlab_core::{
    BacktestRunner, EngineConfig, EngineError, Job, JobDefinition, JobId, JobKind, JobSummary,
    Objective, ResultStore, SweepRequest, VariantResult, WalkForwardSpec,
};
use stratlab_sweep::ranking;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Job submission and query surface.
///
/// Each accepted job gets its own [`JobController`] task and worker pool.
/// A finished job is dropped from memory once its terminal state is stored;
/// from then on it is answered from the result store.
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
    runner: Arc<dyn BacktestRunner>,
    store: Arc<dyn ResultStore>,
    pools: Arc<dyn WorkerPoolFactory>,
    config: EngineConfig,
}

impl JobRegistry {
    /// Creates a registry that runs units on in-process tokio pools.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn BacktestRunner>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let pools = Arc::new(TokioPoolFactory::new(Arc::clone(&runner)));
        Self::with_pool_factory(config, runner, store, pools)
    }

    /// Creates a registry with a custom scheduling backend.
    #[must_use]
    pub fn with_pool_factory(
        config: EngineConfig,
        runner: Arc<dyn BacktestRunner>,
        store: Arc<dyn ResultStore>,
        pools: Arc<dyn WorkerPoolFactory>,
    ) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            runner,
            store,
            pools,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and starts an optimization job.
    ///
    /// # Errors
    /// Returns a validation error without creating a job.
    pub async fn submit_optimization(&self, request: SweepRequest) -> Result<JobId, EngineError> {
        self.submit(JobDefinition {
            request,
            walk_forward: None,
        })
        .await
    }

    /// Validates and starts a walk-forward job.
    ///
    /// # Errors
    /// Returns a validation error without creating a job.
    pub async fn submit_walk_forward(
        &self,
        request: SweepRequest,
        walk_forward: WalkForwardSpec,
    ) -> Result<JobId, EngineError> {
        self.submit(JobDefinition {
            request,
            walk_forward: Some(walk_forward),
        })
        .await
    }

    async fn submit(&self, definition: JobDefinition) -> Result<JobId, EngineError> {
        let plan = JobPlan::prepare(&definition, &self.config)?;

        let job = Job::new(Uuid::new_v4(), definition, Utc::now());
        let job_id = job.id;
        let kind = job.kind;

        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let (job_tx, job_rx) = watch::channel(job.clone());
        let handle = JobHandle::new(job_id, tx, job_rx);

        let controller = JobController::new(
            job,
            plan,
            Arc::clone(&self.runner),
            Arc::clone(&self.store),
            Arc::clone(&self.pools),
            rx,
            job_tx,
            Duration::from_secs(self.config.stall_window_secs),
        );

        self.jobs.write().await.insert(job_id, handle);
        let task = tokio::spawn(controller.run());
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            match task.await {
                Ok(true) => {
                    jobs.write().await.remove(&job_id);
                    debug!(%job_id, "Released finished job from memory");
                }
                Ok(false) => {
                    warn!(%job_id, "Keeping finished job in memory, stored copy is stale");
                }
                Err(e) => error!(%job_id, error = %e, "Job controller task aborted"),
            }
        });

        info!(%job_id, kind = kind.as_str(), "Job submitted");
        Ok(job_id)
    }

    /// Latest state of a job, including partial results mid-run.
    ///
    /// # Errors
    /// `JobNotFound` if neither the registry nor the store knows the id,
    /// `Store` if the store lookup fails.
    pub async fn get_job(&self, job_id: JobId) -> Result<Job, EngineError> {
        if let Some(handle) = self.jobs.read().await.get(&job_id) {
            return Ok(handle.snapshot());
        }
        self.store
            .load_job(job_id)
            .await
            .map_err(|e| EngineError::Store(format!("{e:#}")))?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Handle for waiting on or subscribing to a job held in memory.
    /// `None` once a finished job has been released to the store.
    pub async fn handle(&self, job_id: JobId) -> Option<JobHandle> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Requests cancellation. Returns `true` if the job moved to `failed`,
    /// `false` if it had already finished.
    ///
    /// # Errors
    /// `JobNotFound` for an unknown id.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, EngineError> {
        let handle = self.handle(job_id).await;
        match handle {
            Some(handle) => {
                // a dropped reply means the controller already exited
                let cancelled = handle.cancel().await.unwrap_or(false);
                info!(%job_id, cancelled, "Cancel requested");
                Ok(cancelled)
            }
            None => {
                // a stored job is not running in this process
                self.get_job(job_id).await.map(|_| false)
            }
        }
    }

    /// Summaries of known jobs, newest first, optionally filtered by kind.
    ///
    /// # Errors
    /// `Store` if the store listing fails.
    pub async fn list_jobs(&self, kind: Option<JobKind>) -> Result<Vec<JobSummary>, EngineError> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .read()
            .await
            .values()
            .map(|handle| handle.snapshot().summary())
            .collect();

        let stored = self
            .store
            .list_jobs()
            .await
            .map_err(|e| EngineError::Store(format!("{e:#}")))?;
        for summary in stored {
            if !summaries.iter().any(|s| s.id == summary.id) {
                summaries.push(summary);
            }
        }

        summaries.retain(|s| kind.map_or(true, |k| s.kind == k));
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(summaries)
    }

    /// Running jobs with no unit completed within the stall window.
    pub async fn stalled_jobs(&self) -> Vec<JobSummary> {
        self.jobs
            .read()
            .await
            .values()
            .map(JobHandle::snapshot)
            .filter(|job| job.stalled)
            .map(|job| job.summary())
            .collect()
    }

    /// Best `limit` optimization variants of a job by `objective`.
    ///
    /// # Errors
    /// See [`get_job`](Self::get_job).
    pub async fn top_variants(
        &self,
        job_id: JobId,
        objective: Objective,
        limit: usize,
    ) -> Result<Vec<VariantResult>, EngineError> {
        let job = self.get_job(job_id).await?;
        Ok(ranking::top_variants(&job, objective, limit)
            .into_iter()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use stratlab_core::{
        DateRange, EvaluationRequest, ExecutionParams, FoldResult, ParameterRange, VariantMetrics,
    };
    use tokio::sync::Mutex;

    struct FlatRunner;

    #[async_trait]
    impl BacktestRunner for FlatRunner {
        async fn evaluate(&self, _request: &EvaluationRequest) -> Result<VariantMetrics> {
            Ok(VariantMetrics {
                final_value: Some(10_000.0),
                ..VariantMetrics::default()
            })
        }

        async fn data_span(&self, _instrument_id: i64, _bar: &str) -> Result<DateRange> {
            Ok(DateRange::new(
                NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            ))
        }
    }

    /// Keeps only headers, enough for lookups of jobs not in memory.
    #[derive(Default)]
    struct HeaderStore {
        headers: Mutex<HashMap<JobId, Job>>,
    }

    #[async_trait]
    impl ResultStore for HeaderStore {
        async fn save_header(&self, job: &Job) -> Result<()> {
            self.headers.lock().await.insert(job.id, job.clone());
            Ok(())
        }

        async fn append_variant(&self, _job_id: JobId, _result: &VariantResult) -> Result<()> {
            Ok(())
        }

        async fn append_fold(&self, _job_id: JobId, _result: &FoldResult) -> Result<()> {
            Ok(())
        }

        async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
            Ok(self.headers.lock().await.get(&job_id).cloned())
        }

        async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
            Ok(self.headers.lock().await.values().map(Job::summary).collect())
        }
    }

    /// Rejects every terminal header.
    #[derive(Default)]
    struct NoTerminalStore {
        inner: HeaderStore,
    }

    #[async_trait]
    impl ResultStore for NoTerminalStore {
        async fn save_header(&self, job: &Job) -> Result<()> {
            if job.is_terminal() {
                anyhow::bail!("read-only database");
            }
            self.inner.save_header(job).await
        }

        async fn append_variant(&self, job_id: JobId, result: &VariantResult) -> Result<()> {
            self.inner.append_variant(job_id, result).await
        }

        async fn append_fold(&self, job_id: JobId, result: &FoldResult) -> Result<()> {
            self.inner.append_fold(job_id, result).await
        }

        async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
            self.inner.load_job(job_id).await
        }

        async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
            self.inner.list_jobs().await
        }
    }

    async fn released(registry: &JobRegistry, id: JobId) -> bool {
        for _ in 0..1_000 {
            if registry.handle(id).await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn registry() -> JobRegistry {
        JobRegistry::new(
            EngineConfig::default(),
            Arc::new(FlatRunner),
            Arc::new(HeaderStore::default()),
        )
    }

    fn request(constraint: Option<&str>) -> SweepRequest {
        SweepRequest {
            strategy_id: 1,
            instrument_id: 1,
            bar: "1h".to_string(),
            param_ranges: vec![("p".to_string(), ParameterRange::new(1.0, 3.0, 1.0))],
            constraint: constraint.map(str::to_string),
            execution: ExecutionParams::default(),
        }
    }

    #[tokio::test]
    async fn registry_lists_nothing_initially() {
        let registry = registry();
        assert!(registry.list_jobs(None).await.unwrap().is_empty());
        assert!(registry.stalled_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_submission_creates_no_job() {
        let registry = registry();
        let err = registry
            .submit_optimization(request(Some("q > 1")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_constraint");
        assert!(registry.list_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = registry();
        let id = Uuid::new_v4();
        assert_eq!(registry.get_job(id).await.unwrap_err(), EngineError::JobNotFound(id));
        assert!(registry.cancel_job(id).await.is_err());
    }

    #[tokio::test]
    async fn list_jobs_filters_by_kind() {
        let registry = registry();
        let opt = registry.submit_optimization(request(None)).await.unwrap();
        let wf = registry
            .submit_walk_forward(request(None), WalkForwardSpec::default())
            .await
            .unwrap();

        let all = registry.list_jobs(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let optimizations = registry.list_jobs(Some(JobKind::Optimization)).await.unwrap();
        assert_eq!(optimizations.len(), 1);
        assert_eq!(optimizations[0].id, opt);

        let walk_forwards = registry.list_jobs(Some(JobKind::WalkForward)).await.unwrap();
        assert_eq!(walk_forwards[0].id, wf);
    }

    #[tokio::test]
    async fn stored_job_is_served_after_registry_restart() {
        let store = Arc::new(HeaderStore::default());
        let first = JobRegistry::new(EngineConfig::default(), Arc::new(FlatRunner), store.clone());
        let id = first.submit_optimization(request(None)).await.unwrap();
        first.handle(id).await.unwrap().wait_terminal().await.unwrap();

        let second = JobRegistry::new(EngineConfig::default(), Arc::new(FlatRunner), store);
        let job = second.get_job(id).await.unwrap();
        assert!(job.is_terminal());
        assert!(!second.cancel_job(id).await.unwrap());
        assert_eq!(second.list_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finished_job_is_released_to_the_store() {
        let registry = registry();
        let id = registry.submit_optimization(request(None)).await.unwrap();
        let handle = registry.handle(id).await.unwrap();
        handle.wait_terminal().await.unwrap();

        assert!(released(&registry, id).await);
        let job = registry.get_job(id).await.unwrap();
        assert!(job.is_terminal());
        assert_eq!(registry.list_jobs(None).await.unwrap().len(), 1);
        assert!(!registry.cancel_job(id).await.unwrap());
    }

    #[tokio::test]
    async fn job_with_unstored_terminal_state_stays_in_memory() {
        let registry = JobRegistry::new(
            EngineConfig::default(),
            Arc::new(FlatRunner),
            Arc::new(NoTerminalStore::default()),
        );
        let id = registry.submit_optimization(request(None)).await.unwrap();
        let handle = registry.handle(id).await.unwrap();
        let job = handle.wait_terminal().await.unwrap();
        assert_eq!(job.error.unwrap().code, stratlab_core::JobErrorCode::StoreUnavailable);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.handle(id).await.is_some());
        assert!(registry.get_job(id).await.unwrap().is_terminal());
    }
}
