use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use stratlab_core::{FoldResult, Job, JobId, JobSummary, ResultStore, VariantResult};
use tokio::sync::RwLock;

#[derive(Debug)]
struct StoredJob {
    header: Job,
    variants: Vec<VariantResult>,
    folds: Vec<FoldResult>,
}

/// Process-local [`ResultStore`]. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    jobs: RwLock<HashMap<JobId, StoredJob>>,
}

impl MemoryResultStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save_header(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => stored.header = job.header(),
            None => {
                jobs.insert(
                    job.id,
                    StoredJob {
                        header: job.header(),
                        variants: Vec::new(),
                        folds: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn append_variant(&self, job_id: JobId, result: &VariantResult) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("no header saved for job {job_id}"))?;
        stored.variants.retain(|v| v.index != result.index);
        stored.variants.push(result.clone());
        Ok(())
    }

    async fn append_fold(&self, job_id: JobId, result: &FoldResult) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("no header saved for job {job_id}"))?;
        stored
            .folds
            .retain(|f| f.fold.fold_index != result.fold.fold_index);
        stored.folds.push(result.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&job_id).map(|stored| {
            let mut job = stored.header.clone();
            job.variants = stored.variants.clone();
            job.variants.sort_by_key(|v| v.index);
            job.folds = stored.folds.clone();
            job.folds.sort_by_key(|f| f.fold.fold_index);
            job
        }))
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let jobs = self.jobs.read().await;
        let mut summaries: Vec<JobSummary> = jobs.values().map(|s| s.header.summary()).collect();
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(summaries)
    }
}
