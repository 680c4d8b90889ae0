use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use stratlab_core::{
    DatabaseConfig, FoldResult, Job, JobId, JobSummary, ResultStore, VariantResult,
};
use tracing::info;

/// `SQLite`-backed [`ResultStore`].
///
/// Job headers are upserted into `jobs`; variant and fold rows go to
/// `variant_results` and `fold_results`. Rows are stored as JSON next to the
/// columns used for ordering and filtering.
#[derive(Clone)]
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    /// Opens (creating if missing) the database at `config.url` and runs
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid, the connection fails, or
    /// migrations fail.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("invalid database url {}", config.url))?
            .create_if_missing(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", config.url))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running result store migrations")?;

        info!(url = %config.url, "Result store ready");
        Ok(Self { pool })
    }

    /// Creates an in-memory database.
    ///
    /// The pool is pinned to a single long-lived connection, since every
    /// `SQLite` memory connection is its own database.
    ///
    /// # Errors
    ///
    /// Returns error if connection or migrations fail.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    async fn load_rows<T>(&self, sql: &str, job_id: JobId) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let rows = sqlx::query_as::<_, (String,)>(sql)
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (json,) in rows {
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save_header(&self, job: &Job) -> Result<()> {
        let header_json = serde_json::to_string(&job.header())?;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r"
            INSERT INTO jobs (job_id, kind, status, progress, submitted_at, updated_at, header_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                updated_at = excluded.updated_at,
                header_json = excluded.header_json
            ",
        )
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(i64::from(job.progress))
        .bind(job.submitted_at.timestamp_millis())
        .bind(now)
        .bind(header_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("saving header for job {}", job.id))?;

        Ok(())
    }

    async fn append_variant(&self, job_id: JobId, result: &VariantResult) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        let index = i64::try_from(result.index)?;

        sqlx::query(
            r"
            INSERT INTO variant_results (job_id, variant_index, final_value, error, result_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(job_id, variant_index) DO UPDATE SET
                final_value = excluded.final_value,
                error = excluded.error,
                result_json = excluded.result_json
            ",
        )
        .bind(job_id.to_string())
        .bind(index)
        .bind(result.metrics.final_value)
        .bind(result.error.as_deref())
        .bind(result_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("appending variant {} for job {job_id}", result.index))?;

        Ok(())
    }

    async fn append_fold(&self, job_id: JobId, result: &FoldResult) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        let index = i64::try_from(result.fold.fold_index)?;

        sqlx::query(
            r"
            INSERT INTO fold_results (job_id, fold_index, result_json)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(job_id, fold_index) DO UPDATE SET
                result_json = excluded.result_json
            ",
        )
        .bind(job_id.to_string())
        .bind(index)
        .bind(result_json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("appending fold {} for job {job_id}", result.fold.fold_index))?;

        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT header_json FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading job {job_id}"))?;

        let Some((header_json,)) = row else {
            return Ok(None);
        };
        let mut job: Job = serde_json::from_str(&header_json)?;

        job.variants = self
            .load_rows(
                "SELECT result_json FROM variant_results WHERE job_id = ?1 ORDER BY variant_index",
                job_id,
            )
            .await?;
        job.folds = self
            .load_rows(
                "SELECT result_json FROM fold_results WHERE job_id = ?1 ORDER BY fold_index",
                job_id,
            )
            .await?;

        Ok(Some(job))
    }

    async fn list_jobs(&self) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT header_json FROM jobs ORDER BY submitted_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing jobs")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (header_json,) in rows {
            let job: Job = serde_json::from_str(&header_json)?;
            summaries.push(job.summary());
        }

        Ok(summaries)
    }
}
