use crate::commands::JobCommand;
use anyhow::{Context, Result};
use stratlab_core::{Job, JobId};
use tokio::sync::{mpsc, oneshot, watch};

/// Cloneable reference to a running job controller.
///
/// Reads go through the watch channel and never wait on the controller.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    tx: mpsc::Sender<JobCommand>,
    job_rx: watch::Receiver<Job>,
}

impl JobHandle {
    #[must_use]
    pub const fn new(id: JobId, tx: mpsc::Sender<JobCommand>, job_rx: watch::Receiver<Job>) -> Self {
        Self { id, tx, job_rx }
    }

    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Latest published state of the job.
    #[must_use]
    pub fn snapshot(&self) -> Job {
        self.job_rx.borrow().clone()
    }

    /// Asks the controller to cancel the job.
    ///
    /// A controller that already exited has finished the job, so a closed
    /// channel is reported as `Ok(false)`.
    ///
    /// # Errors
    /// Returns an error if the controller dropped the reply channel.
    pub async fn cancel(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(JobCommand::Cancel(tx)).await.is_err() {
            return Ok(false);
        }
        rx.await.context("job controller dropped cancel reply")
    }

    /// Waits until the job reaches `succeeded` or `failed`.
    ///
    /// # Errors
    /// Returns an error if the controller exits without publishing a terminal state.
    pub async fn wait_terminal(&self) -> Result<Job> {
        let mut rx = self.job_rx.clone();
        let job = rx
            .wait_for(Job::is_terminal)
            .await
            .context("job controller exited before the job finished")?;
        Ok(job.clone())
    }

    /// Subscribes to every published state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.job_rx.clone()
    }
}
