//! `optimize` and `walk-forward`: submit a job, poll it to completion, and
//! print the final job as JSON.

use super::context::{load_config, load_request, open_registry};
use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use stratlab_core::{Job, JobId, JobStatus, Objective, WalkForwardSpec, WindowSpec};
use stratlab_orchestrator::JobRegistry;
use tracing::{info, warn};

/// Arguments for the optimize command.
#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// JSON file holding the sweep request
    #[arg(short, long)]
    pub request: PathBuf,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub poll_ms: u64,
}

/// Arguments for the walk-forward command.
#[derive(Args, Debug, Clone)]
pub struct WalkForwardArgs {
    #[command(flatten)]
    pub submit: SubmitArgs,

    /// Training window length in months
    #[arg(long, default_value_t = 12)]
    pub train: i32,

    /// Test window length in months
    #[arg(long, default_value_t = 3)]
    pub test: i32,

    /// Months between consecutive folds
    #[arg(long, default_value_t = 3)]
    pub step: i32,

    /// Training objective: final, sharpe or pf
    #[arg(long, default_value = "final")]
    pub objective: Objective,
}

/// Runs the optimize command.
///
/// # Errors
/// Returns an error if the request is invalid, the store cannot be opened,
/// or the job ends in `failed`.
pub async fn run_optimize(args: SubmitArgs, profile: Option<&str>) -> Result<()> {
    let config = load_config(profile)?;
    let request = load_request(&args.request)?;
    let registry = open_registry(config).await?;

    let job_id = registry.submit_optimization(request).await?;
    let job = poll_until_terminal(&registry, job_id, args.poll_ms).await?;
    report(&job)
}

/// Runs the walk-forward command.
///
/// # Errors
/// Returns an error if the request is invalid, the store cannot be opened,
/// or the job ends in `failed`.
pub async fn run_walk_forward(args: WalkForwardArgs, profile: Option<&str>) -> Result<()> {
    let config = load_config(profile)?;
    let request = load_request(&args.submit.request)?;
    let registry = open_registry(config).await?;

    let spec = WalkForwardSpec {
        windows: WindowSpec {
            train_months: args.train,
            test_months: args.test,
            step_months: args.step,
        },
        objective: args.objective,
    };
    let job_id = registry.submit_walk_forward(request, spec).await?;
    let job = poll_until_terminal(&registry, job_id, args.submit.poll_ms).await?;

    if let Some(summary) = job.walk_forward_summary() {
        eprintln!(
            "folds: {} evaluated, {} skipped of {}; distinct best params: {}",
            summary.folds_evaluated,
            summary.folds_skipped,
            summary.folds_total,
            summary.distinct_best_params
        );
        if let Some(mean) = summary.mean_oos_final_value {
            eprintln!("mean out-of-sample final value: {mean:.2}");
        }
    }
    report(&job)
}

/// Polls `get_job` until the job is terminal. The first Ctrl-C cancels the
/// job; polling continues until the cancellation is visible.
async fn poll_until_terminal(registry: &JobRegistry, job_id: JobId, poll_ms: u64) -> Result<Job> {
    info!(%job_id, "Waiting for job");

    let mut ticker = tokio::time::interval(Duration::from_millis(poll_ms.max(50)));
    let mut last_progress = None;
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let job = registry.get_job(job_id).await?;
                if last_progress != Some(job.progress) {
                    eprintln!("{}", progress_line(&job));
                    last_progress = Some(job.progress);
                }
                if job.is_terminal() {
                    return Ok(job);
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                signal?;
                cancel_sent = true;
                warn!(%job_id, "Interrupted, cancelling job");
                registry.cancel_job(job_id).await?;
            }
        }
    }
}

fn progress_line(job: &Job) -> String {
    let mut line = format!(
        "[{}] {:>3}% ({}/{} units)",
        job.status, job.progress, job.completed_units, job.total_units
    );
    if job.stalled {
        line.push_str(" stalled");
    }
    line
}

fn report(job: &Job) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(job)?);
    if job.status == JobStatus::Failed {
        match &job.error {
            Some(error) => bail!("job {} failed: {error}", job.id),
            None => bail!("job {} failed", job.id),
        }
    }
    Ok(())
}
