//! `jobs` and `show`: read-only views over stored jobs.

use super::context::{load_config, open_registry};
use anyhow::{anyhow, Result};
use clap::Args;
use stratlab_core::{JobKind, JobSummary, Objective, VariantResult};
use uuid::Uuid;

/// Arguments for the jobs command.
#[derive(Args, Debug, Clone)]
pub struct JobsArgs {
    /// Only list jobs of this kind (optimization or walk_forward)
    #[arg(long, value_parser = parse_kind)]
    pub kind: Option<JobKind>,
}

/// Arguments for the show command.
#[derive(Args, Debug, Clone)]
pub struct ShowArgs {
    /// Job id
    pub id: Uuid,

    /// Number of ranked variants to print
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    /// Ranking objective: final, sharpe or pf
    #[arg(long, default_value = "final")]
    pub objective: Objective,

    /// Print the full job as JSON instead
    #[arg(long)]
    pub json: bool,
}

fn parse_kind(s: &str) -> Result<JobKind> {
    JobKind::parse(s).ok_or_else(|| anyhow!("unknown job kind `{s}`"))
}

/// Runs the jobs command.
///
/// # Errors
/// Returns an error if the store cannot be opened or read.
pub async fn run_jobs(args: JobsArgs, profile: Option<&str>) -> Result<()> {
    let registry = open_registry(load_config(profile)?).await?;
    let jobs = registry.list_jobs(args.kind).await?;

    if jobs.is_empty() {
        println!("no jobs");
    }
    for summary in &jobs {
        println!("{}", format_summary(summary));
    }
    Ok(())
}

/// Runs the show command.
///
/// # Errors
/// Returns an error if the store cannot be opened or the job is unknown.
pub async fn run_show(args: ShowArgs, profile: Option<&str>) -> Result<()> {
    let registry = open_registry(load_config(profile)?).await?;
    let job = registry.get_job(args.id).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("{}", format_summary(&job.summary()));
    if let Some(error) = &job.error {
        println!("error: {error}");
    }
    if let Some(params) = &job.best_params {
        println!("best: {params}");
    }

    let top = registry
        .top_variants(args.id, args.objective, args.top)
        .await?;
    for (rank, result) in top.iter().enumerate() {
        println!("{}", format_variant(rank + 1, result, args.objective));
    }

    if let Some(summary) = job.walk_forward_summary() {
        println!(
            "folds: {} evaluated, {} skipped of {}; distinct best params: {}",
            summary.folds_evaluated,
            summary.folds_skipped,
            summary.folds_total,
            summary.distinct_best_params
        );
        for fold in &job.folds {
            let oos = fold
                .test_metrics
                .as_ref()
                .and_then(|m| m.final_value)
                .map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
            let params = fold
                .best_params
                .as_ref()
                .map_or_else(|| "skipped".to_string(), ToString::to_string);
            println!(
                "fold {:>3}  test {}  oos_final {oos}  {params}",
                fold.fold.fold_index,
                fold.fold.test_range()
            );
        }
    }
    Ok(())
}

fn format_summary(summary: &JobSummary) -> String {
    let best = summary
        .best_final_value
        .map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    format!(
        "{}  {:<12} {:<9} {:>3}%  strategy={} instrument={} bar={}  best={best}  submitted {}",
        summary.id,
        summary.kind.as_str(),
        summary.status,
        summary.progress,
        summary.strategy_id,
        summary.instrument_id,
        summary.bar,
        summary.submitted_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

fn format_variant(rank: usize, result: &VariantResult, objective: Objective) -> String {
    let value = result
        .metrics
        .objective_value(objective)
        .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
    format!("{rank:>4}. {objective}={value}  {}", result.variant_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratlab_core::{ParamValue, Variant, VariantMetrics};

    #[test]
    fn kind_flag_parses() {
        assert_eq!(parse_kind("walk_forward").unwrap(), JobKind::WalkForward);
        assert!(parse_kind("sweep").is_err());
    }

    #[test]
    fn variant_line_shows_objective() {
        let result = VariantResult {
            index: 4,
            variant_params: Variant::new(vec![("period".to_string(), ParamValue::Int(20))]),
            metrics: VariantMetrics {
                sharpe: Some(1.23456),
                ..VariantMetrics::default()
            },
            error: None,
        };
        assert_eq!(
            format_variant(1, &result, Objective::Sharpe),
            "   1. sharpe=1.2346  period=20"
        );
    }
}
