//! Ordering of variant results by objective.

use std::cmp::Ordering;
use stratlab_core::{Job, Objective, VariantResult};

/// Descending order with `None` below every number.
fn desc_nulls_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ascending order with `None` above every number.
fn asc_nulls_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort of `results` by `objective`, best first, nulls last.
///
/// Results with equal objective values keep their input order.
#[must_use]
pub fn rank(results: &[VariantResult], objective: Objective) -> Vec<&VariantResult> {
    let mut ranked: Vec<&VariantResult> = results.iter().collect();
    ranked.sort_by(|a, b| {
        desc_nulls_last(
            a.metrics.objective_value(objective),
            b.metrics.objective_value(objective),
        )
    });
    ranked
}

/// The best result with a non-null objective.
///
/// Exact ties on the objective go to the lower `maxdd` (a null `maxdd`
/// loses to any number), then to the earlier result.
#[must_use]
pub fn best(results: &[VariantResult], objective: Objective) -> Option<&VariantResult> {
    results
        .iter()
        .filter(|r| r.metrics.objective_value(objective).is_some())
        .min_by(|a, b| {
            desc_nulls_last(
                a.metrics.objective_value(objective),
                b.metrics.objective_value(objective),
            )
            .then_with(|| asc_nulls_last(a.metrics.maxdd, b.metrics.maxdd))
        })
}

/// Up to `limit` results of `job` with a non-null objective, best first.
#[must_use]
pub fn top_variants(job: &Job, objective: Objective, limit: usize) -> Vec<&VariantResult> {
    rank(&job.variants, objective)
        .into_iter()
        .take_while(|r| r.metrics.objective_value(objective).is_some())
        .take(limit)
        .collect()
}
