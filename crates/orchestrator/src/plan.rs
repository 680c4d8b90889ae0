//! Synchronous validation of a job definition before a job is created.

use rust_decimal::Decimal;
use stratlab_core::{EngineConfig, EngineError, JobDefinition, Objective};
use stratlab_sweep::{ParameterGrid, WindowScheduler};
use tracing::warn;

/// Walk-forward settings that passed validation.
#[derive(Debug, Clone, Copy)]
pub struct WalkForwardPlan {
    pub scheduler: WindowScheduler,
    pub objective: Objective,
}

/// Everything a controller needs that can be checked without I/O.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub grid: ParameterGrid,
    pub walk_forward: Option<WalkForwardPlan>,
    /// Worker pool size after defaults and caps.
    pub concurrency: usize,
}

impl JobPlan {
    /// Validates `definition` against the engine limits.
    ///
    /// # Errors
    /// Any validation error from the grid, the window spec, or the execution
    /// parameters. With an explicit date range, a span too short for one fold
    /// fails here with `InsufficientHistory`.
    pub fn prepare(definition: &JobDefinition, config: &EngineConfig) -> Result<Self, EngineError> {
        let request = &definition.request;
        let execution = &request.execution;

        if request.bar.trim().is_empty() {
            return Err(EngineError::InvalidRequest("bar must not be empty".to_string()));
        }
        if execution.cash <= Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!(
                "cash must be > 0, got {}",
                execution.cash
            )));
        }
        if execution.commission < Decimal::ZERO {
            return Err(EngineError::InvalidRequest(format!(
                "commission must be >= 0, got {}",
                execution.commission
            )));
        }
        if execution.slippage.perc < Decimal::ZERO || execution.slippage.fixed < Decimal::ZERO {
            return Err(EngineError::InvalidRequest(
                "slippage must be >= 0".to_string(),
            ));
        }
        if let Some(range) = execution.date_range {
            if range.is_empty() {
                return Err(EngineError::InvalidRequest(format!(
                    "date range {range} is empty"
                )));
            }
        }

        let grid = ParameterGrid::build(
            &request.param_ranges,
            request.constraint.as_deref(),
            config.max_variants,
        )?;

        let walk_forward = match definition.walk_forward {
            Some(spec) => {
                let scheduler = WindowScheduler::new(&spec.windows)?;
                if let Some(range) = execution.date_range {
                    if scheduler.folds(range.start, range.end).next().is_none() {
                        return Err(EngineError::InsufficientHistory(format!(
                            "{range} is shorter than {} training plus {} test months",
                            spec.windows.train_months, spec.windows.test_months
                        )));
                    }
                }
                Some(WalkForwardPlan {
                    scheduler,
                    objective: spec.objective,
                })
            }
            None => None,
        };

        let ceiling = config.max_maxcpus.max(1);
        let requested = execution.maxcpus.unwrap_or(config.default_maxcpus);
        let concurrency = requested.clamp(1, ceiling);
        if requested > ceiling {
            warn!(requested, ceiling, "maxcpus above engine ceiling, clamping");
        }

        Ok(Self {
            grid,
            walk_forward,
            concurrency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use stratlab_core::{
        DateRange, ExecutionParams, ParameterRange, SweepRequest, WalkForwardSpec, WindowSpec,
    };

    fn definition() -> JobDefinition {
        JobDefinition {
            request: SweepRequest {
                strategy_id: 1,
                instrument_id: 2,
                bar: "1d".to_string(),
                param_ranges: vec![
                    ("fast".to_string(), ParameterRange::new(1.0, 3.0, 1.0)),
                    ("slow".to_string(), ParameterRange::new(2.0, 4.0, 1.0)),
                ],
                constraint: Some("fast < slow".to_string()),
                execution: ExecutionParams::default(),
            },
            walk_forward: None,
        }
    }

    fn range(from: (i32, u32), to: (i32, u32)) -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(from.0, from.1, 1).unwrap(),
            NaiveDate::from_ymd_opt(to.0, to.1, 1).unwrap(),
        )
    }

    #[test]
    fn valid_definition_plans() {
        let plan = JobPlan::prepare(&definition(), &EngineConfig::default()).unwrap();
        assert_eq!(plan.grid.total_variants(), 9);
        assert_eq!(plan.concurrency, 1);
        assert!(plan.walk_forward.is_none());
    }

    #[test]
    fn maxcpus_is_clamped() {
        let config = EngineConfig {
            max_maxcpus: 8,
            ..EngineConfig::default()
        };
        let mut def = definition();
        def.request.execution.maxcpus = Some(64);
        assert_eq!(JobPlan::prepare(&def, &config).unwrap().concurrency, 8);
        def.request.execution.maxcpus = Some(0);
        assert_eq!(JobPlan::prepare(&def, &config).unwrap().concurrency, 1);
    }

    #[test]
    fn bad_execution_params_are_rejected() {
        let mut def = definition();
        def.request.execution.cash = dec!(0);
        assert_eq!(
            JobPlan::prepare(&def, &EngineConfig::default()).unwrap_err().code(),
            "invalid_request"
        );

        let mut def = definition();
        def.request.execution.commission = dec!(-0.01);
        assert!(JobPlan::prepare(&def, &EngineConfig::default()).is_err());

        let mut def = definition();
        def.request.bar = " ".to_string();
        assert!(JobPlan::prepare(&def, &EngineConfig::default()).is_err());
    }

    #[test]
    fn grid_errors_surface() {
        let mut def = definition();
        def.request.constraint = Some("fast <<".to_string());
        assert_eq!(
            JobPlan::prepare(&def, &EngineConfig::default()).unwrap_err().code(),
            "invalid_constraint"
        );

        let config = EngineConfig {
            max_variants: 4,
            ..EngineConfig::default()
        };
        assert_eq!(
            JobPlan::prepare(&definition(), &config).unwrap_err().code(),
            "grid_too_large"
        );
    }

    #[test]
    fn walk_forward_windows_are_validated() {
        let mut def = definition();
        def.walk_forward = Some(WalkForwardSpec {
            windows: WindowSpec {
                train_months: 0,
                test_months: 3,
                step_months: 3,
            },
            objective: Objective::Sharpe,
        });
        assert_eq!(
            JobPlan::prepare(&def, &EngineConfig::default()).unwrap_err().code(),
            "invalid_window"
        );
    }

    #[test]
    fn explicit_short_range_is_insufficient_history() {
        let mut def = definition();
        def.walk_forward = Some(WalkForwardSpec::default());
        def.request.execution.date_range = Some(range((2023, 1), (2023, 10)));
        assert_eq!(
            JobPlan::prepare(&def, &EngineConfig::default()).unwrap_err().code(),
            "insufficient_history"
        );

        def.request.execution.date_range = Some(range((2022, 1), (2023, 4)));
        let plan = JobPlan::prepare(&def, &EngineConfig::default()).unwrap();
        assert_eq!(plan.walk_forward.unwrap().objective, Objective::FinalValue);
    }

    #[test]
    fn empty_date_range_is_rejected() {
        let mut def = definition();
        def.request.execution.date_range = Some(range((2023, 5), (2023, 5)));
        assert_eq!(
            JobPlan::prepare(&def, &EngineConfig::default()).unwrap_err().code(),
            "invalid_request"
        );
    }
}
