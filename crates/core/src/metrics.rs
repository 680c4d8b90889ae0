//! Metrics record returned by the backtest runner and the ranking objectives
//! defined over it.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output of a single backtest run.
///
/// Every field is optional: a run that closed no trades, or failed outright,
/// leaves the fields it could not compute as `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantMetrics {
    pub final_value: Option<f64>,
    pub sharpe: Option<f64>,
    pub maxdd: Option<f64>,
    pub winrate: Option<f64>,
    pub profit_factor: Option<f64>,
    pub sqn: Option<f64>,
    pub total_trades: Option<u32>,
    pub won_count: Option<u32>,
    pub lost_count: Option<u32>,
    pub long_count: Option<u32>,
    pub short_count: Option<u32>,
    pub best_pnl: Option<f64>,
    pub worst_pnl: Option<f64>,
    pub avg_pnl: Option<f64>,
}

impl VariantMetrics {
    /// Value of the given objective, if the run produced one.
    #[must_use]
    pub const fn objective_value(&self, objective: Objective) -> Option<f64> {
        match objective {
            Objective::FinalValue => self.final_value,
            Objective::Sharpe => self.sharpe,
            Objective::ProfitFactor => self.profit_factor,
        }
    }

    /// True when no field was computed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Replaces NaN and infinite values with `None`.
    ///
    /// Runners report degenerate ratios (zero losing trades, zero variance)
    /// as non-finite numbers, which must not win a ranking.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        for field in [
            &mut self.final_value,
            &mut self.sharpe,
            &mut self.maxdd,
            &mut self.winrate,
            &mut self.profit_factor,
            &mut self.sqn,
            &mut self.best_pnl,
            &mut self.worst_pnl,
            &mut self.avg_pnl,
        ] {
            if field.is_some_and(|v| !v.is_finite()) {
                *field = None;
            }
        }
        self
    }
}

/// Metric used to rank variants. Higher is better for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Objective {
    #[default]
    #[serde(rename = "final", alias = "final_value")]
    FinalValue,
    #[serde(rename = "sharpe")]
    Sharpe,
    #[serde(rename = "pf", alias = "profit_factor")]
    ProfitFactor,
}

impl Objective {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FinalValue => "final",
            Self::Sharpe => "sharpe",
            Self::ProfitFactor => "pf",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "final" | "final_value" => Some(Self::FinalValue),
            "sharpe" => Some(Self::Sharpe),
            "pf" | "profit_factor" => Some(Self::ProfitFactor),
            _ => None,
        }
    }
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Objective {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| EngineError::InvalidObjective(s.to_string()))
    }
}
