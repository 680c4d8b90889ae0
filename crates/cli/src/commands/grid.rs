//! `grid`: dry-run expansion of a request's parameter grid.

use super::context::{load_config, load_request};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use stratlab_sweep::ParameterGrid;

/// Arguments for the grid command.
#[derive(Args, Debug, Clone)]
pub struct GridArgs {
    /// JSON file holding the sweep request
    #[arg(short, long)]
    pub request: PathBuf,

    /// Print at most this many variants
    #[arg(long)]
    pub limit: Option<usize>,
}

/// Runs the grid command.
///
/// # Errors
/// Returns an error if the request cannot be read or the grid is invalid.
pub fn run_grid(args: &GridArgs, profile: Option<&str>) -> Result<()> {
    let config = load_config(profile)?;
    let request = load_request(&args.request)?;
    let grid = ParameterGrid::build(
        &request.param_ranges,
        request.constraint.as_deref(),
        config.engine.max_variants,
    )?;

    for line in render(&grid, args.limit) {
        println!("{line}");
    }
    Ok(())
}

fn render(grid: &ParameterGrid, limit: Option<usize>) -> Vec<String> {
    let mut lines = vec![format!("total_variants: {}", grid.total_variants())];
    if let Some(constraint) = grid.constraint() {
        lines.push(format!("constraint: {}", constraint.source()));
        lines.push(format!("after constraint: {}", grid.filtered_len()));
    }
    let shown = grid
        .iter()
        .enumerate()
        .take(limit.unwrap_or(usize::MAX))
        .map(|(index, variant)| format!("{index:>6}  {variant}"));
    lines.extend(shown);
    lines
}
