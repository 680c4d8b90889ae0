//! `windows`: print walk-forward folds for a span without running anything.

use anyhow::Result;
use chrono::NaiveDate;
use clap::Args;
use stratlab_core::{Fold, WindowSpec};
use stratlab_sweep::WindowScheduler;

/// Arguments for the windows command.
#[derive(Args, Debug, Clone)]
pub struct WindowsArgs {
    /// First day of data (YYYY-MM-DD)
    #[arg(long)]
    pub start: NaiveDate,

    /// Day after the last day of data (YYYY-MM-DD)
    #[arg(long)]
    pub end: NaiveDate,

    /// Training window length in months
    #[arg(long, default_value_t = 12)]
    pub train: i32,

    /// Test window length in months
    #[arg(long, default_value_t = 3)]
    pub test: i32,

    /// Months between consecutive folds
    #[arg(long, default_value_t = 3)]
    pub step: i32,
}

/// Runs the windows command.
///
/// # Errors
/// Returns an error if any month count is not positive.
pub fn run_windows(args: &WindowsArgs) -> Result<()> {
    let scheduler = WindowScheduler::new(&WindowSpec {
        train_months: args.train,
        test_months: args.test,
        step_months: args.step,
    })?;

    let folds = scheduler.generate(args.start, args.end);
    if folds.is_empty() {
        println!("no complete fold fits between {} and {}", args.start, args.end);
    }
    for fold in &folds {
        println!("{}", format_fold(fold));
    }
    Ok(())
}

fn format_fold(fold: &Fold) -> String {
    format!(
        "fold {:>3}  train {}  test {}",
        fold.fold_index,
        fold.train_range(),
        fold.test_range()
    )
}
