//! Rolling train/test windows for walk-forward validation.

use chrono::{Months, NaiveDate};
use stratlab_core::{EngineError, Fold, WindowSpec};

/// Generates calendar-month folds over a data span.
#[derive(Debug, Clone, Copy)]
pub struct WindowScheduler {
    train: u32,
    test: u32,
    step: u32,
}

impl WindowScheduler {
    /// # Errors
    /// Returns `EngineError::InvalidWindow` if any month count is `<= 0`.
    pub fn new(spec: &WindowSpec) -> Result<Self, EngineError> {
        let months = |label: &str, value: i32| {
            u32::try_from(value)
                .ok()
                .filter(|m| *m > 0)
                .ok_or_else(|| EngineError::InvalidWindow(format!("{label} must be > 0, got {value}")))
        };

        Ok(Self {
            train: months("train_months", spec.train_months)?,
            test: months("test_months", spec.test_months)?,
            step: months("step_months", spec.step_months)?,
        })
    }

    /// Lazily yields folds over `[data_start, data_end)`.
    ///
    /// Fold `k` trains from `data_start + k * step` months. Generation stops
    /// at the first fold whose `test_end` would pass `data_end`, so a partial
    /// trailing window is never emitted.
    pub fn folds(&self, data_start: NaiveDate, data_end: NaiveDate) -> impl Iterator<Item = Fold> {
        let scheduler = *self;
        (0usize..)
            .map_while(move |index| {
                let offset = u32::try_from(index).ok()?.checked_mul(scheduler.step)?;
                // offsets are taken from data_start so month-end clamping never compounds
                let train_start = data_start.checked_add_months(Months::new(offset))?;
                let train_end = train_start.checked_add_months(Months::new(scheduler.train))?;
                let test_end = train_end.checked_add_months(Months::new(scheduler.test))?;
                (test_end <= data_end).then_some(Fold {
                    fold_index: index,
                    train_start,
                    train_end,
                    test_start: train_end,
                    test_end,
                })
            })
    }

    #[must_use]
    pub fn generate(&self, data_start: NaiveDate, data_end: NaiveDate) -> Vec<Fold> {
        self.folds(data_start, data_end).collect()
    }
}

/// Validates `spec` and returns every fold over the span.
///
/// An empty result is not an error here; callers decide whether too little
/// history is fatal.
///
/// # Errors
/// Returns `EngineError::InvalidWindow` if any month count is `<= 0`.
pub fn generate(
    data_start: NaiveDate,
    data_end: NaiveDate,
    spec: &WindowSpec,
) -> Result<Vec<Fold>, EngineError> {
    Ok(WindowScheduler::new(spec)?.generate(data_start, data_end))
}
