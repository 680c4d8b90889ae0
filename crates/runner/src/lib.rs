//! Adapters that satisfy the [`stratlab_core::BacktestRunner`] boundary.

pub mod subprocess;

pub use subprocess::SubprocessRunner;
