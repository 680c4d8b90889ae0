//! CLI commands for strategy sweeps.

pub mod context;
pub mod grid;
pub mod jobs;
pub mod submit;
pub mod windows;

pub use grid::{run_grid, GridArgs};
pub use jobs::{run_jobs, run_show, JobsArgs, ShowArgs};
pub use submit::{run_optimize, run_walk_forward, SubmitArgs, WalkForwardArgs};
pub use windows::{run_windows, WindowsArgs};
