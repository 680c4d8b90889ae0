//! Pure sweep math: grid expansion, constraint filtering, walk-forward
//! windows, and result ranking. Nothing here performs I/O.

pub mod constraint;
pub mod grid;
pub mod ranking;
pub mod windows;

pub use constraint::{Constraint, ParseError};
pub use grid::{expand, GridIter, ParameterGrid};
pub use ranking::{best, rank, top_variants};
pub use windows::WindowScheduler;
