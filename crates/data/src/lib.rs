//! Result store implementations.
//!
//! - [`MemoryResultStore`]: process-local, for tests and dry runs
//! - [`SqliteResultStore`]: durable store backed by `SQLite` with migrations

pub mod memory;
pub mod sqlite;

pub use memory::MemoryResultStore;
pub use sqlite::SqliteResultStore;
