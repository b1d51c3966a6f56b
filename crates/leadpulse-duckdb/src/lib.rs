pub mod backend;
pub mod executor;
pub mod schema;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so tests can use
/// `leadpulse_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
