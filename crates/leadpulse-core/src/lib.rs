pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metric;
pub mod period;
pub mod query;
