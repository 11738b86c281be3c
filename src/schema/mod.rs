//! Schema module - configuration, metrics, and result types.

mod config;
mod metrics;

pub use config::*;
pub use metrics::*;
