//! Scoring, logging, and the generational search controller.

mod controller;
mod log;
pub mod scoring;

pub use self::log::RoundLog;
pub use controller::{Candidate, SearchController, SearchError};
pub use scoring::{GuardPolicy, GuardRejection};
