//! CFG-Neuralese - Evolutionary compression of a grammar-based protocol.
//!
//! Two agents play a reference game: a speaker describes a target object
//! with a message, a listener picks the object from the scene. The message
//! protocol is a small context-free grammar, and this crate searches for
//! grammars that keep decoding accuracy high while making messages shorter.
//!
//! # Architecture
//!
//! - `schema`: Configuration, metrics, and result types
//! - `grammar`: Grammar model, mutation engine, and patch validation
//! - `search`: Scoring, guard policy, and the Top-K search controller
//! - `agents`: Proposer and harness interfaces plus offline stand-ins
//!
//! # Example
//!
//! ```rust,no_run
//! use cfg_neuralese::{
//!     agents::{OfflineHarness, OfflineProposer},
//!     schema::SearchConfig,
//!     search::SearchController,
//! };
//!
//! let config = SearchConfig::default();
//! let proposer = OfflineProposer::new();
//! let harness = OfflineHarness::new(42);
//!
//! let mut controller = SearchController::new(config, proposer, harness)?;
//! let result = controller.run()?;
//!
//! println!("best grammar ({:.1} chars/msg):", result.best.metrics.avg_msg_chars);
//! println!("{}", result.best.grammar);
//! # Ok::<(), cfg_neuralese::search::SearchError>(())
//! ```

pub mod agents;
pub mod grammar;
pub mod schema;
pub mod search;

// Re-export commonly used types
pub use grammar::{BASE_GRAMMAR, GrammarModel, MutationEngine, MutationOp, Patch};
pub use schema::{SearchConfig, SearchResult, StopReason};
pub use search::{SearchController, SearchError};
