//! External interfaces: the mutation proposer and the evaluation harness.
//!
//! The search controller is generic over both, so a run can plug in a
//! model-backed proposer and a live speaker/listener harness, or the
//! deterministic offline pair in [`sim`] for tests and dry runs.

pub mod sim;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::grammar::Patch;
use crate::schema::Metrics;

pub use sim::{OfflineHarness, OfflineProposer, SceneSampler};

/// One object in a reference game scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneObject {
    pub color: String,
    pub shape: String,
    pub size: String,
}

/// A reference game scene: a set of distinct objects, one of which the
/// speaker must identify to the listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub objects: Vec<SceneObject>,
    /// Index of the target object in `objects`.
    pub target_idx: usize,
}

impl Scene {
    pub fn target(&self) -> &SceneObject {
        &self.objects[self.target_idx]
    }
}

/// One speaker/listener exchange, kept as few-shot material for the proposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub scene: Scene,
    /// Message the speaker produced under the grammar.
    pub message: String,
    /// Object index the listener picked, None on a parse failure.
    pub prediction: Option<usize>,
    pub correct: bool,
}

/// Result of evaluating one grammar on one scene batch.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metrics: Metrics,
    /// A few representative exchanges for the next proposer call.
    pub examples: Vec<Exchange>,
}

/// Errors from a mutation proposer.
#[derive(Debug, thiserror::Error)]
pub enum ProposerError {
    /// The proposer replied but the reply does not follow the patch contract.
    #[error("malformed proposal: {0}")]
    Format(String),
    /// The proposer could not be reached or did not reply.
    #[error("proposer transport failure: {0}")]
    Transport(String),
}

/// Errors from an evaluation harness.
#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    /// The harness failed mid-batch.
    #[error("evaluation harness failure: {0}")]
    Harness(String),
    /// The evaluation exceeded its time budget and was aborted.
    #[error("evaluation timed out after {secs}s")]
    Timeout { secs: u64 },
    /// The grammar text could not be used by the harness.
    #[error("harness rejected grammar: {0}")]
    Grammar(String),
}

/// Source of mutation patches. Given the current grammar and how it scored,
/// propose the next edit.
pub trait ProposerClient {
    fn propose(
        &mut self,
        grammar_text: &str,
        metrics: &Metrics,
        examples: &[Exchange],
    ) -> Result<Patch, ProposerError>;
}

/// Measures a candidate grammar on a fresh scene batch. Implementations are
/// called from worker threads, one candidate each, so they must be `Sync`.
///
/// `timeout` is the per-candidate budget: an evaluation that cannot finish
/// within it reports [`EvaluationError::Timeout`] instead of blocking the
/// generation.
pub trait EvaluationHarness: Sync {
    fn evaluate(
        &self,
        grammar_text: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Evaluation, EvaluationError>;
}
