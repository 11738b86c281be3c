//! Metrics, candidate snapshots, and search result types.

use serde::{Deserialize, Serialize};

/// Structural complexity of a grammar, independent of any message data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    /// Total alternative count across all rules.
    pub productions: usize,
    /// Mean symbol count per alternative.
    pub avg_rhs_symbols: f64,
}

impl Default for Complexity {
    fn default() -> Self {
        Self {
            productions: 0,
            avg_rhs_symbols: 0.0,
        }
    }
}

/// Evaluation metrics for one candidate grammar on one scene batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Fraction of scenes where the listener picked the target (0-1).
    pub accuracy: f64,
    /// Average message length in characters.
    pub avg_msg_chars: f64,
    /// Fraction of messages colliding with a different-target scene (0-1).
    pub collision_rate: f64,
    /// Fraction of scenes whose message failed to parse (0-1).
    pub parse_fail_rate: f64,
    /// Structural complexity of the grammar under evaluation.
    pub complexity: Complexity,
    /// Scenes in the batch.
    pub n_scenes: usize,
    /// Correct predictions.
    pub n_correct: usize,
    /// Parse failures.
    pub n_parse_failures: usize,
    /// Accuracy under perturbed inputs, when measured.
    #[serde(default)]
    pub robust_accuracy: Option<f64>,
    /// Shannon entropy (bits) of the message distribution, when measured.
    #[serde(default)]
    pub msg_entropy: Option<f64>,
}

/// Serializable snapshot of a scored candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    /// Unique identifier within the run.
    pub id: u64,
    /// Grammar text (canonical serialization).
    pub grammar: String,
    /// Evaluation metrics.
    pub metrics: Metrics,
    /// Scalar ranking score.
    pub score: f64,
    /// Generation this candidate was created.
    pub generation: usize,
    /// Parent candidate id (lineage), None for the base grammar.
    pub parent: Option<u64>,
}

/// One round-log line: a candidate's fate in one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub generation: usize,
    pub candidate: u64,
    pub parent: Option<u64>,
    pub accuracy: f64,
    pub avg_msg_chars: f64,
    pub productions: usize,
    pub collision_rate: f64,
    pub parse_fail_rate: f64,
    pub score: f64,
    pub accepted: bool,
}

/// Per-generation statistics history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHistory {
    /// Best score per generation.
    pub best_score: Vec<f64>,
    /// Average population score per generation.
    pub avg_score: Vec<f64>,
    /// Best candidate's average message length per generation.
    pub best_avg_msg_chars: Vec<f64>,
    /// Children accepted into the population per generation.
    pub accepted_children: Vec<usize>,
}

/// Current phase of the generational state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchPhase {
    #[default]
    Idle,
    ProposingChildren,
    ValidatingPatches,
    EvaluatingChildren,
    Selecting,
    Terminated,
}

/// Reason the search terminated. Each is a controlled stop, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Accuracy and length targets both met.
    TargetReached,
    /// Generation budget exhausted.
    GenerationBudget,
    /// No best-score improvement within the patience window.
    Stagnation,
    /// Cancelled at a generation boundary.
    Cancelled,
}

/// Progress update reported at phase transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProgress {
    pub generation: usize,
    pub total_generations: usize,
    pub phase: SearchPhase,
    pub best_score: f64,
    pub best_avg_msg_chars: f64,
    pub stagnation: usize,
}

/// Statistics from a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    pub generations: usize,
    pub candidates_evaluated: u64,
    pub best_score: f64,
    pub elapsed_seconds: f64,
    pub stop_reason: StopReason,
}

/// Final result of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Best surviving candidate.
    pub best: CandidateSnapshot,
    /// Final population, best first.
    pub population: Vec<CandidateSnapshot>,
    /// Run statistics.
    pub stats: SearchStats,
    /// Per-generation history.
    pub history: SearchHistory,
}
