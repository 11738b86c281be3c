//! Search configuration types.

use serde::{Deserialize, Serialize};

/// Top-level configuration for a grammar search run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Population and generation settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Structural caps enforced on every candidate grammar.
    #[serde(default)]
    pub caps: GrammarCaps,
    /// Hard accept/reject thresholds for scored candidates.
    #[serde(default)]
    pub guard: GuardConfig,
    /// Weights for the scalar ranking score.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Evaluation settings (batch size, timeout).
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Random seed for reproducibility (scene sampling in offline runs).
    #[serde(default)]
    pub random_seed: Option<u64>,
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of surviving grammars per generation (K).
    #[serde(default = "default_survivors")]
    pub survivors: usize,
    /// Mutation proposals requested per parent (M).
    #[serde(default = "default_proposals_per_parent")]
    pub proposals_per_parent: usize,
    /// Generation budget.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Stop if the best score has not improved for this many generations.
    #[serde(default)]
    pub patience: Option<usize>,
    /// Stop early once both targets are met.
    #[serde(default)]
    pub target: Option<TargetConfig>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            survivors: default_survivors(),
            proposals_per_parent: default_proposals_per_parent(),
            max_generations: default_max_generations(),
            patience: None,
            target: None,
        }
    }
}

fn default_survivors() -> usize {
    3
}
fn default_proposals_per_parent() -> usize {
    2
}
fn default_max_generations() -> usize {
    10
}

/// Early-stop targets: the run terminates once the best candidate meets both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Required accuracy.
    pub min_accuracy: f64,
    /// Required average message length (chars).
    pub max_avg_msg_chars: f64,
}

/// Structural caps on candidate grammars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarCaps {
    /// Maximum total alternatives across all rules.
    #[serde(default = "default_max_productions")]
    pub max_productions: usize,
    /// Maximum nonterminal reference depth from the start symbol.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for GrammarCaps {
    fn default() -> Self {
        Self {
            max_productions: default_max_productions(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_max_productions() -> usize {
    32
}
fn default_max_depth() -> usize {
    8
}

/// Hard thresholds applied to every scored candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Minimum decoding accuracy.
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,
    /// Maximum parse-failure rate.
    #[serde(default = "default_max_parse_fail_rate")]
    pub max_parse_fail_rate: f64,
    /// Minimum message entropy (bits), when the harness reports it.
    #[serde(default)]
    pub min_msg_entropy: Option<f64>,
    /// Maximum production count.
    #[serde(default)]
    pub max_productions: Option<usize>,
    /// Maximum average message length (chars).
    #[serde(default)]
    pub max_avg_msg_chars: Option<f64>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_accuracy: default_min_accuracy(),
            max_parse_fail_rate: default_max_parse_fail_rate(),
            min_msg_entropy: None,
            max_productions: None,
            max_avg_msg_chars: None,
        }
    }
}

fn default_min_accuracy() -> f64 {
    0.95
}
fn default_max_parse_fail_rate() -> f64 {
    0.05
}

/// Weights for the scalar ranking score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Penalty per average message character.
    #[serde(default = "default_len_per_char")]
    pub len_per_char: f64,
    /// Penalty per production.
    #[serde(default = "default_complexity_per_prod")]
    pub complexity_per_prod: f64,
    /// Penalty per average right-hand-side symbol.
    #[serde(default = "default_complexity_per_rhs_symbol")]
    pub complexity_per_rhs_symbol: f64,
    /// Penalty per unit collision rate.
    #[serde(default = "default_collisions")]
    pub collisions: f64,
    /// Bonus factor for robustness accuracy over plain accuracy.
    #[serde(default = "default_robust_factor")]
    pub robust_factor: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            len_per_char: default_len_per_char(),
            complexity_per_prod: default_complexity_per_prod(),
            complexity_per_rhs_symbol: default_complexity_per_rhs_symbol(),
            collisions: default_collisions(),
            robust_factor: default_robust_factor(),
        }
    }
}

fn default_len_per_char() -> f64 {
    0.02
}
fn default_complexity_per_prod() -> f64 {
    0.5
}
fn default_complexity_per_rhs_symbol() -> f64 {
    0.1
}
fn default_collisions() -> f64 {
    5.0
}
fn default_robust_factor() -> f64 {
    0.5
}

/// Candidate evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Scenes per evaluation batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Per-candidate evaluation timeout in seconds; a stuck evaluation is
    /// aborted by the harness and the candidate excluded.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    24
}
fn default_timeout_secs() -> u64 {
    120
}

/// Search configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("population must keep at least one survivor")]
    NoSurvivors,
    #[error("each parent must propose at least one child")]
    NoProposals,
    #[error("generation budget must be positive")]
    NoGenerations,
    #[error("grammar caps must be positive")]
    DegenerateCaps,
    #[error("guard threshold {name} = {value} is outside [0, 1]")]
    GuardOutOfRange { name: &'static str, value: f64 },
    #[error("score weight {name} must be non-negative")]
    NegativeWeight { name: &'static str },
    #[error("evaluation batch size must be positive")]
    EmptyBatch,
}

impl SearchConfig {
    /// Validate search configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population.survivors == 0 {
            return Err(ConfigError::NoSurvivors);
        }
        if self.population.proposals_per_parent == 0 {
            return Err(ConfigError::NoProposals);
        }
        if self.population.max_generations == 0 {
            return Err(ConfigError::NoGenerations);
        }
        if self.caps.max_productions == 0 || self.caps.max_depth == 0 {
            return Err(ConfigError::DegenerateCaps);
        }

        let unit = |name: &'static str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(ConfigError::GuardOutOfRange { name, value })
            }
        };
        unit("min_accuracy", self.guard.min_accuracy)?;
        unit("max_parse_fail_rate", self.guard.max_parse_fail_rate)?;

        let weight = |name: &'static str, value: f64| {
            if value >= 0.0 {
                Ok(())
            } else {
                Err(ConfigError::NegativeWeight { name })
            }
        };
        weight("len_per_char", self.weights.len_per_char)?;
        weight("complexity_per_prod", self.weights.complexity_per_prod)?;
        weight(
            "complexity_per_rhs_symbol",
            self.weights.complexity_per_rhs_symbol,
        )?;
        weight("collisions", self.weights.collisions)?;
        weight("robust_factor", self.weights.robust_factor)?;

        if self.evaluation.batch_size == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        Ok(())
    }
}
