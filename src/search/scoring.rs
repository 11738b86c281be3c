//! Complexity measurement, the scalar score, and the guard policy.

use crate::grammar::GrammarModel;
use crate::schema::{Complexity, GuardConfig, Metrics, ScoreWeights};

/// Compute structural complexity of a grammar. Pure and deterministic:
/// depends on the model only, never on runtime message data.
pub fn complexity(model: &GrammarModel) -> Complexity {
    let productions = model.production_count();
    let symbols: usize = model
        .rules()
        .iter()
        .flat_map(|r| r.alternatives.iter())
        .map(|alt| alt.len())
        .sum();
    Complexity {
        productions,
        avg_rhs_symbols: symbols as f64 / productions.max(1) as f64,
    }
}

/// Weighted scalar ranking score. Pure given the metrics.
pub fn score(metrics: &Metrics, weights: &ScoreWeights) -> f64 {
    let mut score = metrics.accuracy;
    score -= weights.len_per_char * metrics.avg_msg_chars;
    score -= weights.complexity_per_prod * metrics.complexity.productions as f64;
    score -= weights.complexity_per_rhs_symbol * metrics.complexity.avg_rhs_symbols;
    score -= weights.collisions * metrics.collision_rate;
    if let Some(robust) = metrics.robust_accuracy {
        score += weights.robust_factor * (robust - metrics.accuracy);
    }
    score
}

/// Why the guard excluded an otherwise-scored candidate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardRejection {
    #[error("accuracy {accuracy:.3} below minimum {min:.3}")]
    AccuracyBelowMin { accuracy: f64, min: f64 },
    #[error("parse-failure rate {rate:.3} above maximum {max:.3}")]
    ParseFailAboveMax { rate: f64, max: f64 },
    #[error("message entropy {entropy:.3} below floor {floor:.3}")]
    EntropyBelowFloor { entropy: f64, floor: f64 },
    #[error("{count} productions exceed cap {max}")]
    TooManyProductions { count: usize, max: usize },
    #[error("average message length {avg:.1} exceeds cap {max:.1}")]
    MessageTooLong { avg: f64, max: f64 },
}

/// Hard accept/reject thresholds applied after scoring. Rejected candidates
/// are logged but never enter the next population.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    config: GuardConfig,
}

impl GuardPolicy {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, metrics: &Metrics) -> Result<(), GuardRejection> {
        if metrics.accuracy < self.config.min_accuracy {
            return Err(GuardRejection::AccuracyBelowMin {
                accuracy: metrics.accuracy,
                min: self.config.min_accuracy,
            });
        }
        if metrics.parse_fail_rate > self.config.max_parse_fail_rate {
            return Err(GuardRejection::ParseFailAboveMax {
                rate: metrics.parse_fail_rate,
                max: self.config.max_parse_fail_rate,
            });
        }
        if let (Some(floor), Some(entropy)) = (self.config.min_msg_entropy, metrics.msg_entropy)
            && entropy < floor
        {
            return Err(GuardRejection::EntropyBelowFloor { entropy, floor });
        }
        if let Some(max) = self.config.max_productions
            && metrics.complexity.productions > max
        {
            return Err(GuardRejection::TooManyProductions {
                count: metrics.complexity.productions,
                max,
            });
        }
        if let Some(max) = self.config.max_avg_msg_chars
            && metrics.avg_msg_chars > max
        {
            return Err(GuardRejection::MessageTooLong {
                avg: metrics.avg_msg_chars,
                max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::BASE_GRAMMAR;
    use crate::schema::GuardConfig;

    fn sample_metrics() -> Metrics {
        Metrics {
            accuracy: 0.8,
            avg_msg_chars: 10.0,
            collision_rate: 0.1,
            parse_fail_rate: 0.0,
            complexity: Complexity {
                productions: 5,
                avg_rhs_symbols: 2.0,
            },
            n_scenes: 20,
            n_correct: 16,
            n_parse_failures: 0,
            robust_accuracy: None,
            msg_entropy: None,
        }
    }

    #[test]
    fn complexity_counts_alternatives_and_symbols() {
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        let c = complexity(&model);
        // msg has 2 alternatives, phrase 1, slot 3, value 1.
        assert_eq!(c.productions, 7);
        // Symbols: msg 1+3, phrase 3, slot 1 each, value 1.
        assert!((c.avg_rhs_symbols - 11.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn complexity_is_pure() {
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        assert_eq!(complexity(&model), complexity(&model));
    }

    #[test]
    fn score_matches_reference_weights() {
        let weights = ScoreWeights::default();
        let s = score(&sample_metrics(), &weights);
        // 0.8 - 0.02*10 - 0.5*5 - 0.1*2.0 - 5.0*0.1
        assert!((s - (0.8 - 0.2 - 2.5 - 0.2 - 0.5)).abs() < 1e-9);
    }

    #[test]
    fn robustness_bonus_applies_when_present() {
        let weights = ScoreWeights::default();
        let mut metrics = sample_metrics();
        let without = score(&metrics, &weights);
        metrics.robust_accuracy = Some(0.9);
        let with = score(&metrics, &weights);
        assert!((with - without - 0.5 * (0.9 - 0.8)).abs() < 1e-9);
    }

    #[test]
    fn guard_rejects_low_accuracy() {
        let guard = GuardPolicy::new(GuardConfig::default());
        let mut metrics = sample_metrics();
        metrics.accuracy = 0.9;
        assert!(matches!(
            guard.check(&metrics),
            Err(GuardRejection::AccuracyBelowMin { .. })
        ));
    }

    #[test]
    fn guard_accepts_within_thresholds() {
        let guard = GuardPolicy::new(GuardConfig::default());
        let mut metrics = sample_metrics();
        metrics.accuracy = 0.97;
        assert!(guard.check(&metrics).is_ok());
    }

    #[test]
    fn guard_monotonic_in_accuracy_threshold() {
        // Raising the minimum accuracy never accepts a candidate a lower
        // threshold rejected.
        let mut metrics = sample_metrics();
        metrics.accuracy = 0.96;
        let thresholds = [0.90, 0.95, 0.97, 0.99];
        let mut last_accepted = true;
        for min in thresholds {
            let guard = GuardPolicy::new(GuardConfig {
                min_accuracy: min,
                ..GuardConfig::default()
            });
            let accepted = guard.check(&metrics).is_ok();
            assert!(accepted <= last_accepted);
            last_accepted = accepted;
        }
    }

    #[test]
    fn guard_entropy_floor_requires_metric() {
        let guard = GuardPolicy::new(GuardConfig {
            min_msg_entropy: Some(2.0),
            ..GuardConfig::default()
        });
        let mut metrics = sample_metrics();
        metrics.accuracy = 0.99;
        // No entropy reported: the floor cannot fire.
        assert!(guard.check(&metrics).is_ok());
        metrics.msg_entropy = Some(1.0);
        assert!(matches!(
            guard.check(&metrics),
            Err(GuardRejection::EntropyBelowFloor { .. })
        ));
    }
}
