//! The generational Top-K search over grammar candidates.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rayon::prelude::*;

use crate::agents::{Evaluation, EvaluationError, EvaluationHarness, Exchange, ProposerClient};
use crate::grammar::{BASE_GRAMMAR, GrammarError, GrammarModel, MutationEngine, PatchValidator};
use crate::schema::{
    CandidateSnapshot, ConfigError, Metrics, RoundRecord, SearchConfig, SearchHistory,
    SearchPhase, SearchProgress, SearchResult, SearchStats, StopReason,
};

use super::log::RoundLog;
use super::scoring::{self, GuardPolicy};

/// A scored grammar in the population.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Unique identifier.
    pub id: u64,
    /// Parsed grammar.
    pub model: GrammarModel,
    /// Canonical grammar text.
    pub text: String,
    /// Evaluation metrics.
    pub metrics: Metrics,
    /// Scalar ranking score.
    pub score: f64,
    /// Generation created.
    pub generation: usize,
    /// Parent candidate, None for the base grammar.
    pub parent: Option<u64>,
    /// Recent exchanges, fed back to the proposer.
    pub examples: Vec<Exchange>,
}

impl Candidate {
    pub fn to_snapshot(&self) -> CandidateSnapshot {
        CandidateSnapshot {
            id: self.id,
            grammar: self.text.clone(),
            metrics: self.metrics.clone(),
            score: self.score,
            generation: self.generation,
            parent: self.parent,
        }
    }
}

/// Rank candidates best-first; Top-K selection keeps the first `k` entries
/// of the ranked pool.
///
/// Ordering is total: score descending, then average message length
/// ascending, then production count ascending. The sort is stable, so
/// remaining ties fall back to insertion order, which puts parents ahead
/// of children and earlier proposals ahead of later ones.
fn rank(pool: &mut [Candidate]) {
    pool.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.metrics.avg_msg_chars.total_cmp(&b.metrics.avg_msg_chars))
            .then_with(|| {
                a.metrics
                    .complexity
                    .productions
                    .cmp(&b.metrics.complexity.productions)
            })
    });
}

/// Search failures that abort the run. Per-child proposal and evaluation
/// failures are logged and skipped instead.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("base grammar: {0}")]
    BaseGrammar(#[from] GrammarError),
    #[error("base grammar evaluation: {0}")]
    BaseEvaluation(#[from] EvaluationError),
    #[error("round log: {0}")]
    Log(#[from] std::io::Error),
}

/// Drives the propose / validate / evaluate / select loop.
///
/// Generic over the proposer and the harness so tests and offline runs can
/// substitute deterministic implementations.
pub struct SearchController<P, E> {
    config: SearchConfig,
    engine: MutationEngine,
    validator: PatchValidator,
    guard: GuardPolicy,
    proposer: P,
    harness: E,
    base_grammar: String,
    population: Vec<Candidate>,
    history: SearchHistory,
    round_log: Option<RoundLog>,
    generation: usize,
    best_score: f64,
    stagnation: usize,
    next_id: u64,
    candidates_evaluated: u64,
    phase: SearchPhase,
    cancelled: Arc<AtomicBool>,
}

impl<P, E> SearchController<P, E>
where
    P: ProposerClient,
    E: EvaluationHarness,
{
    pub fn new(config: SearchConfig, proposer: P, harness: E) -> Result<Self, SearchError> {
        config.validate()?;
        Ok(Self {
            engine: MutationEngine::new(config.caps.clone()),
            validator: PatchValidator::new(config.caps.clone()),
            guard: GuardPolicy::new(config.guard.clone()),
            config,
            proposer,
            harness,
            base_grammar: BASE_GRAMMAR.to_string(),
            population: Vec::new(),
            history: SearchHistory::default(),
            round_log: None,
            generation: 0,
            best_score: f64::NEG_INFINITY,
            stagnation: 0,
            next_id: 0,
            candidates_evaluated: 0,
            phase: SearchPhase::Idle,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start from a grammar other than the built-in base.
    pub fn with_base_grammar(mut self, text: &str) -> Self {
        self.base_grammar = text.to_string();
        self
    }

    /// Record every scored candidate to a JSONL file.
    pub fn with_round_log(mut self, path: &Path) -> Result<Self, SearchError> {
        self.round_log = Some(RoundLog::create(path)?);
        Ok(self)
    }

    /// Get cancellation handle. Takes effect at the next generation boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Current progress.
    pub fn progress(&self) -> SearchProgress {
        let best = self.population.first();
        SearchProgress {
            generation: self.generation,
            total_generations: self.config.population.max_generations,
            phase: self.phase,
            best_score: self.best_score,
            best_avg_msg_chars: best.map_or(0.0, |c| c.metrics.avg_msg_chars),
            stagnation: self.stagnation,
        }
    }

    fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.config.evaluation.timeout_secs)
    }

    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }

        if let (Some(target), Some(best)) =
            (&self.config.population.target, self.population.first())
            && best.metrics.accuracy >= target.min_accuracy
            && best.metrics.avg_msg_chars <= target.max_avg_msg_chars
        {
            return Some(StopReason::TargetReached);
        }

        if self.generation >= self.config.population.max_generations {
            return Some(StopReason::GenerationBudget);
        }

        if let Some(patience) = self.config.population.patience
            && self.stagnation >= patience
        {
            return Some(StopReason::Stagnation);
        }

        None
    }

    /// Parse, validate, and evaluate the base grammar. A failure here is
    /// fatal: without a generation-zero measurement nothing can be ranked.
    fn initialize(&mut self) -> Result<(), SearchError> {
        let model = GrammarModel::parse(&self.base_grammar)?;
        model.validate(&self.config.caps)?;
        let text = model.serialize();

        let evaluation = self.harness.evaluate(
            &text,
            self.config.evaluation.batch_size,
            self.evaluation_timeout(),
        )?;
        self.candidates_evaluated += 1;

        let candidate = self.admit(model, text, None, evaluation);
        log::info!(
            "base grammar scored {:.3} (accuracy {:.3}, {:.1} chars/msg)",
            candidate.score,
            candidate.metrics.accuracy,
            candidate.metrics.avg_msg_chars
        );
        self.population = vec![candidate];
        self.best_score = self.population[0].score;
        Ok(())
    }

    /// Build a scored candidate from an evaluation. Complexity is recomputed
    /// from the model so the score never depends on harness bookkeeping.
    fn admit(
        &mut self,
        model: GrammarModel,
        text: String,
        parent: Option<u64>,
        evaluation: Evaluation,
    ) -> Candidate {
        let mut metrics = evaluation.metrics;
        metrics.complexity = scoring::complexity(&model);
        let score = scoring::score(&metrics, &self.config.weights);

        let id = self.next_id;
        self.next_id += 1;
        Candidate {
            id,
            model,
            text,
            metrics,
            score,
            generation: self.generation,
            parent,
            examples: evaluation.examples,
        }
    }

    /// Ask the proposer for children of the current population, then run
    /// the validation pass over all collected patches. Failed proposals
    /// and inadmissible patches are skipped with a warning.
    fn propose_children(&mut self) -> Vec<(GrammarModel, String, u64)> {
        self.phase = SearchPhase::ProposingChildren;
        let mut proposals = Vec::new();
        for parent_idx in 0..self.population.len() {
            for _ in 0..self.config.population.proposals_per_parent {
                let parent = &self.population[parent_idx];
                match self
                    .proposer
                    .propose(&parent.text, &parent.metrics, &parent.examples)
                {
                    Ok(patch) => proposals.push((parent_idx, patch)),
                    Err(e) => {
                        log::warn!("proposal for candidate {} failed: {e}", parent.id);
                    }
                }
            }
        }

        self.phase = SearchPhase::ValidatingPatches;
        let mut pending = Vec::new();
        for (parent_idx, patch) in proposals {
            let parent = &self.population[parent_idx];
            if let Err(e) = self.validator.validate(&parent.model, &patch) {
                log::warn!("patch for candidate {} rejected: {e}", parent.id);
                continue;
            }
            match self.engine.apply_patch(&parent.model, &patch.mutations) {
                Ok(model) => {
                    let text = model.serialize();
                    pending.push((model, text, parent.id));
                }
                Err(e) => {
                    // Validation dry-runs the patch, so this is rare.
                    log::warn!("patch for candidate {} inadmissible: {e}", parent.id);
                }
            }
        }
        pending
    }

    /// Run one generation: propose, validate, evaluate, guard, select.
    fn step_generation(&mut self) -> Result<(), SearchError> {
        let pending = self.propose_children();

        self.phase = SearchPhase::EvaluatingChildren;
        let batch_size = self.config.evaluation.batch_size;
        let timeout = self.evaluation_timeout();
        let harness = &self.harness;
        let evaluated: Vec<_> = pending
            .into_par_iter()
            .map(|(model, text, parent)| {
                let evaluation = harness.evaluate(&text, batch_size, timeout);
                (model, text, parent, evaluation)
            })
            .collect();

        self.phase = SearchPhase::Selecting;
        let mut pool = std::mem::take(&mut self.population);
        let parents = pool.len();
        for (model, text, parent, evaluation) in evaluated {
            let evaluation = match evaluation {
                Ok(evaluation) => evaluation,
                Err(e) => {
                    log::warn!("evaluation of a child of {parent} failed: {e}");
                    continue;
                }
            };
            self.candidates_evaluated += 1;
            let candidate = self.admit(model, text, Some(parent), evaluation);
            match self.guard.check(&candidate.metrics) {
                Ok(()) => pool.push(candidate),
                Err(rejection) => {
                    log::debug!("candidate {} rejected by guard: {rejection}", candidate.id);
                    self.log_round(&candidate, false)?;
                }
            }
        }
        let accepted_children = pool.len() - parents;

        // Log the whole ranked pool before truncation so selection losers
        // leave a record with accepted = false.
        rank(&mut pool);
        let k = self.config.population.survivors;
        for (idx, candidate) in pool.iter().enumerate() {
            self.log_round(candidate, idx < k)?;
        }
        pool.truncate(k);

        // Track best score and stagnation.
        let gen_best = pool[0].score;
        if gen_best > self.best_score + f64::EPSILON {
            self.best_score = gen_best;
            self.stagnation = 0;
        } else {
            self.stagnation += 1;
        }

        let avg_score = pool.iter().map(|c| c.score).sum::<f64>() / pool.len() as f64;
        self.history.best_score.push(gen_best);
        self.history.avg_score.push(avg_score);
        self.history
            .best_avg_msg_chars
            .push(pool[0].metrics.avg_msg_chars);
        self.history.accepted_children.push(accepted_children);

        self.population = pool;
        self.generation += 1;
        log::info!(
            "generation {} complete: best {:.3}, avg {:.3}, {} children accepted",
            self.generation,
            gen_best,
            avg_score,
            accepted_children
        );
        Ok(())
    }

    fn log_round(&mut self, candidate: &Candidate, accepted: bool) -> Result<(), SearchError> {
        if let Some(log) = &mut self.round_log {
            log.append(&RoundRecord {
                generation: self.generation,
                candidate: candidate.id,
                parent: candidate.parent,
                accuracy: candidate.metrics.accuracy,
                avg_msg_chars: candidate.metrics.avg_msg_chars,
                productions: candidate.metrics.complexity.productions,
                collision_rate: candidate.metrics.collision_rate,
                parse_fail_rate: candidate.metrics.parse_fail_rate,
                score: candidate.score,
                accepted,
            })?;
        }
        Ok(())
    }

    /// Run the search with a progress callback, invoked once per generation
    /// and at termination.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<SearchResult, SearchError>
    where
        F: Fn(&SearchProgress),
    {
        let start_time = std::time::Instant::now();

        self.initialize()?;
        callback(&self.progress());

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            self.step_generation()?;
            callback(&self.progress());
        };

        self.phase = SearchPhase::Terminated;
        callback(&self.progress());
        log::info!("search stopped after {} generations: {stop_reason:?}", self.generation);

        // Population is kept sorted by selection; the base-only case is
        // trivially sorted.
        let population: Vec<CandidateSnapshot> =
            self.population.iter().map(Candidate::to_snapshot).collect();
        let best = population[0].clone();

        Ok(SearchResult {
            best,
            population,
            stats: SearchStats {
                generations: self.generation,
                candidates_evaluated: self.candidates_evaluated,
                best_score: self.best_score,
                elapsed_seconds: start_time.elapsed().as_secs_f64(),
                stop_reason,
            },
            history: self.history.clone(),
        })
    }

    /// Run the search (blocking).
    pub fn run(&mut self) -> Result<SearchResult, SearchError> {
        self.run_with_callback(|_| {})
    }
}
