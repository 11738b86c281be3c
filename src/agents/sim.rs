//! Deterministic offline speaker/listener pair.
//!
//! Stands in for the model-backed agents during tests and dry runs. The
//! speaker renders messages by walking the grammar structure, the listener
//! decodes by re-encoding every object in the scene and matching, and the
//! proposer works through a fixed compression playbook. Everything is seeded,
//! so two runs with the same configuration produce the same result.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::grammar::{GrammarModel, MutationOp, Patch, Rule, Symbol};
use crate::schema::Metrics;
use crate::search::scoring;

use super::{
    Evaluation, EvaluationError, EvaluationHarness, Exchange, ProposerClient, ProposerError, Scene,
    SceneObject,
};

const COLORS: &[&str] = &["red", "green", "blue", "amber", "violet"];
const SHAPES: &[&str] = &["cube", "ball", "cone", "ring", "slab"];
const SIZES: &[&str] = &["small", "large", "tiny", "giant"];

/// Objects per scene.
const SCENE_SIZE: usize = 3;
/// Exchanges kept as few-shot material per evaluation.
const EXAMPLE_COUNT: usize = 5;

/// Seeded scene generator. Objects within a scene are pairwise distinct.
pub struct SceneSampler {
    rng: StdRng,
}

impl SceneSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn object(&mut self) -> SceneObject {
        SceneObject {
            color: COLORS[self.rng.gen_range(0..COLORS.len())].to_string(),
            shape: SHAPES[self.rng.gen_range(0..SHAPES.len())].to_string(),
            size: SIZES[self.rng.gen_range(0..SIZES.len())].to_string(),
        }
    }

    pub fn scene(&mut self) -> Scene {
        let mut objects: Vec<SceneObject> = Vec::with_capacity(SCENE_SIZE);
        // The attribute space is large enough that a few retries always
        // suffice; the cap only bounds the loop.
        let mut attempts = 0;
        while objects.len() < SCENE_SIZE && attempts < 64 {
            attempts += 1;
            let candidate = self.object();
            if !objects.contains(&candidate) {
                objects.push(candidate);
            }
        }
        let target_idx = self.rng.gen_range(0..objects.len());
        Scene {
            objects,
            target_idx,
        }
    }

    pub fn batch(&mut self, n: usize) -> Vec<Scene> {
        (0..n).map(|_| self.scene()).collect()
    }
}

/// Message layout read off a grammar: which literals key which attribute,
/// the separators in use, the value pattern, and any trailing checksum.
struct Encoder {
    keys: Vec<String>,
    kv_sep: String,
    phrase_sep: String,
    value_pattern: Option<regex::Regex>,
    value_width: Option<usize>,
    checksum_base: Option<u32>,
}

impl Encoder {
    fn from_model(model: &GrammarModel) -> Result<Self, EvaluationError> {
        let start = model
            .rule(model.start())
            .ok_or_else(|| EvaluationError::Grammar("missing start rule".into()))?;

        // Separator between phrases: literals inside the start rule's
        // self-referencing alternative.
        let phrase_sep = start
            .alternatives
            .iter()
            .find(|alt| {
                alt.iter()
                    .any(|s| matches!(s, Symbol::Nonterminal(n) if n == model.start()))
            })
            .map(|alt| collect_literals(alt))
            .unwrap_or_default();

        let checksum_base = start.alternatives.iter().find_map(|alt| match alt.last() {
            Some(Symbol::Checksum { mod_base }) => Some(*mod_base),
            _ => None,
        });

        // The phrase rule is the first non-start rule the start rule refers
        // to. When the start rule inlines the phrase body, use it directly.
        let phrase = start
            .alternatives
            .iter()
            .flatten()
            .find_map(|s| match s {
                Symbol::Nonterminal(n) if n != model.start() => model.rule(n),
                _ => None,
            })
            .unwrap_or(start);

        let body = phrase
            .alternatives
            .first()
            .ok_or_else(|| EvaluationError::Grammar("empty phrase rule".into()))?;

        let mut keys = Vec::new();
        let mut kv_sep = String::new();
        let mut pattern_text: Option<String> = None;
        let mut seen_slot = false;
        for sym in body {
            match sym {
                Symbol::Nonterminal(n) => {
                    if let Some(rule) = model.rule(n) {
                        if let Some(literals) = literal_enum(rule) {
                            keys = literals;
                            seen_slot = true;
                        } else if let Some(p) = first_pattern(rule) {
                            pattern_text = Some(p);
                        }
                    }
                }
                Symbol::Literal(t) if seen_slot && pattern_text.is_none() => kv_sep.push_str(t),
                Symbol::Pattern(p) => pattern_text = Some(p.clone()),
                _ => {}
            }
        }

        let value_width = pattern_text.as_deref().and_then(explicit_width);
        let value_pattern = match pattern_text {
            Some(p) => Some(
                regex::Regex::new(&format!("^(?:{p})$"))
                    .map_err(|e| EvaluationError::Grammar(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            keys,
            kv_sep,
            phrase_sep,
            value_pattern,
            value_width,
            checksum_base,
        })
    }

    /// Render the message for one object, or None when a value cannot be
    /// expressed under the current value pattern.
    fn encode(&self, object: &SceneObject) -> Option<String> {
        let values = [&object.color, &object.shape, &object.size];
        let mut phrases = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let rendered = self.render_value(value)?;
            match self.keys.get(i) {
                Some(key) => phrases.push(format!("{key}{}{rendered}", self.kv_sep)),
                None => phrases.push(rendered),
            }
        }
        let mut message = phrases.join(&self.phrase_sep);
        if let Some(base) = self.checksum_base {
            let sum: u32 = message.bytes().map(u32::from).sum();
            message.push_str(&(sum % base).to_string());
        }
        Some(message)
    }

    fn render_value(&self, value: &str) -> Option<String> {
        let rendered = match self.value_width {
            Some(n) if value.len() >= n => value[..n].to_string(),
            Some(n) => {
                let mut s = value.to_string();
                while s.len() < n {
                    s.push('x');
                }
                s
            }
            None => value.to_string(),
        };
        match &self.value_pattern {
            Some(re) if !re.is_match(&rendered) => None,
            _ => Some(rendered),
        }
    }
}

fn collect_literals(alt: &[Symbol]) -> String {
    alt.iter()
        .filter_map(|s| match s {
            Symbol::Literal(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

/// A rule whose alternatives are each a single literal: an enumeration,
/// like the slot-name rule.
fn literal_enum(rule: &Rule) -> Option<Vec<String>> {
    if rule.alternatives.len() < 2 {
        return None;
    }
    rule.alternatives
        .iter()
        .map(|alt| match alt.as_slice() {
            [Symbol::Literal(t)] => Some(t.clone()),
            _ => None,
        })
        .collect()
}

fn first_pattern(rule: &Rule) -> Option<String> {
    rule.alternatives.iter().flatten().find_map(|s| match s {
        Symbol::Pattern(p) => Some(p.clone()),
        _ => None,
    })
}

/// Width `n` from a trailing `{n}` quantifier, if the pattern has one.
fn explicit_width(pattern: &str) -> Option<usize> {
    let inner = pattern.strip_suffix('}')?;
    let idx = inner.rfind('{')?;
    inner[idx + 1..].parse().ok()
}

/// Grammar-driven evaluation without any model in the loop. Every candidate
/// is measured on the same seeded scene batch, so metric differences come
/// from the grammar alone.
pub struct OfflineHarness {
    seed: u64,
}

impl OfflineHarness {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl EvaluationHarness for OfflineHarness {
    fn evaluate(
        &self,
        grammar_text: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Evaluation, EvaluationError> {
        let start = Instant::now();
        let model = GrammarModel::parse(grammar_text)
            .map_err(|e| EvaluationError::Grammar(e.to_string()))?;
        let encoder = Encoder::from_model(&model)?;
        let scenes = SceneSampler::new(self.seed).batch(batch_size);

        let mut exchanges = Vec::with_capacity(scenes.len());
        let mut n_correct = 0;
        let mut n_parse_failures = 0;
        let mut char_total = 0usize;
        // Message -> distinct targets that produced it, for collision counting.
        let mut by_message: HashMap<String, Vec<SceneObject>> = HashMap::new();

        for scene in scenes {
            let message = encoder.encode(scene.target());
            let (message, prediction) = match message {
                Some(msg) => {
                    char_total += msg.chars().count();
                    let targets = by_message.entry(msg.clone()).or_default();
                    if !targets.contains(scene.target()) {
                        targets.push(scene.target().clone());
                    }
                    let pick = scene
                        .objects
                        .iter()
                        .position(|obj| encoder.encode(obj).as_deref() == Some(msg.as_str()));
                    (msg, pick)
                }
                None => {
                    n_parse_failures += 1;
                    (String::new(), None)
                }
            };
            let correct = prediction == Some(scene.target_idx);
            if correct {
                n_correct += 1;
            }
            exchanges.push(Exchange {
                scene,
                message,
                prediction,
                correct,
            });
        }

        let n_scenes = exchanges.len();
        let encoded = n_scenes - n_parse_failures;
        let colliding = exchanges
            .iter()
            .filter(|ex| {
                ex.prediction.is_some()
                    && by_message
                        .get(&ex.message)
                        .is_some_and(|targets| targets.len() > 1)
            })
            .count();

        let metrics = Metrics {
            accuracy: n_correct as f64 / n_scenes.max(1) as f64,
            avg_msg_chars: char_total as f64 / encoded.max(1) as f64,
            collision_rate: colliding as f64 / n_scenes.max(1) as f64,
            parse_fail_rate: n_parse_failures as f64 / n_scenes.max(1) as f64,
            complexity: scoring::complexity(&model),
            n_scenes,
            n_correct,
            n_parse_failures,
            robust_accuracy: None,
            msg_entropy: Some(message_entropy(&exchanges)),
        };

        if start.elapsed() >= timeout {
            return Err(EvaluationError::Timeout {
                secs: timeout.as_secs(),
            });
        }

        let examples = exchanges.iter().take(EXAMPLE_COUNT).cloned().collect();
        Ok(Evaluation { metrics, examples })
    }
}

/// Shannon entropy in bits over the batch's message distribution.
fn message_entropy(exchanges: &[Exchange]) -> f64 {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for ex in exchanges.iter().filter(|ex| ex.prediction.is_some()) {
        *counts.entry(ex.message.as_str()).or_default() += 1;
    }
    let total: usize = counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// Proposer that works through a fixed compression playbook: shorten the
/// slot keys, drop separators, then pin the value width. Successive calls
/// rotate through whichever steps still apply, so sibling proposals differ.
pub struct OfflineProposer {
    calls: usize,
}

impl OfflineProposer {
    pub fn new() -> Self {
        Self { calls: 0 }
    }

    fn applicable(model: &GrammarModel) -> Vec<MutationOp> {
        let mut ops = Vec::new();

        if let Some(slot) = model.rule("slot")
            && let Some(keys) = literal_enum(slot)
            && keys.iter().any(|k| k.chars().count() > 1)
        {
            // Shortest distinct code per key: first character, falling back
            // through the rest of the key on collisions.
            let mut used = std::collections::HashSet::new();
            let mut mapping = std::collections::BTreeMap::new();
            for key in keys.iter().filter(|k| k.chars().count() > 1) {
                if let Some(code) = key.chars().map(|c| c.to_string()).find(|c| !used.contains(c)) {
                    used.insert(code.clone());
                    mapping.insert(key.clone(), code);
                }
            }
            if !mapping.is_empty() {
                ops.push(MutationOp::MapVocab {
                    slot: "slot".into(),
                    mapping,
                });
            }
        }

        let has_separators = model.rules().iter().any(|rule| {
            rule.alternatives.iter().flatten().any(|s| {
                matches!(s, Symbol::Literal(t) if !t.is_empty()
                    && t.chars().all(|c| matches!(c, ';' | ':' | ',')))
            })
        });
        if has_separators {
            ops.push(MutationOp::RemoveSeparators);
        }

        if let Some(value) = model.rule("value")
            && let Some(pattern) = first_pattern(value)
            && explicit_width(&pattern).is_none()
        {
            ops.push(MutationOp::FixLength {
                symbol: "value".into(),
                n: 3,
            });
        }

        if ops.is_empty() {
            // Nothing left in the playbook; keep proposals admissible.
            if model.rule("value").is_some() {
                ops.push(MutationOp::RestrictTerminal {
                    name: "value".into(),
                    pattern: "[a-z]{3}".into(),
                });
            } else {
                ops.push(MutationOp::RemoveSeparators);
            }
        }
        ops
    }
}

impl Default for OfflineProposer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProposerClient for OfflineProposer {
    fn propose(
        &mut self,
        grammar_text: &str,
        _metrics: &Metrics,
        _examples: &[Exchange],
    ) -> Result<Patch, ProposerError> {
        let model =
            GrammarModel::parse(grammar_text).map_err(|e| ProposerError::Format(e.to_string()))?;
        let ops = Self::applicable(&model);
        let op = ops[self.calls % ops.len()].clone();
        self.calls += 1;
        Ok(Patch::from_ops(vec![op]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{BASE_GRAMMAR, MutationEngine};
    use crate::schema::GrammarCaps;

    fn budget() -> Duration {
        Duration::from_secs(120)
    }

    #[test]
    fn sampler_is_deterministic() {
        let a = SceneSampler::new(7).batch(10);
        let b = SceneSampler::new(7).batch(10);
        assert_eq!(a, b);
    }

    #[test]
    fn scene_objects_are_distinct() {
        let mut sampler = SceneSampler::new(3);
        for _ in 0..50 {
            let scene = sampler.scene();
            for i in 0..scene.objects.len() {
                for j in (i + 1)..scene.objects.len() {
                    assert_ne!(scene.objects[i], scene.objects[j]);
                }
            }
            assert!(scene.target_idx < scene.objects.len());
        }
    }

    #[test]
    fn base_grammar_encodes_verbose_phrases() {
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        let encoder = Encoder::from_model(&model).unwrap();
        let object = SceneObject {
            color: "red".into(),
            shape: "cube".into(),
            size: "small".into(),
        };
        assert_eq!(
            encoder.encode(&object).unwrap(),
            "color:red;shape:cube;size:small"
        );
    }

    #[test]
    fn base_grammar_is_fully_decodable() {
        let harness = OfflineHarness::new(42);
        let eval = harness.evaluate(BASE_GRAMMAR, 24, budget()).unwrap();
        assert_eq!(eval.metrics.accuracy, 1.0);
        assert_eq!(eval.metrics.parse_fail_rate, 0.0);
        assert!(eval.metrics.avg_msg_chars > 20.0);
        assert_eq!(eval.examples.len(), 5);
    }

    #[test]
    fn evaluation_is_reproducible() {
        let harness = OfflineHarness::new(42);
        let a = harness.evaluate(BASE_GRAMMAR, 24, budget()).unwrap();
        let b = harness.evaluate(BASE_GRAMMAR, 24, budget()).unwrap();
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn compressed_grammar_shortens_messages() {
        let engine = MutationEngine::new(GrammarCaps::default());
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        let mapping = [("color", "c"), ("shape", "s"), ("size", "z")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let ops = vec![
            MutationOp::MapVocab {
                slot: "slot".into(),
                mapping,
            },
            MutationOp::RemoveSeparators,
            MutationOp::FixLength {
                symbol: "value".into(),
                n: 3,
            },
        ];
        let compressed = engine.apply_patch(&model, &ops).unwrap();

        let harness = OfflineHarness::new(42);
        let before = harness.evaluate(BASE_GRAMMAR, 24, budget()).unwrap();
        let after = harness.evaluate(&compressed.serialize(), 24, budget()).unwrap();
        assert!(after.metrics.avg_msg_chars < before.metrics.avg_msg_chars);
        // Keyed three-char values still identify the target.
        assert!(after.metrics.accuracy > 0.9);
    }

    #[test]
    fn checksum_appends_digits() {
        let engine = MutationEngine::new(GrammarCaps::default());
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        let checked = engine
            .apply(&model, &MutationOp::AddChecksum { mod_base: 10 })
            .unwrap();
        let encoder = Encoder::from_model(&checked).unwrap();
        let object = SceneObject {
            color: "red".into(),
            shape: "cube".into(),
            size: "small".into(),
        };
        let plain = "color:red;shape:cube;size:small";
        let sum: u32 = plain.bytes().map(u32::from).sum();
        assert_eq!(
            encoder.encode(&object).unwrap(),
            format!("{plain}{}", sum % 10)
        );
    }

    #[test]
    fn exhausted_time_budget_surfaces_as_timeout() {
        let harness = OfflineHarness::new(42);
        let result = harness.evaluate(BASE_GRAMMAR, 24, Duration::ZERO);
        assert!(matches!(result, Err(EvaluationError::Timeout { .. })));
    }

    #[test]
    fn proposer_starts_with_vocabulary_compression() {
        let mut proposer = OfflineProposer::new();
        let metrics = OfflineHarness::new(1)
            .evaluate(BASE_GRAMMAR, 8, budget())
            .unwrap()
            .metrics;
        let patch = proposer.propose(BASE_GRAMMAR, &metrics, &[]).unwrap();
        assert!(matches!(
            patch.mutations.first(),
            Some(MutationOp::MapVocab { .. })
        ));
    }

    #[test]
    fn proposer_rotates_between_applicable_steps() {
        let mut proposer = OfflineProposer::new();
        let metrics = OfflineHarness::new(1)
            .evaluate(BASE_GRAMMAR, 8, budget())
            .unwrap()
            .metrics;
        let first = proposer.propose(BASE_GRAMMAR, &metrics, &[]).unwrap();
        let second = proposer.propose(BASE_GRAMMAR, &metrics, &[]).unwrap();
        assert_ne!(first.mutations, second.mutations);
    }
}
