//! Proposer patch contract and the pre-engine validator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::model::{self, GrammarModel, Symbol};
use super::mutation::{MutationEngine, MutationError, MutationOp};
use crate::schema::GrammarCaps;

/// An ordered batch of mutation operations proposed for one grammar,
/// plus optional few-shot example lists for the external encoding and
/// decoding agents. The few-shot payloads are opaque to the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    pub mutations: Vec<MutationOp>,
    #[serde(default)]
    pub speaker_fewshot: Vec<serde_json::Value>,
    #[serde(default)]
    pub listener_fewshot: Vec<serde_json::Value>,
}

impl Patch {
    /// Parse a patch from proposer JSON output. An unknown operation name
    /// or a missing required field fails here, never silently.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_ops(mutations: Vec<MutationOp>) -> Self {
        Self {
            mutations,
            ..Self::default()
        }
    }
}

/// Patch rejection reasons, surfaced before the engine is invoked.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch has no mutations")]
    Empty,
    #[error("mutation {index} ({op}): {message}")]
    Schema {
        index: usize,
        op: &'static str,
        message: String,
    },
    #[error("mutation {index} targets unknown rule `{name}`")]
    UnknownTarget { index: usize, name: String },
    #[error("mutation {index} references `{symbol}`, which is not defined in the grammar or this patch")]
    UndefinedReference { index: usize, symbol: String },
    #[error("patch would be rejected by the engine: {0}")]
    Inadmissible(#[from] MutationError),
}

/// Schema- and semantics-checks a patch before it reaches the engine.
///
/// Schema checks cover what typed deserialization cannot: empty names,
/// zero lengths, degenerate mappings, patterns that do not compile.
/// Semantic checks walk the op sequence against a symbol table so that
/// targets exist when each op runs and rule-body references resolve within
/// the grammar or the same patch. Cap conformance is confirmed by a
/// dry-run application on a scratch model.
#[derive(Debug, Clone)]
pub struct PatchValidator {
    engine: MutationEngine,
}

impl PatchValidator {
    pub fn new(caps: GrammarCaps) -> Self {
        Self {
            engine: MutationEngine::new(caps),
        }
    }

    pub fn validate(&self, model: &GrammarModel, patch: &Patch) -> Result<(), PatchError> {
        if patch.mutations.is_empty() {
            return Err(PatchError::Empty);
        }

        for (index, op) in patch.mutations.iter().enumerate() {
            check_schema(index, op)?;
        }
        check_semantics(model, &patch.mutations)?;

        // Dry run: caps, bijectivity, and anything else op application
        // enforces, without touching the caller's model.
        self.engine.apply_patch(model, &patch.mutations)?;
        Ok(())
    }
}

fn schema_err(index: usize, op: &MutationOp, message: impl Into<String>) -> PatchError {
    PatchError::Schema {
        index,
        op: op.name(),
        message: message.into(),
    }
}

fn check_schema(index: usize, op: &MutationOp) -> Result<(), PatchError> {
    match op {
        MutationOp::RenameTerminal { from, to } => {
            if from.is_empty() || to.is_empty() {
                return Err(schema_err(index, op, "`from` and `to` must be non-empty"));
            }
            if to.contains('"') || to.chars().any(char::is_whitespace) {
                return Err(schema_err(index, op, "`to` is not a valid literal token"));
            }
        }
        MutationOp::RestrictTerminal { name, pattern } => {
            if !model::is_ident(name) {
                return Err(schema_err(index, op, format!("invalid rule name `{name}`")));
            }
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(schema_err(index, op, format!("pattern does not compile: {e}")));
            }
        }
        MutationOp::RemoveSeparators => {}
        MutationOp::ReplaceRule { lhs, rhs } | MutationOp::AddRule { lhs, rhs } => {
            if !model::is_ident(lhs) {
                return Err(schema_err(index, op, format!("invalid rule name `{lhs}`")));
            }
            if let Err(e) = model::parse_rule_body(rhs) {
                return Err(schema_err(index, op, format!("rule body: {e}")));
            }
        }
        MutationOp::DropRule { lhs } => {
            if !model::is_ident(lhs) {
                return Err(schema_err(index, op, format!("invalid rule name `{lhs}`")));
            }
        }
        MutationOp::FixLength { symbol, n } => {
            if !model::is_ident(symbol) {
                return Err(schema_err(index, op, format!("invalid rule name `{symbol}`")));
            }
            if *n == 0 {
                return Err(schema_err(index, op, "length must be at least 1"));
            }
        }
        MutationOp::MapVocab { slot, mapping } => {
            if !model::is_ident(slot) {
                return Err(schema_err(index, op, format!("invalid rule name `{slot}`")));
            }
            if mapping.is_empty() {
                return Err(schema_err(index, op, "mapping must be non-empty"));
            }
        }
        MutationOp::AddChecksum { mod_base } => {
            if *mod_base < 2 {
                return Err(schema_err(index, op, "checksum base must be at least 2"));
            }
        }
    }
    Ok(())
}

/// Walk the op sequence against a running symbol table. A target must be
/// defined when its op runs; rule-body references may be satisfied by the
/// grammar or by any `add_rule` in the same patch.
fn check_semantics(model: &GrammarModel, ops: &[MutationOp]) -> Result<(), PatchError> {
    let mut defined: HashSet<String> = model.rules().iter().map(|r| r.name.clone()).collect();
    let patch_defined: HashSet<&str> = ops
        .iter()
        .filter_map(|op| match op {
            MutationOp::AddRule { lhs, .. } => Some(lhs.as_str()),
            _ => None,
        })
        .collect();

    for (index, op) in ops.iter().enumerate() {
        match op {
            MutationOp::RestrictTerminal { name, .. } => {
                require_defined(index, name, &defined)?;
            }
            MutationOp::ReplaceRule { lhs, rhs } => {
                require_defined(index, lhs, &defined)?;
                check_body_refs(index, op, rhs, &defined, &patch_defined)?;
            }
            MutationOp::AddRule { lhs, rhs } => {
                check_body_refs(index, op, rhs, &defined, &patch_defined)?;
                defined.insert(lhs.clone());
            }
            MutationOp::DropRule { lhs } => {
                require_defined(index, lhs, &defined)?;
                defined.remove(lhs);
            }
            MutationOp::FixLength { symbol, .. } => {
                require_defined(index, symbol, &defined)?;
            }
            MutationOp::MapVocab { slot, .. } => {
                require_defined(index, slot, &defined)?;
            }
            MutationOp::RenameTerminal { .. }
            | MutationOp::RemoveSeparators
            | MutationOp::AddChecksum { .. } => {}
        }
    }
    Ok(())
}

fn require_defined(index: usize, name: &str, defined: &HashSet<String>) -> Result<(), PatchError> {
    if defined.contains(name) {
        Ok(())
    } else {
        Err(PatchError::UnknownTarget {
            index,
            name: name.to_string(),
        })
    }
}

fn check_body_refs(
    index: usize,
    op: &MutationOp,
    rhs: &str,
    defined: &HashSet<String>,
    patch_defined: &HashSet<&str>,
) -> Result<(), PatchError> {
    let alternatives = model::parse_rule_body(rhs)
        .map_err(|e| schema_err(index, op, format!("rule body: {e}")))?;
    for alt in &alternatives {
        for sym in alt {
            if let Symbol::Nonterminal(n) = sym
                && !defined.contains(n)
                && !patch_defined.contains(n.as_str())
            {
                return Err(PatchError::UndefinedReference {
                    index,
                    symbol: n.clone(),
                });
            }
        }
    }
    Ok(())
}
