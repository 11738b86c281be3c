//! Mutation operations and the engine that applies them atomically.
//!
//! The operation set is closed: one variant per supported transformation,
//! exhaustively handled. An unrecognized operation name fails patch
//! deserialization and never reaches the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{self, GrammarError, GrammarModel, Rule, Symbol};
use crate::schema::GrammarCaps;

/// Literal tokens treated as separators by `RemoveSeparators`.
fn is_separator(sym: &Symbol) -> bool {
    match sym {
        Symbol::Literal(t) => {
            !t.is_empty()
                && t.chars()
                    .all(|c| matches!(c, ';' | ',' | ':' | '.' | '|') || c.is_whitespace())
        }
        _ => false,
    }
}

/// A single grammar transformation, as proposed by the external proposer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationOp {
    /// Rename a literal terminal everywhere it occurs.
    RenameTerminal { from: String, to: String },
    /// Replace the matching pattern of the named rule's terminal.
    RestrictTerminal { name: String, pattern: String },
    /// Strip literal separator tokens from every alternative.
    RemoveSeparators,
    /// Overwrite one rule's alternatives. `rhs` is rule-body text.
    ReplaceRule { lhs: String, rhs: String },
    /// Define a new rule. `rhs` is rule-body text.
    AddRule { lhs: String, rhs: String },
    /// Remove a rule definition.
    DropRule { lhs: String },
    /// Constrain the named rule's terminal to exactly `n` characters.
    FixLength { symbol: String, n: usize },
    /// Replace the slot rule's literal alternatives through a codebook.
    MapVocab {
        slot: String,
        mapping: BTreeMap<String, String>,
    },
    /// Append a derived checksum symbol to every start-rule alternative.
    AddChecksum { mod_base: u32 },
}

impl MutationOp {
    /// Operation name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RenameTerminal { .. } => "rename_terminal",
            Self::RestrictTerminal { .. } => "restrict_terminal",
            Self::RemoveSeparators => "remove_separators",
            Self::ReplaceRule { .. } => "replace_rule",
            Self::AddRule { .. } => "add_rule",
            Self::DropRule { .. } => "drop_rule",
            Self::FixLength { .. } => "fix_length",
            Self::MapVocab { .. } => "map_vocab",
            Self::AddChecksum { .. } => "add_checksum",
        }
    }
}

/// Operation-specific application failures.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("symbol `{name}` not found")]
    SymbolNotFound { name: String },
    #[error("cannot drop rule `{name}`: still referenced by `{referenced_by}`")]
    ReferencedRule { name: String, referenced_by: String },
    #[error("cannot drop the start rule `{name}`")]
    CannotDropStart { name: String },
    #[error("rule `{lhs}` is already defined")]
    RuleExists { lhs: String },
    #[error("mapping is not bijective: code `{code}` assigned to more than one value")]
    NonBijectiveMapping { code: String },
    #[error("code `{code}` is not a valid literal token")]
    InvalidCode { code: String },
    #[error("pattern `{pattern}` does not compile: {source}")]
    PatternCompile {
        pattern: String,
        source: Box<regex::Error>,
    },
    #[error("fixed length must be at least 1")]
    ZeroLength,
    #[error("checksum base {base} must be at least 2")]
    ChecksumBase { base: u32 },
    #[error("invalid rule body `{rhs}`: {source}")]
    RuleBody { rhs: String, source: GrammarError },
    #[error(transparent)]
    Model(#[from] GrammarError),
}

/// Applies mutation operations to grammar models.
///
/// Application is transactional across a whole patch: either every op
/// succeeds and the result passes model validation, or the error is
/// returned and the caller keeps the original model. The input is never
/// modified, so no partial application is observable.
#[derive(Debug, Clone)]
pub struct MutationEngine {
    caps: GrammarCaps,
}

impl MutationEngine {
    pub fn new(caps: GrammarCaps) -> Self {
        Self { caps }
    }

    /// Apply a single operation, producing a new validated model.
    pub fn apply(
        &self,
        model: &GrammarModel,
        op: &MutationOp,
    ) -> Result<GrammarModel, MutationError> {
        self.apply_patch(model, std::slice::from_ref(op))
    }

    /// Apply an ordered op list, producing a new validated model.
    pub fn apply_patch(
        &self,
        model: &GrammarModel,
        ops: &[MutationOp],
    ) -> Result<GrammarModel, MutationError> {
        let start = model.start().to_string();
        let mut rules = model.rules().to_vec();

        for op in ops {
            apply_op(&mut rules, &start, op)?;
        }

        let next = GrammarModel::from_parts(start, rules);
        next.validate(&self.caps)?;
        Ok(next)
    }
}

fn apply_op(rules: &mut Vec<Rule>, start: &str, op: &MutationOp) -> Result<(), MutationError> {
    match op {
        MutationOp::RenameTerminal { from, to } => {
            if to.is_empty() || to.contains('"') || to.chars().any(char::is_whitespace) {
                return Err(MutationError::InvalidCode { code: to.clone() });
            }
            let mut renamed = 0usize;
            for rule in rules.iter_mut() {
                for alt in &mut rule.alternatives {
                    for sym in alt.iter_mut() {
                        if matches!(sym, Symbol::Literal(t) if t == from) {
                            *sym = Symbol::Literal(to.clone());
                            renamed += 1;
                        }
                    }
                }
            }
            if renamed == 0 {
                return Err(MutationError::SymbolNotFound { name: from.clone() });
            }
            Ok(())
        }

        MutationOp::RestrictTerminal { name, pattern } => {
            compile_pattern(pattern)?;
            let rule = find_rule_mut(rules, name)?;
            let mut replaced = 0usize;
            for alt in &mut rule.alternatives {
                for sym in alt.iter_mut() {
                    if matches!(sym, Symbol::Pattern(_)) {
                        *sym = Symbol::Pattern(pattern.clone());
                        replaced += 1;
                    }
                }
            }
            if replaced == 0 {
                return Err(MutationError::SymbolNotFound { name: name.clone() });
            }
            Ok(())
        }

        MutationOp::RemoveSeparators => {
            for rule in rules.iter_mut() {
                for alt in &mut rule.alternatives {
                    alt.retain(|sym| !is_separator(sym));
                }
                rule.alternatives.retain(|alt| !alt.is_empty());
            }
            Ok(())
        }

        MutationOp::ReplaceRule { lhs, rhs } => {
            let alternatives = parse_body(rhs)?;
            let rule = find_rule_mut(rules, lhs)?;
            rule.alternatives = alternatives;
            Ok(())
        }

        MutationOp::AddRule { lhs, rhs } => {
            if !model::is_ident(lhs) {
                return Err(MutationError::RuleBody {
                    rhs: lhs.clone(),
                    source: GrammarError::Syntax {
                        line: 0,
                        message: format!("invalid rule name `{lhs}`"),
                    },
                });
            }
            if rules.iter().any(|r| r.name == *lhs) {
                return Err(MutationError::RuleExists { lhs: lhs.clone() });
            }
            let alternatives = parse_body(rhs)?;
            rules.push(Rule {
                name: lhs.clone(),
                alternatives,
            });
            Ok(())
        }

        MutationOp::DropRule { lhs } => {
            if lhs == start {
                return Err(MutationError::CannotDropStart { name: lhs.clone() });
            }
            if !rules.iter().any(|r| r.name == *lhs) {
                return Err(MutationError::SymbolNotFound { name: lhs.clone() });
            }
            for rule in rules.iter() {
                if rule.name == *lhs {
                    continue;
                }
                let references = rule
                    .alternatives
                    .iter()
                    .flatten()
                    .any(|sym| matches!(sym, Symbol::Nonterminal(n) if n == lhs));
                if references {
                    return Err(MutationError::ReferencedRule {
                        name: lhs.clone(),
                        referenced_by: rule.name.clone(),
                    });
                }
            }
            rules.retain(|r| r.name != *lhs);
            Ok(())
        }

        MutationOp::FixLength { symbol, n } => {
            if *n == 0 {
                return Err(MutationError::ZeroLength);
            }
            let rule = find_rule_mut(rules, symbol)?;
            let mut fixed = 0usize;
            for alt in &mut rule.alternatives {
                for sym in alt.iter_mut() {
                    if let Symbol::Pattern(p) = sym {
                        let widened = fixed_width(p, *n);
                        compile_pattern(&widened)?;
                        *sym = Symbol::Pattern(widened);
                        fixed += 1;
                    }
                }
            }
            if fixed == 0 {
                return Err(MutationError::SymbolNotFound {
                    name: symbol.clone(),
                });
            }
            Ok(())
        }

        MutationOp::MapVocab { slot, mapping } => {
            let mut codes = std::collections::HashSet::new();
            for code in mapping.values() {
                if code.is_empty() || code.contains('"') || code.chars().any(char::is_whitespace) {
                    return Err(MutationError::InvalidCode { code: code.clone() });
                }
                if !codes.insert(code.as_str()) {
                    return Err(MutationError::NonBijectiveMapping { code: code.clone() });
                }
            }
            let rule = find_rule_mut(rules, slot)?;
            for alt in &mut rule.alternatives {
                if let [Symbol::Literal(t)] = alt.as_mut_slice()
                    && let Some(code) = mapping.get(t.as_str())
                {
                    *t = code.clone();
                }
            }
            Ok(())
        }

        MutationOp::AddChecksum { mod_base } => {
            if *mod_base < 2 {
                return Err(MutationError::ChecksumBase { base: *mod_base });
            }
            let rule = find_rule_mut(rules, start)?;
            for alt in &mut rule.alternatives {
                alt.push(Symbol::Checksum {
                    mod_base: *mod_base,
                });
            }
            Ok(())
        }
    }
}

fn find_rule_mut<'a>(rules: &'a mut [Rule], name: &str) -> Result<&'a mut Rule, MutationError> {
    rules
        .iter_mut()
        .find(|r| r.name == name)
        .ok_or_else(|| MutationError::SymbolNotFound {
            name: name.to_string(),
        })
}

fn parse_body(rhs: &str) -> Result<Vec<super::model::Alternative>, MutationError> {
    model::parse_rule_body(rhs).map_err(|source| MutationError::RuleBody {
        rhs: rhs.to_string(),
        source,
    })
}

fn compile_pattern(pattern: &str) -> Result<(), MutationError> {
    regex::Regex::new(pattern).map(|_| ()).map_err(|source| {
        MutationError::PatternCompile {
            pattern: pattern.to_string(),
            source: Box::new(source),
        }
    })
}

/// Rewrite a pattern to an exactly-`n`-repetitions form. A leading character
/// class is reused; anything else is de-quantified and grouped.
fn fixed_width(pattern: &str, n: usize) -> String {
    let base = if let Some(stripped) = pattern
        .strip_suffix('+')
        .or_else(|| pattern.strip_suffix('*'))
    {
        stripped
    } else if pattern.ends_with('}') {
        match pattern.rfind('{') {
            Some(idx) => &pattern[..idx],
            None => pattern,
        }
    } else {
        pattern
    };

    let class_like = base.starts_with('[') && base.ends_with(']');
    let atomic = class_like || base.chars().count() == 1 || matches!(base, "\\d" | "\\w" | "\\S");
    if atomic {
        format!("{base}{{{n}}}")
    } else {
        format!("(?:{base}){{{n}}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::BASE_GRAMMAR;

    fn engine() -> MutationEngine {
        MutationEngine::new(GrammarCaps::default())
    }

    fn base() -> GrammarModel {
        GrammarModel::parse(BASE_GRAMMAR).unwrap()
    }

    #[test]
    fn rename_terminal_everywhere() {
        let model = base();
        let out = engine()
            .apply(
                &model,
                &MutationOp::RenameTerminal {
                    from: "color".into(),
                    to: "c".into(),
                },
            )
            .unwrap();
        assert!(out.serialize().contains("\"c\""));
        assert!(!out.serialize().contains("\"color\""));
        // Original untouched.
        assert!(model.serialize().contains("\"color\""));
    }

    #[test]
    fn rename_missing_terminal_fails() {
        let err = engine()
            .apply(
                &base(),
                &MutationOp::RenameTerminal {
                    from: "weight".into(),
                    to: "w".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, MutationError::SymbolNotFound { ref name } if name == "weight"));
    }

    #[test]
    fn rename_rejects_unserializable_replacement() {
        // A replacement with whitespace or a quote would not survive the
        // serialize/parse round trip, so the engine refuses it even when
        // no validator ran first.
        for bad in ["", "a b", "c\"d"] {
            let err = engine()
                .apply(
                    &base(),
                    &MutationOp::RenameTerminal {
                        from: "color".into(),
                        to: bad.into(),
                    },
                )
                .unwrap_err();
            assert!(matches!(err, MutationError::InvalidCode { ref code } if code == bad));
        }
    }

    #[test]
    fn restrict_terminal_rejects_bad_pattern() {
        let err = engine()
            .apply(
                &base(),
                &MutationOp::RestrictTerminal {
                    name: "value".into(),
                    pattern: "[a-z".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, MutationError::PatternCompile { .. }));
    }

    #[test]
    fn remove_separators_strips_punctuation_literals() {
        let out = engine()
            .apply(&base(), &MutationOp::RemoveSeparators)
            .unwrap();
        let text = out.serialize();
        assert!(!text.contains("\";\""));
        assert!(!text.contains("\":\""));
        // Slot name literals survive.
        assert!(text.contains("\"color\""));
    }

    #[test]
    fn drop_rule_fails_while_referenced() {
        // Scenario: dropping a nonterminal still referenced elsewhere.
        let model = base();
        let err = engine()
            .apply(
                &model,
                &MutationOp::DropRule {
                    lhs: "value".into(),
                },
            )
            .unwrap_err();
        assert!(
            matches!(err, MutationError::ReferencedRule { ref name, ref referenced_by }
                if name == "value" && referenced_by == "phrase")
        );
    }

    #[test]
    fn drop_rule_succeeds_after_dereference() {
        let model = base();
        let ops = vec![
            MutationOp::ReplaceRule {
                lhs: "phrase".into(),
                rhs: "slot \":\" /[a-z]+/".into(),
            },
            MutationOp::DropRule {
                lhs: "value".into(),
            },
        ];
        let out = engine().apply_patch(&model, &ops).unwrap();
        assert!(out.rule("value").is_none());
    }

    #[test]
    fn drop_start_rule_fails() {
        let err = engine()
            .apply(&base(), &MutationOp::DropRule { lhs: "msg".into() })
            .unwrap_err();
        assert!(matches!(err, MutationError::CannotDropStart { .. }));
    }

    #[test]
    fn map_vocab_rewrites_codebook() {
        let mapping: BTreeMap<String, String> = [
            ("color", "c"),
            ("shape", "s"),
            ("size", "z"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let out = engine()
            .apply(
                &base(),
                &MutationOp::MapVocab {
                    slot: "slot".into(),
                    mapping,
                },
            )
            .unwrap();
        let slot = out.rule("slot").unwrap();
        assert_eq!(slot.alternatives[0], vec![Symbol::Literal("c".into())]);
        assert_eq!(slot.alternatives[2], vec![Symbol::Literal("z".into())]);
    }

    #[test]
    fn map_vocab_rejects_non_bijective_mapping() {
        // Scenario: {red -> "a", blue -> "a"} collides.
        let mapping: BTreeMap<String, String> = [("red", "a"), ("blue", "a")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let err = engine()
            .apply(
                &base(),
                &MutationOp::MapVocab {
                    slot: "slot".into(),
                    mapping,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MutationError::NonBijectiveMapping { ref code } if code == "a"));
    }

    #[test]
    fn fix_length_reuses_character_class() {
        let out = engine()
            .apply(
                &base(),
                &MutationOp::FixLength {
                    symbol: "value".into(),
                    n: 3,
                },
            )
            .unwrap();
        let value = out.rule("value").unwrap();
        assert_eq!(
            value.alternatives[0],
            vec![Symbol::Pattern("[a-z]{3}".into())]
        );
    }

    #[test]
    fn fixed_width_grouping() {
        assert_eq!(fixed_width("[a-z]+", 3), "[a-z]{3}");
        assert_eq!(fixed_width("[0-9]{2,5}", 4), "[0-9]{4}");
        assert_eq!(fixed_width("\\d", 2), "\\d{2}");
        assert_eq!(fixed_width("ab", 2), "(?:ab){2}");
    }

    #[test]
    fn add_checksum_appends_to_start_rule() {
        let out = engine()
            .apply(&base(), &MutationOp::AddChecksum { mod_base: 10 })
            .unwrap();
        let msg = out.rule("msg").unwrap();
        for alt in &msg.alternatives {
            assert_eq!(alt.last(), Some(&Symbol::Checksum { mod_base: 10 }));
        }
    }

    #[test]
    fn add_checksum_rejects_small_base() {
        let err = engine()
            .apply(&base(), &MutationOp::AddChecksum { mod_base: 1 })
            .unwrap_err();
        assert!(matches!(err, MutationError::ChecksumBase { base: 1 }));
    }

    #[test]
    fn patch_is_atomic_on_late_failure() {
        let model = base();
        let before = model.serialize();
        let ops = vec![
            MutationOp::RenameTerminal {
                from: "color".into(),
                to: "c".into(),
            },
            // No literal named "flavor" exists, so the second op fails.
            MutationOp::RenameTerminal {
                from: "flavor".into(),
                to: "f".into(),
            },
        ];
        assert!(engine().apply_patch(&model, &ops).is_err());
        assert_eq!(model.serialize(), before);
    }

    #[test]
    fn replace_rule_with_dangling_reference_fails() {
        let err = engine()
            .apply(
                &base(),
                &MutationOp::ReplaceRule {
                    lhs: "phrase".into(),
                    rhs: "slot \":\" amount".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MutationError::Model(GrammarError::UndefinedSymbol { ref symbol, .. })
                if symbol == "amount"
        ));
    }

    #[test]
    fn add_rule_then_reference_in_same_patch() {
        let ops = vec![
            MutationOp::AddRule {
                lhs: "amount".into(),
                rhs: "/[0-9]{2}/".into(),
            },
            MutationOp::ReplaceRule {
                lhs: "phrase".into(),
                rhs: "slot \":\" amount".into(),
            },
        ];
        let out = engine().apply_patch(&base(), &ops).unwrap();
        assert!(out.rule("amount").is_some());
    }

    #[test]
    fn unknown_op_name_fails_deserialization() {
        let err = serde_json::from_str::<MutationOp>(r#"{"op": "simplify_message_rule"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn ops_round_trip_through_json() {
        let op = MutationOp::MapVocab {
            slot: "slot".into(),
            mapping: [("color".to_string(), "c".to_string())].into_iter().collect(),
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: MutationOp = serde_json::from_str(&json).unwrap();
        assert_eq!(op, back);
    }
}
