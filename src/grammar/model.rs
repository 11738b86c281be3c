//! Structured grammar model with parsing, serialization, and validation.
//!
//! A grammar is an ordered list of production rules, one nonterminal per
//! line. The first rule defines the start symbol. Alternatives are separated
//! by `|`; symbols within an alternative are whitespace-separated tokens:
//! `"literal"`, `/pattern/`, `%checksum(N)`, or a bare nonterminal name.
//!
//! Models are immutable once constructed. Every mutation builds a new
//! instance; the round-trip law `parse(serialize(m)) == m` holds for any
//! model the parser accepts.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::schema::GrammarCaps;

/// A single symbol on the right-hand side of a production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbol {
    /// Reference to another rule.
    Nonterminal(String),
    /// Exact literal token.
    Literal(String),
    /// Matching pattern (regex character class or fragment).
    Pattern(String),
    /// Derived checksum symbol: value of the preceding fields modulo `mod_base`,
    /// computed at message-construction time.
    Checksum { mod_base: u32 },
}

/// One alternative: an ordered sequence of symbols.
pub type Alternative = Vec<Symbol>;

/// A production rule: a nonterminal and its ordered alternatives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub alternatives: Vec<Alternative>,
}

/// Immutable grammar model. The start symbol is the first rule's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarModel {
    start: String,
    rules: Vec<Rule>,
}

/// Grammar parsing and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("grammar has no rules")]
    Empty,
    #[error("duplicate definition of rule `{name}`")]
    DuplicateRule { name: String },
    #[error("rule `{name}` has no alternatives")]
    EmptyRule { name: String },
    #[error("rule `{rule}` references undefined symbol `{symbol}`")]
    UndefinedSymbol { rule: String, symbol: String },
    #[error("grammar has {count} productions, cap is {max}")]
    ProductionCountExceeded { count: usize, max: usize },
    #[error("grammar nesting depth {depth} exceeds cap {max}")]
    DepthExceeded { depth: usize, max: usize },
}

fn syntax(line: usize, message: impl Into<String>) -> GrammarError {
    GrammarError::Syntax {
        line,
        message: message.into(),
    }
}

pub(crate) fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl GrammarModel {
    /// Parse grammar text into a model.
    ///
    /// Blank lines and `#` comments are skipped and not preserved;
    /// serialization is canonical.
    pub fn parse(text: &str) -> Result<Self, GrammarError> {
        let mut rules: Vec<Rule> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, body)) = line.split_once(':') else {
                return Err(syntax(line_no, "missing ':' between rule name and body"));
            };
            let name = name.trim();
            if !is_ident(name) {
                return Err(syntax(line_no, format!("invalid rule name `{name}`")));
            }
            if !seen.insert(name.to_string()) {
                return Err(GrammarError::DuplicateRule {
                    name: name.to_string(),
                });
            }

            let alternatives = tokenize_body(body, line_no)?;
            rules.push(Rule {
                name: name.to_string(),
                alternatives,
            });
        }

        if rules.is_empty() {
            return Err(GrammarError::Empty);
        }

        let start = rules[0].name.clone();
        Ok(Self { start, rules })
    }

    /// Rebuild a model from raw parts. The result is not validated; callers
    /// run `validate` before handing the model out.
    pub(crate) fn from_parts(start: String, rules: Vec<Rule>) -> Self {
        Self { start, rules }
    }

    /// The start symbol (first rule's name).
    pub fn start(&self) -> &str {
        &self.start
    }

    /// All rules in definition order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Look up a rule by name.
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Serialize to canonical grammar text, one rule per line.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            let alts: Vec<String> = rule
                .alternatives
                .iter()
                .map(|alt| {
                    alt.iter()
                        .map(symbol_text)
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            let _ = writeln!(out, "{}: {}", rule.name, alts.join(" | "));
        }
        out
    }

    /// Validate structural invariants: every referenced nonterminal is
    /// defined, no empty rules, and the configured production and depth
    /// caps are respected.
    pub fn validate(&self, caps: &GrammarCaps) -> Result<(), GrammarError> {
        if self.rules.is_empty() {
            return Err(GrammarError::Empty);
        }

        let defined: HashSet<&str> = self.rules.iter().map(|r| r.name.as_str()).collect();

        for rule in &self.rules {
            if rule.alternatives.is_empty() || rule.alternatives.iter().any(|a| a.is_empty()) {
                return Err(GrammarError::EmptyRule {
                    name: rule.name.clone(),
                });
            }
            for alt in &rule.alternatives {
                for sym in alt {
                    if let Symbol::Nonterminal(n) = sym
                        && !defined.contains(n.as_str())
                    {
                        return Err(GrammarError::UndefinedSymbol {
                            rule: rule.name.clone(),
                            symbol: n.clone(),
                        });
                    }
                }
            }
        }

        let count = self.production_count();
        if count > caps.max_productions {
            return Err(GrammarError::ProductionCountExceeded {
                count,
                max: caps.max_productions,
            });
        }

        let depth = self.reference_depth();
        if depth > caps.max_depth {
            return Err(GrammarError::DepthExceeded {
                depth,
                max: caps.max_depth,
            });
        }

        Ok(())
    }

    /// Total number of alternatives across all rules.
    pub fn production_count(&self) -> usize {
        self.rules.iter().map(|r| r.alternatives.len()).sum()
    }

    /// Longest nonterminal reference chain starting at the start symbol.
    /// Cycles contribute no extra depth, so recursive list rules stay legal.
    pub fn reference_depth(&self) -> usize {
        let mut on_path = HashSet::new();
        self.depth_of(&self.start, &mut on_path)
    }

    fn depth_of(&self, name: &str, on_path: &mut HashSet<String>) -> usize {
        let Some(rule) = self.rule(name) else {
            return 1;
        };
        if !on_path.insert(name.to_string()) {
            return 0;
        }
        let mut deepest = 0;
        for alt in &rule.alternatives {
            for sym in alt {
                if let Symbol::Nonterminal(n) = sym {
                    deepest = deepest.max(self.depth_of(n, on_path));
                }
            }
        }
        on_path.remove(name);
        1 + deepest
    }
}

fn symbol_text(sym: &Symbol) -> String {
    match sym {
        Symbol::Nonterminal(n) => n.clone(),
        Symbol::Literal(t) => format!("\"{t}\""),
        Symbol::Pattern(p) => format!("/{}/", p.replace('/', "\\/")),
        Symbol::Checksum { mod_base } => format!("%checksum({mod_base})"),
    }
}

/// Parse a rule body (everything after the `:`) into alternatives.
/// Used by the parser and by mutation operations that carry rule-body text.
pub(crate) fn parse_rule_body(body: &str) -> Result<Vec<Alternative>, GrammarError> {
    tokenize_body(body, 0)
}

fn tokenize_body(body: &str, line: usize) -> Result<Vec<Alternative>, GrammarError> {
    let mut alternatives: Vec<Alternative> = Vec::new();
    let mut current: Alternative = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '|' => {
                if current.is_empty() {
                    return Err(syntax(line, "empty alternative before `|`"));
                }
                alternatives.push(std::mem::take(&mut current));
            }
            '"' => {
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(syntax(line, "unterminated literal")),
                    }
                }
                current.push(Symbol::Literal(text));
            }
            '/' => {
                let mut pat = String::new();
                loop {
                    match chars.next() {
                        Some('\\') if chars.peek() == Some(&'/') => {
                            chars.next();
                            pat.push('/');
                        }
                        Some('/') => break,
                        Some(ch) => pat.push(ch),
                        None => return Err(syntax(line, "unterminated pattern")),
                    }
                }
                if pat.is_empty() {
                    return Err(syntax(line, "empty pattern"));
                }
                current.push(Symbol::Pattern(pat));
            }
            '%' => {
                let rest: String = chars.clone().collect();
                let Some(args) = rest.strip_prefix("checksum(") else {
                    return Err(syntax(line, "expected `%checksum(N)`"));
                };
                let Some(end) = args.find(')') else {
                    return Err(syntax(line, "unterminated `%checksum(`"));
                };
                let digits = &args[..end];
                let mod_base: u32 = digits
                    .parse()
                    .map_err(|_| syntax(line, format!("invalid checksum base `{digits}`")))?;
                // Skip "checksum(" + digits + ")".
                for _ in 0.."checksum(".len() + digits.len() + 1 {
                    chars.next();
                }
                current.push(Symbol::Checksum { mod_base });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                name.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                current.push(Symbol::Nonterminal(name));
            }
            other => {
                return Err(syntax(line, format!("unexpected character `{other}`")));
            }
        }
    }

    if current.is_empty() {
        return Err(syntax(line, "rule body has a trailing empty alternative"));
    }
    alternatives.push(current);
    Ok(alternatives)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::BASE_GRAMMAR;

    fn caps() -> GrammarCaps {
        GrammarCaps::default()
    }

    #[test]
    fn parse_base_grammar() {
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        assert_eq!(model.start(), "msg");
        assert_eq!(model.rules().len(), 4);
        assert!(model.validate(&caps()).is_ok());

        let slot = model.rule("slot").unwrap();
        assert_eq!(slot.alternatives.len(), 3);
        assert_eq!(slot.alternatives[0], vec![Symbol::Literal("color".into())]);
    }

    #[test]
    fn round_trip_base_grammar() {
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        let text = model.serialize();
        let reparsed = GrammarModel::parse(&text).unwrap();
        assert_eq!(model, reparsed);
    }

    #[test]
    fn round_trip_checksum_and_escaped_pattern() {
        let text = "msg: field %checksum(7)\nfield: /a\\/b/ | \"x\"\n";
        let model = GrammarModel::parse(text).unwrap();
        assert_eq!(
            model.rule("msg").unwrap().alternatives[0][1],
            Symbol::Checksum { mod_base: 7 }
        );
        assert_eq!(
            model.rule("field").unwrap().alternatives[0][0],
            Symbol::Pattern("a/b".into())
        );
        let reparsed = GrammarModel::parse(&model.serialize()).unwrap();
        assert_eq!(model, reparsed);
    }

    #[test]
    fn rejects_missing_colon() {
        let err = GrammarModel::parse("msg phrase\n").unwrap_err();
        assert!(matches!(err, GrammarError::Syntax { line: 1, .. }));
    }

    #[test]
    fn rejects_unterminated_literal() {
        let err = GrammarModel::parse("msg: \"oops\n").unwrap_err();
        assert!(matches!(err, GrammarError::Syntax { .. }));
    }

    #[test]
    fn rejects_duplicate_rule() {
        let err = GrammarModel::parse("a: \"x\"\na: \"y\"\n").unwrap_err();
        assert!(matches!(err, GrammarError::DuplicateRule { .. }));
    }

    #[test]
    fn validate_flags_undefined_symbol() {
        let model = GrammarModel::parse("msg: phrase\n").unwrap();
        let err = model.validate(&caps()).unwrap_err();
        assert!(
            matches!(err, GrammarError::UndefinedSymbol { ref symbol, .. } if symbol == "phrase")
        );
    }

    #[test]
    fn validate_enforces_production_cap() {
        let model = GrammarModel::parse("a: \"x\" | \"y\" | \"z\"\n").unwrap();
        let tight = GrammarCaps {
            max_productions: 2,
            max_depth: 8,
        };
        let err = model.validate(&tight).unwrap_err();
        assert!(matches!(
            err,
            GrammarError::ProductionCountExceeded { count: 3, max: 2 }
        ));
    }

    #[test]
    fn validate_enforces_depth_cap() {
        let model = GrammarModel::parse("a: b\nb: c\nc: \"x\"\n").unwrap();
        assert_eq!(model.reference_depth(), 3);
        let tight = GrammarCaps {
            max_productions: 32,
            max_depth: 2,
        };
        assert!(matches!(
            model.validate(&tight).unwrap_err(),
            GrammarError::DepthExceeded { depth: 3, max: 2 }
        ));
    }

    #[test]
    fn recursion_does_not_blow_depth() {
        // msg references itself through the list alternative.
        let model = GrammarModel::parse(BASE_GRAMMAR).unwrap();
        assert!(model.reference_depth() <= 4);
    }

    mod round_trip_property {
        use super::*;
        use proptest::prelude::*;

        fn symbol_strategy(names: Vec<String>) -> impl Strategy<Value = Symbol> {
            prop_oneof![
                proptest::sample::select(names).prop_map(Symbol::Nonterminal),
                "[a-z]{1,6}".prop_map(Symbol::Literal),
                "\\[a-z\\]|\\[0-9\\]\\{2\\}|[a-z]\\+".prop_map(Symbol::Pattern),
                (2u32..=64).prop_map(|mod_base| Symbol::Checksum { mod_base }),
            ]
        }

        fn model_strategy() -> impl Strategy<Value = GrammarModel> {
            let names: Vec<String> = (0..4).map(|i| format!("r{i}")).collect();
            let alt = proptest::collection::vec(symbol_strategy(names.clone()), 1..4);
            let alts = proptest::collection::vec(alt, 1..4);
            proptest::collection::vec(alts, 1..5).prop_map(move |rule_bodies| {
                let rules: Vec<Rule> = rule_bodies
                    .into_iter()
                    .enumerate()
                    .map(|(i, alternatives)| Rule {
                        name: format!("r{i}"),
                        alternatives,
                    })
                    .collect();
                GrammarModel::from_parts(rules[0].name.clone(), rules)
            })
        }

        proptest! {
            #[test]
            fn serialize_then_parse_is_identity(model in model_strategy()) {
                let text = model.serialize();
                let reparsed = GrammarModel::parse(&text).unwrap();
                prop_assert_eq!(model, reparsed);
            }
        }
    }
}
