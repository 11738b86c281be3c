//! Grammar representation, mutation operations, and patch validation.

mod model;
mod mutation;
mod patch;

pub use model::{Alternative, GrammarError, GrammarModel, Rule, Symbol};
pub use mutation::{MutationEngine, MutationError, MutationOp};
pub use patch::{Patch, PatchError, PatchValidator};

/// The generation-zero protocol: verbose slot/value phrases separated by
/// semicolons, the point of departure for every search run.
pub const BASE_GRAMMAR: &str = "\
msg: phrase | phrase \";\" msg
phrase: slot \":\" value
slot: \"color\" | \"shape\" | \"size\"
value: /[a-z]+/
";
