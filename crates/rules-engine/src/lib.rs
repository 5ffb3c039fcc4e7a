//! Rule evaluation for warden.
//!
//! Policies are YAML files listing rules. Each rule targets one event type and
//! carries a condition written in a small expression language (see [`dsl`]).
//! Rules are compiled into a [`RuleSet`], which evaluates events and notifies
//! its [`RuleSetListener`]s of matches and discarders.

pub mod dsl;
mod policy;
mod rule;
mod ruleset;

pub use policy::{DirectoryPolicyLoader, PolicyError, PolicyLoader, UserRule, parse_policy};
pub use rule::{CompileError, EvalError, Metadata, Rule};
pub use ruleset::{RuleError, RuleSet, RuleSetListener, RuleSetOpts};
