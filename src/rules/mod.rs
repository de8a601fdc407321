mod engine;
mod error;
mod hooks;
mod matcher;

pub use engine::RuleEngine;
pub use error::RuleError;
pub use hooks::{NoopHooks, ScriptHooks, ScriptStage};
pub use matcher::{RegexMatcher, TagMatcher, MISSING_TAG_WILDCARD};
