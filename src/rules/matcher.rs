use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::rules::error::RuleError;
use crate::sync::lock;

/// Rule tag pattern that also accepts a tag missing from the dataset
pub const MISSING_TAG_WILDCARD: &str = ".*";

/// Strategy deciding whether a protocol value satisfies a rule pattern
pub trait TagMatcher: Send + Sync + std::fmt::Debug {
    /// `Some(capture)` when `value` matches. The capture is the first group
    /// of the pattern, or the whole match when it has none.
    fn find(&self, pattern: &str, value: &str) -> Result<Option<String>, RuleError>;

    fn is_match(&self, pattern: &str, value: &str) -> Result<bool, RuleError> {
        Ok(self.find(pattern, value)?.is_some())
    }
}

/// Unanchored regular-expression matching with compiled patterns cached
#[derive(Debug, Default)]
pub struct RegexMatcher {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl RegexMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&self, pattern: &str) -> Result<Regex, RuleError> {
        if let Some(regex) = lock(&self.compiled).get(pattern) {
            return Ok(regex.clone());
        }
        let regex = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        lock(&self.compiled).insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

impl TagMatcher for RegexMatcher {
    fn find(&self, pattern: &str, value: &str) -> Result<Option<String>, RuleError> {
        let regex = self.regex(pattern)?;
        Ok(regex.captures(value).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        }))
    }
}
