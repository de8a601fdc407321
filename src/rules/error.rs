use courier_dataset::DatasetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}' has an invalid tag '{tag}': {source}")]
    InvalidTag {
        rule: String,
        tag: String,
        #[source]
        source: DatasetError,
    },

    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("script '{script}' failed: {reason}")]
    Script { script: String, reason: String },
}
