pub mod config;

pub use config::{DestRule, RuleTag, RuleType};
