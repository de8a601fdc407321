use serde::{Deserialize, Serialize};

use crate::models::item::ConnectionSet;

/// How a matching rule contributes destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    #[default]
    Simple,
    /// Destinations are additionally addressed to the share destinations
    /// captured by the rule's tag matches
    AddressableRoute,
}

/// A `{tag, pattern}` condition. `tag` is a DICOM element (`0008,0060`) or an
/// HL7 `segment,field` pair, depending on the item's protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTag {
    pub tag: String,
    pub pattern: String,
}

impl RuleTag {
    pub fn new(tag: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            pattern: pattern.into(),
        }
    }
}

/// Declarative routing rule from one source connection to its destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestRule {
    #[serde(default)]
    pub name: String,
    pub from_connection_name: String,
    #[serde(default)]
    pub to_connections: Vec<ConnectionSet>,
    #[serde(default)]
    pub rule_tags: Vec<RuleTag>,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub referring_physician: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rule_type: RuleType,
    /// Scripts run before the rule's conditions are evaluated
    #[serde(default)]
    pub pre_process_scripts: Vec<String>,
    /// Scripts run after the rule matched
    #[serde(default)]
    pub post_process_scripts: Vec<String>,
}

impl DestRule {
    pub fn new(from_connection_name: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            from_connection_name: from_connection_name.into(),
            to_connections: Vec::new(),
            rule_tags: Vec::new(),
            modality: None,
            referring_physician: None,
            enabled: true,
            rule_type: RuleType::Simple,
            pre_process_scripts: Vec::new(),
            post_process_scripts: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn to(mut self, destination: ConnectionSet) -> Self {
        self.to_connections.push(destination);
        self
    }

    pub fn when(mut self, tag: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.rule_tags.push(RuleTag::new(tag, pattern));
        self
    }

    pub fn with_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = rule_type;
        self
    }

    /// Name for log lines; unnamed rules are identified by their source
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.from_connection_name
        } else {
            &self.name
        }
    }
}

fn default_true() -> bool {
    true
}
