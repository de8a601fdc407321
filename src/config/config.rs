use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::agent_config::AgentConfig;
use crate::config::logging_config::LoggingConfig;
use crate::models::connections::Connection;
use crate::models::rules::DestRule;
use crate::storage::StorageConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("agent id must not be empty")]
    InvalidAgentId,

    #[error("connection '{0}' must allow at least one concurrent task")]
    InvalidParallelism(String),

    #[error("rule '{rule}' references unknown connection '{connection}'")]
    UnknownConnection { rule: String, connection: String },

    #[error("rule '{rule}' has an invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        reason: String,
    },
}

/// Root configuration of the agent
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub connections: HashMap<String, Connection>,
    #[serde(default)]
    pub rules: Vec<DestRule>,
}

impl Config {
    /// Read, normalize and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Copy table keys into the connection descriptors
    pub fn normalize(&mut self) {
        for (name, connection) in self.connections.iter_mut() {
            connection.name = name.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::InvalidAgentId);
        }

        for (name, connection) in &self.connections {
            if connection.parallelism == 0 {
                return Err(ConfigError::InvalidParallelism(name.clone()));
            }
        }

        for rule in &self.rules {
            let referenced = std::iter::once(rule.from_connection_name.as_str()).chain(
                rule.to_connections
                    .iter()
                    .map(|c| c.connection_name.as_str()),
            );
            for connection in referenced {
                if !self.connections.contains_key(connection) {
                    return Err(ConfigError::UnknownConnection {
                        rule: rule.label().to_string(),
                        connection: connection.to_string(),
                    });
                }
            }

            let patterns = rule
                .rule_tags
                .iter()
                .map(|t| t.pattern.as_str())
                .chain(rule.modality.as_deref())
                .chain(rule.referring_physician.as_deref());
            for pattern in patterns {
                if let Err(err) = regex::Regex::new(pattern) {
                    return Err(ConfigError::InvalidPattern {
                        rule: rule.label().to_string(),
                        pattern: pattern.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    /// Root directory of every queue (`tempPath`)
    pub fn temp_path(&self) -> PathBuf {
        self.storage.root_path()
    }
}
