use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::{Config, ConfigHandle};
use crate::models::item::{merge_destination, ConnectionSet, ItemType, RoutedItem};
use crate::models::rules::{DestRule, RuleType};
use crate::rules::error::RuleError;
use crate::rules::hooks::{NoopHooks, ScriptHooks, ScriptStage};
use crate::rules::matcher::{RegexMatcher, TagMatcher, MISSING_TAG_WILDCARD};

/// Decides where inbound items go, from the rules of the current
/// configuration.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    config: ConfigHandle,
    matcher: Arc<dyn TagMatcher>,
    hooks: Arc<dyn ScriptHooks>,
}

impl RuleEngine {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            matcher: Arc::new(RegexMatcher::new()),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn TagMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ScriptHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Destinations for `item`, deduplicated by connection.
    ///
    /// Items that already carry destinations (correlated replies) keep them.
    /// Otherwise every enabled rule for the item's source connection is
    /// checked; matching rules contribute their enabled targets, and
    /// request items only go to request-response connections. An empty
    /// result means the item is not routed anywhere.
    pub fn eval(&self, item: &RoutedItem) -> Result<Vec<ConnectionSet>, RuleError> {
        if !item.to_connections.is_empty() {
            trace!(item_id = %item.id, "item already addressed, skipping rules");
            return Ok(item.to_connections.clone());
        }

        let config = self.config.current();
        let mut destinations = Vec::new();

        for rule in candidates(&config, item) {
            let Some(captured) = self.matches(rule, item)? else {
                trace!(rule = rule.label(), item_id = %item.id, "rule did not match");
                continue;
            };
            debug!(rule = rule.label(), item_id = %item.id, "rule matched");

            for target in &rule.to_connections {
                if !is_enabled(&config, &target.connection_name) {
                    continue;
                }
                let destination = match rule.rule_type {
                    RuleType::Simple => target.clone(),
                    RuleType::AddressableRoute => target
                        .clone()
                        .with_share_destinations(captured.iter().cloned()),
                };
                merge_destination(&mut destinations, destination);
            }
        }

        if item.item_type == ItemType::Rpc {
            destinations.retain(|destination| {
                config
                    .connection(&destination.connection_name)
                    .is_some_and(|connection| connection.request_response_enabled)
            });
        }

        if destinations.is_empty() {
            info!(
                item_id = %item.id,
                from = %item.from_connection,
                "no rule routed item"
            );
        }
        Ok(destinations)
    }

    /// Evaluate and store the destinations on the item
    pub fn route(&self, item: &mut RoutedItem) -> Result<usize, RuleError> {
        let destinations = self.eval(item)?;
        item.to_connections = destinations;
        Ok(item.to_connections.len())
    }

    /// Run the pre-process scripts of every enabled rule of the item's source
    pub async fn pre_process(&self, item: &mut RoutedItem) -> Result<(), RuleError> {
        let config = self.config.current();
        let scripts: Vec<String> = config
            .rules
            .iter()
            .filter(|rule| rule.enabled && rule.from_connection_name == item.from_connection)
            .flat_map(|rule| rule.pre_process_scripts.iter().cloned())
            .collect();
        self.run_scripts(ScriptStage::PreProcess, &scripts, item)
            .await
    }

    /// Run the post-process scripts of the rules that route the item's
    /// source to `destination`
    pub async fn post_process(
        &self,
        item: &mut RoutedItem,
        destination: &str,
    ) -> Result<(), RuleError> {
        let config = self.config.current();
        let scripts: Vec<String> = config
            .rules
            .iter()
            .filter(|rule| {
                rule.enabled
                    && rule.from_connection_name == item.from_connection
                    && rule
                        .to_connections
                        .iter()
                        .any(|target| target.connection_name == destination)
            })
            .flat_map(|rule| rule.post_process_scripts.iter().cloned())
            .collect();
        self.run_scripts(ScriptStage::PostProcess, &scripts, item)
            .await
    }

    async fn run_scripts(
        &self,
        stage: ScriptStage,
        scripts: &[String],
        item: &mut RoutedItem,
    ) -> Result<(), RuleError> {
        for script in scripts {
            debug!(?stage, script, item_id = %item.id, "running script");
            self.hooks.run(stage, script, item).await?;
        }
        Ok(())
    }

    /// `Some(captured shares)` when every condition of `rule` holds.
    /// Conditions are checked in order and the first failure ends the rule.
    fn matches(&self, rule: &DestRule, item: &RoutedItem) -> Result<Option<Vec<String>>, RuleError> {
        let dataset = item.tag_data.as_ref();

        if let Some(pattern) = &rule.modality {
            let Some(value) = dataset.and_then(|ds| ds.modality()) else {
                return Ok(None);
            };
            if !self.matcher.is_match(pattern, value)? {
                return Ok(None);
            }
        }

        if let Some(pattern) = &rule.referring_physician {
            let Some(value) = dataset.and_then(|ds| ds.referring_physician()) else {
                return Ok(None);
            };
            if !self.matcher.is_match(pattern, value)? {
                return Ok(None);
            }
        }

        let mut captured = Vec::new();
        for condition in &rule.rule_tags {
            let value = match dataset {
                Some(ds) => {
                    let address =
                        ds.address(&condition.tag)
                            .map_err(|source| RuleError::InvalidTag {
                                rule: rule.label().to_string(),
                                tag: condition.tag.clone(),
                                source,
                            })?;
                    ds.value(&address)
                }
                None => None,
            };

            match value {
                Some(value) => match self.matcher.find(&condition.pattern, value)? {
                    Some(capture) => {
                        if rule.rule_type == RuleType::AddressableRoute && !capture.is_empty() {
                            captured.push(capture);
                        }
                    }
                    None => return Ok(None),
                },
                None if condition.pattern == MISSING_TAG_WILDCARD => {}
                None => return Ok(None),
            }
        }

        Ok(Some(captured))
    }
}

/// Enabled rules for the item's source with at least one enabled target
fn candidates<'a>(config: &'a Config, item: &'a RoutedItem) -> impl Iterator<Item = &'a DestRule> {
    config.rules.iter().filter(move |rule| {
        rule.enabled
            && rule.from_connection_name == item.from_connection
            && rule
                .to_connections
                .iter()
                .any(|target| is_enabled(config, &target.connection_name))
    })
}

fn is_enabled(config: &Config, name: &str) -> bool {
    config.connection(name).is_some_and(|c| c.enabled)
}
