use async_trait::async_trait;
use tracing::trace;

use crate::models::item::RoutedItem;
use crate::rules::error::RuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStage {
    PreProcess,
    PostProcess,
}

/// Runner for the pre and post-process scripts named by routing rules.
///
/// Scripts may rewrite the item they run against.
#[async_trait]
pub trait ScriptHooks: Send + Sync + std::fmt::Debug {
    async fn run(
        &self,
        stage: ScriptStage,
        script: &str,
        item: &mut RoutedItem,
    ) -> Result<(), RuleError>;
}

/// Used when no script runner is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl ScriptHooks for NoopHooks {
    async fn run(
        &self,
        stage: ScriptStage,
        script: &str,
        item: &mut RoutedItem,
    ) -> Result<(), RuleError> {
        trace!(?stage, script, item_id = %item.id, "no script runner, skipping");
        Ok(())
    }
}
