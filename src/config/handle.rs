use std::sync::{Arc, RwLock};

use crate::config::config::Config;
use crate::sync;

/// Accessor for the current configuration.
///
/// Components receive a clone of the handle at construction and read a fresh
/// snapshot whenever they need settings, so a reload is picked up on the next
/// cycle without restarting anything.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the configuration in effect
    pub fn current(&self) -> Arc<Config> {
        sync::read(&self.current).clone()
    }

    /// Swap in a new configuration; readers holding a snapshot keep theirs
    pub fn replace(&self, config: Config) {
        *sync::write(&self.current) = Arc::new(config);
    }
}

impl From<Config> for ConfigHandle {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}
