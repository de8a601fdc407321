mod agent_config;
mod handle;
mod logging_config;
pub mod config;

pub use agent_config::AgentConfig;
pub use config::{Config, ConfigError};
pub use handle::ConfigHandle;
pub use logging_config::LoggingConfig;

/// Structure representing application startup arguments.
#[derive(Debug)]
pub struct Cli {
    /// Path to the configuration file.
    pub config_path: String,
}

impl Cli {
    /// Reads the configuration path from the first process argument,
    /// falling back to `courier.toml` in the working directory.
    pub fn from_args() -> Self {
        let config_path = std::env::args()
            .nth(1)
            .unwrap_or_else(|| "courier.toml".to_string());
        Self { config_path }
    }
}
