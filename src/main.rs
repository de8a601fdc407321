use courier::config::{Cli, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::from_args();
    let config = Config::load(&cli.config_path)?;
    courier::logging::init(&config.logging)?;

    courier::run(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", err);
        }
    })
    .await
}
