use anyhow::Result;
use defender_agent::config::AgentConfig;
use defender_agent::event::TracingSink;
use defender_agent::http::HttpConnector;
use defender_agent::Defender;
use defender_collector::network::ProcNetCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("defender=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/defender.toml".to_string());

    let config = AgentConfig::load(&config_path)?;
    tracing::info!(thing = %config.thing_name, "defender-agent starting");
    defender_common::id::init(1, config.node_id);

    let timeout = Duration::from_secs(config.publish_timeout_secs);
    let connector = HttpConnector::new(timeout)?;
    let defender = Defender::new(
        Arc::new(connector),
        Arc::new(ProcNetCollector::new()),
        config.codec(),
    )
    .with_publish_timeout(timeout);

    for (group, mask) in config.metric_masks()? {
        defender.set_metrics(group, mask)?;
    }
    defender.set_period(config.period_secs)?;

    defender.start(config.start_info().with_sink(Arc::new(TracingSink)))?;

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    defender.stop();

    Ok(())
}
