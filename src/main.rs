use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use trainer_agent::{Agent, AgentSettings};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let workspace_root = std::env::current_dir().context("Failed to resolve working directory")?;
    let settings = AgentSettings::load(&workspace_root)?;
    let api_key = settings.require_api_key()?;
    let agent = Agent::new(&settings, api_key)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal.cancel();
            }
            Err(err) => warn!("Failed to listen for interrupt: {err}"),
        }
    });

    agent.run(shutdown).await;
    Ok(())
}
