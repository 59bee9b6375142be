//! Tether Agent Binary
//!
//! Speaks the protocol on stdin/stdout; logs go to stderr.

use anyhow::Result;
use tether_agent::{config_from_env, AgentLoop};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Tether agent");

    let config = config_from_env()?;
    let agent = AgentLoop::new().with_config(config);

    if let Err(e) = agent.run().await {
        error!("Agent error: {:#}", e);
        std::process::exit(1);
    }

    info!("Agent shutting down");
    Ok(())
}
