//! Agent main loop and configuration

use crate::modules::agent_service;
use anyhow::{Context, Result};
use std::sync::Arc;
use tether::{ConnectionBuilder, ConnectionConfig, RemoteObject};
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Environment variable holding an optional JSON [`ConnectionConfig`]
pub const CONFIG_ENV: &str = "TETHER_AGENT_CONFIG";

/// Read the connection settings from [`CONFIG_ENV`], falling back to defaults
pub fn config_from_env() -> Result<ConnectionConfig> {
    parse_config(std::env::var(CONFIG_ENV).ok().as_deref())
}

fn parse_config(raw: Option<&str>) -> Result<ConnectionConfig> {
    match raw.map(str::trim) {
        None | Some("") => Ok(ConnectionConfig {
            name: "agent".to_string(),
            ..Default::default()
        }),
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid {}", CONFIG_ENV)),
    }
}

/// Serves one connection until the controller goes away or shutdown is requested
pub struct AgentLoop<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Input stream (typically stdin)
    reader: R,
    /// Output stream (typically stdout)
    writer: W,
    /// Connection settings
    config: ConnectionConfig,
    /// Object the controller reaches through GETROOT
    root: Arc<dyn RemoteObject>,
    /// Shutdown signal receiver
    shutdown_rx: Option<oneshot::Receiver<()>>,
    /// Shutdown signal sender (kept for graceful shutdown)
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AgentLoop<tokio::io::Stdin, tokio::io::Stdout> {
    /// Create a new agent loop with stdin/stdout
    pub fn new() -> Self {
        Self::with_io(stdin(), stdout())
    }
}

impl Default for AgentLoop<tokio::io::Stdin, tokio::io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> AgentLoop<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a new agent loop with custom reader/writer
    pub fn with_io(reader: R, writer: W) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            reader,
            writer,
            config: ConnectionConfig {
                name: "agent".to_string(),
                ..Default::default()
            },
            root: Arc::new(agent_service()),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Replace the connection settings
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve a different root object
    pub fn with_root<T: RemoteObject>(mut self, root: T) -> Self {
        self.root = Arc::new(root);
        self
    }

    /// Get shutdown sender for graceful shutdown
    pub fn shutdown_sender(&mut self) -> Option<oneshot::Sender<()>> {
        self.shutdown_tx.take()
    }

    /// Run the agent loop
    pub async fn run(mut self) -> Result<()> {
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .context("Shutdown receiver already taken")?;

        let conn = ConnectionBuilder::new()
            .with_config(self.config)
            .with_shared_root(self.root)
            .connect(self.reader, self.writer)
            .await
            .context("Failed to start connection")?;
        info!(conn = %conn.id(), "Starting agent loop");

        tokio::select! {
            _ = &mut shutdown_rx => {
                info!(conn = %conn.id(), "Received shutdown signal, stopping agent loop");
            }
            served = conn.serve_all() => {
                served.context("Connection failed")?;
                info!(conn = %conn.id(), "Controller closed the connection");
            }
        }

        let stats = conn.stats();
        debug!(
            conn = %conn.id(),
            served = stats.requests_served,
            sent = stats.requests_sent,
            "Agent loop stopped"
        );
        Ok(())
    }
}
