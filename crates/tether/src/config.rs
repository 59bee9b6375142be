//! Connection configuration and builder

use crate::object::RemoteObject;
use crate::{Connection, Result, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tether_proto::MAX_FRAME_SIZE;
use tokio::io::{AsyncRead, AsyncWrite};

/// Per-connection protocol settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Label used in log lines
    pub name: String,
    /// Accept SETATTR requests from the peer
    pub allow_setattr: bool,
    /// Accept DELATTR requests from the peer
    pub allow_delattr: bool,
    /// Accept PICKLE requests from the peer
    pub allow_pickle: bool,
    /// Send rendered traceback text with error responses
    pub include_traceback: bool,
    /// Largest frame accepted or produced, in bytes
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            allow_setattr: true,
            allow_delattr: true,
            allow_pickle: true,
            include_traceback: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Builder for configuring and establishing connections
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    root: Arc<dyn RemoteObject>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    /// Builder with default settings and an empty root service
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            root: Arc::new(Service::void()),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the object the peer reaches through GETROOT
    pub fn with_root<T: RemoteObject>(mut self, root: T) -> Self {
        self.root = Arc::new(root);
        self
    }

    /// Set an already shared root object
    pub fn with_shared_root(mut self, root: Arc<dyn RemoteObject>) -> Self {
        self.root = root;
        self
    }

    /// Set the log label
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Allow or reject remote attribute writes
    pub fn with_setattr(mut self, allow: bool) -> Self {
        self.config.allow_setattr = allow;
        self
    }

    /// Allow or reject remote attribute deletion
    pub fn with_delattr(mut self, allow: bool) -> Self {
        self.config.allow_delattr = allow;
        self
    }

    /// Allow or reject remote pickling
    pub fn with_pickle(mut self, allow: bool) -> Self {
        self.config.allow_pickle = allow;
        self
    }

    /// Include or omit traceback text in error responses
    pub fn with_traceback(mut self, include: bool) -> Self {
        self.config.include_traceback = include;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.config.max_frame_size = max_frame_size;
        self
    }

    /// Build the configuration
    pub fn build_config(&self) -> ConnectionConfig {
        self.config.clone()
    }

    /// Establish a connection over separate read and write streams
    pub async fn connect<R, W>(self, reader: R, writer: W) -> Result<Connection>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Connection::connect(self.config, self.root, reader, writer).await
    }

    /// Establish a connection over a single duplex stream
    pub async fn connect_stream<S>(self, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.connect(reader, writer).await
    }
}
