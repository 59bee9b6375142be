//! # Tether
//!
//! A transparent, symmetric remote object protocol. A controller and an agent
//! share one connection over any ordered byte stream; each side exposes a root
//! object and manipulates the other side's objects through local proxies
//! ("netrefs") as though they were local.
//!
//! ```no_run
//! # async fn demo() -> tether::Result<()> {
//! use tether::{CallArgs, ConnectionBuilder};
//!
//! let (reader, writer) = (tokio::io::stdin(), tokio::io::stdout());
//! let conn = ConnectionBuilder::new().connect(reader, writer).await?;
//! let root = conn.root().await?;
//! let answer = root.invoke("echo", CallArgs::new().arg(42)).await?;
//! # let _ = answer;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use tether_proto as proto;
pub use tether_proto::Op;

/// Error types for the Tether library
pub mod error;

/// Connection configuration and builder
pub mod config;

/// Values crossing the connection
pub mod value;

/// The exported object model
pub mod object;

/// Built-in exportable types shared by every connection
pub mod builtins;

/// Futures for in-flight requests
pub mod async_result;

/// Local proxies for remote objects
pub mod netref;

/// The protocol engine and dispatch loop
pub mod connection;

/// Local execution routines for each operation code
mod handlers;

/// Root object exposure
pub mod service;

pub use async_result::{AsyncResult, AsyncState};
pub use builtins::{Function, List, ListIterator, Namespace, Restricted};
pub use config::{ConnectionBuilder, ConnectionConfig};
pub use connection::{BgServingTask, Connection, ConnectionStats};
pub use error::{RemoteException, RpcError};
pub use netref::{BoundMethod, Netref, NetrefClass, NetrefIter};
pub use object::{MethodInfo, RemoteObject};
pub use service::Service;
pub use value::{CallArgs, SliceOp, SliceRange, Value};

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, RpcError>;
