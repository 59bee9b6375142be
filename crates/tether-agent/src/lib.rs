//! # Tether Agent
//!
//! Serves the agent service as a connection root over stdin/stdout, so a
//! controller that spawned this process can drive it through proxies.

#![warn(missing_docs)]

/// Agent main loop and configuration
pub mod agent;

/// Functions exposed by the agent service
pub mod modules;

pub use agent::{config_from_env, AgentLoop, CONFIG_ENV};
pub use modules::agent_service;
