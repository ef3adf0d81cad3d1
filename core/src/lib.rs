//! # Kestrel Core
//!
//! Assembles a node from the consensus, gossip and storage crates:
//!
//! - [`config`]: [`NodeConfig`], loaded from JSON.
//! - [`logging`]: `env_logger` installation.
//! - [`node`]: [`Node`], which owns the consensus service, the gossip
//!   manager, the switch and the block store.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use {
    config::NodeConfig,
    error::{ConfigError, NodeError, Result},
    node::Node,
};
