//! Resilient JSON-RPC client for Monero daemons and wallets.
//!
//! Calls are routed to a random healthy node from a pool that refreshes
//! itself in the background, fail over to other nodes on transport errors,
//! and rotate to a new node after every success.

pub mod cli;
pub mod config;
pub mod logging;
pub mod nodes;
pub mod rpc;

pub use crate::config::{ClientConfig, load_configuration};
pub use crate::nodes::{NodeCache, NodeManager, NodeRecord, NodeStatus};
pub use crate::rpc::{RpcClientError, RpcEndpoint, RpcError, RpcKind, RpcTransport};
