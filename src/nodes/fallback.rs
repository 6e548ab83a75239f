//! Built-in node lists.
//!
//! The mainnet list is the small set of long-running community nodes used
//! whenever discovery yields nothing and no snapshot is available.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::record::NodeRecord;
use crate::rpc::ConfigError;

/// Request timeout of the trusted mainnet nodes, in seconds.
pub const TRUSTED_NODE_TIMEOUT_SECS: u64 = 10;

/// Request timeout of the other built-in nodes, in seconds.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 8;

/// Node timeouts above this are accepted but logged as a warning.
pub const MAX_RECOMMENDED_NODE_TIMEOUT_SECS: u64 = 15;

/// Monero network a node set belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Stagenet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Stagenet => write!(f, "stagenet"),
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "stagenet" => Ok(Network::Stagenet),
            _ => Err(ConfigError::InvalidNetwork(s.to_string())),
        }
    }
}

/// The trusted mainnet fallback nodes.
pub fn trusted_nodes() -> Vec<NodeRecord> {
    vec![
        NodeRecord::new("Snipa's Backbone", "http://node.xmrbackb.one:18081/json_rpc")
            .with_description("Online since 2017, run by long-time dev Snipa; trusted by community")
            .with_priority(0)
            .with_timeout_secs(TRUSTED_NODE_TIMEOUT_SECS),
        NodeRecord::new("Seth for Privacy", "https://node.sethforprivacy.com/json_rpc")
            .with_description("Privacy-focused HTTPS node with published configs and cert fingerprint")
            .with_priority(1)
            .with_timeout_secs(TRUSTED_NODE_TIMEOUT_SECS),
        NodeRecord::new("MoneroWorld", "http://node.moneroworld.com:18089/json_rpc")
            .with_description("Maintained by dEBRUYNE crew; points to high-uptime boxes")
            .with_priority(2)
            .with_timeout_secs(TRUSTED_NODE_TIMEOUT_SECS),
    ]
}

/// Default fallback nodes for a network.
pub fn default_nodes(network: Network) -> Vec<NodeRecord> {
    match network {
        Network::Mainnet => trusted_nodes(),
        Network::Testnet => vec![
            NodeRecord::new("MoneroWorld Testnet", "http://testnet.moneroworld.com:28081/json_rpc")
                .with_description("MoneroWorld Testnet")
                .with_priority(1)
                .with_timeout_secs(DEFAULT_NODE_TIMEOUT_SECS),
            NodeRecord::new(
                "Community Testnet",
                "https://testnet.community.nodes.monero.org:28081/json_rpc",
            )
            .with_description("Community Testnet (SSL)")
            .with_priority(2)
            .with_timeout_secs(DEFAULT_NODE_TIMEOUT_SECS),
        ],
        Network::Stagenet => vec![
            NodeRecord::new("MoneroWorld Stagenet", "http://stagenet.moneroworld.com:38081/json_rpc")
                .with_description("MoneroWorld Stagenet")
                .with_priority(1)
                .with_timeout_secs(DEFAULT_NODE_TIMEOUT_SECS),
        ],
    }
}

pub fn find_by_name<'a>(nodes: &'a [NodeRecord], name: &str) -> Option<&'a NodeRecord> {
    nodes.iter().find(|n| n.name == name)
}

pub fn local_nodes(nodes: &[NodeRecord]) -> Vec<NodeRecord> {
    nodes.iter().filter(|n| n.is_local).cloned().collect()
}

pub fn remote_nodes(nodes: &[NodeRecord]) -> Vec<NodeRecord> {
    nodes.iter().filter(|n| !n.is_local).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcEndpoint, RpcKind};

    #[test]
    fn test_trusted_nodes_are_valid_endpoints() {
        let nodes = trusted_nodes();
        assert_eq!(nodes.len(), 3);
        for n in &nodes {
            assert!(RpcEndpoint::from_url(&n.url, RpcKind::Daemon, None).is_ok(), "{}", n.url);
            assert_eq!(n.success_rate, 1.0);
            assert!(!n.is_local);
            assert_eq!(n.timeout_secs, Some(TRUSTED_NODE_TIMEOUT_SECS));
        }
        assert_eq!(find_by_name(&nodes, "MoneroWorld").unwrap().priority, 2);
        assert!(find_by_name(&nodes, "nope").is_none());
    }

    #[test]
    fn test_network_lists_and_filters() {
        for network in [Network::Mainnet, Network::Testnet, Network::Stagenet] {
            let nodes = default_nodes(network);
            assert!(!nodes.is_empty());
            assert!(
                nodes
                    .iter()
                    .all(|n| n.timeout_secs.is_some_and(|t| t <= MAX_RECOMMENDED_NODE_TIMEOUT_SECS))
            );
            assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
        }

        let mut nodes = trusted_nodes();
        nodes.push(NodeRecord::new("Local", "http://127.0.0.1:18081/json_rpc").local(true));
        assert_eq!(local_nodes(&nodes).len(), 1);
        assert_eq!(remote_nodes(&nodes).len(), 3);
    }
}
