//! Client configuration and construction of transports from it.

pub mod loader;

use std::{path::PathBuf, sync::Arc, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    nodes::{
        HttpNodeDirectory, HttpProber, MAX_RECOMMENDED_NODE_TIMEOUT_SECS, Network, NodeCache, NodeCacheSettings,
        NodeManager, NodeRecord, fallback,
    },
    rpc::{ConfigError, DEFAULT_TIMEOUT, RpcEndpoint, RpcKind, RpcTransport},
};

pub use loader::{get_default_config, load_configuration, write_config_to};

const DEFAULT_DIRECTORY_URL: &str = "https://monero.fail/nodes.json";
const DEFAULT_SNAPSHOT_PATH: &str = "data/node_cache.json";
const DEFAULT_DIRECTORY_MAX_RETRIES: u32 = 2;
const DEFAULT_DIRECTORY_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: Network,
    pub daemon: EndpointConfig,
    pub wallet: EndpointConfig,
    pub node_cache: NodeCacheConfig,
    /// Replaces the node cache for daemon calls when non-empty.
    pub static_nodes: Vec<StaticNodeConfig>,
}

/// One RPC server, given either as a `url` or as separate fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: Option<String>,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub use_node_cache: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            scheme: None,
            host: None,
            port: None,
            path: None,
            username: None,
            password: None,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            use_node_cache: false,
        }
    }
}

impl EndpointConfig {
    pub fn to_endpoint(&self, kind: RpcKind) -> Result<RpcEndpoint, ConfigError> {
        let timeout = Duration::from_secs(self.timeout_secs);

        let mut builder = match &self.url {
            Some(url) => {
                let parsed = RpcEndpoint::from_url(url, kind, Some(timeout))?;
                let builder = RpcEndpoint::builder(kind)
                    .scheme(parsed.scheme())
                    .host(parsed.host())
                    .port(parsed.port())
                    .path(parsed.path())
                    .timeout(timeout);
                match parsed.credentials() {
                    Some(c) => builder.credentials(&c.username, &c.password),
                    None => builder,
                }
            },
            None => {
                let mut builder = RpcEndpoint::builder(kind).timeout(timeout);
                if let Some(scheme) = &self.scheme {
                    builder = builder.scheme(scheme);
                }
                if let Some(host) = &self.host {
                    builder = builder.host(host);
                }
                if let Some(port) = self.port {
                    builder = builder.port(port);
                }
                if let Some(path) = &self.path {
                    builder = builder.path(path);
                }
                builder
            },
        };

        if let Some(username) = &self.username {
            builder = builder.credentials(username, self.password.as_deref().unwrap_or_default());
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCacheConfig {
    pub directory_url: String,
    pub directory_max_retries: u32,
    pub directory_timeout_secs: u64,
    pub snapshot_path: Option<PathBuf>,
    pub ttl_secs: u64,
    pub min_refresh_interval_secs: u64,
    pub refresh_check_interval_secs: u64,
    pub max_candidates: usize,
    pub probe_workers: usize,
    pub probe_timeout_secs: u64,
    pub probe_phase_timeout_secs: u64,
    pub keep_top: usize,
    pub min_probe_success_rate: f64,
}

impl Default for NodeCacheConfig {
    fn default() -> Self {
        let settings = NodeCacheSettings::default();
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            directory_max_retries: DEFAULT_DIRECTORY_MAX_RETRIES,
            directory_timeout_secs: DEFAULT_DIRECTORY_TIMEOUT_SECS,
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            ttl_secs: settings.ttl.as_secs(),
            min_refresh_interval_secs: settings.min_refresh_interval.as_secs(),
            refresh_check_interval_secs: settings.refresh_check_interval.as_secs(),
            max_candidates: settings.max_candidates,
            probe_workers: settings.probe_workers,
            probe_timeout_secs: settings.probe_timeout.as_secs(),
            probe_phase_timeout_secs: settings.probe_phase_timeout.as_secs(),
            keep_top: settings.keep_top,
            min_probe_success_rate: settings.min_probe_success_rate,
        }
    }
}

impl NodeCacheConfig {
    pub fn to_settings(&self, network: Network) -> NodeCacheSettings {
        NodeCacheSettings {
            ttl: Duration::from_secs(self.ttl_secs),
            min_refresh_interval: Duration::from_secs(self.min_refresh_interval_secs),
            max_candidates: self.max_candidates,
            probe_workers: self.probe_workers,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            probe_phase_timeout: Duration::from_secs(self.probe_phase_timeout_secs),
            keep_top: self.keep_top,
            min_probe_success_rate: self.min_probe_success_rate,
            refresh_check_interval: Duration::from_secs(self.refresh_check_interval_secs),
            snapshot_path: self.snapshot_path.clone(),
            fallback_nodes: fallback::default_nodes(network),
        }
    }

    /// Builds a cache discovering nodes over HTTP. The refresh worker is not
    /// started.
    pub fn build_cache(&self, network: Network) -> Result<NodeCache, ConfigError> {
        let directory_url = Url::parse(&self.directory_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.directory_url.clone(),
            source,
        })?;
        let directory = HttpNodeDirectory::with_config(
            directory_url,
            self.directory_max_retries,
            Duration::from_secs(self.directory_timeout_secs),
        )
        .map_err(ConfigError::HttpClient)?;
        let prober = HttpProber::new(RpcKind::Daemon).map_err(ConfigError::HttpClient)?;

        Ok(NodeCache::builder(Arc::new(directory), Arc::new(prober))
            .settings(self.to_settings(network))
            .build())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default = "default_static_priority")]
    pub priority: u32,
    /// Overrides the daemon timeout for this node.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_static_priority() -> u32 {
    1
}

impl From<&StaticNodeConfig> for NodeRecord {
    fn from(node: &StaticNodeConfig) -> Self {
        let record = NodeRecord::new(&node.name, &node.url)
            .with_description(&node.description)
            .with_priority(node.priority)
            .local(node.is_local);
        match node.timeout_secs {
            Some(secs) => record.with_timeout_secs(secs),
            None => record,
        }
    }
}

fn static_node_records(nodes: &[StaticNodeConfig]) -> Vec<NodeRecord> {
    for node in nodes {
        if let Some(secs) = node.timeout_secs.filter(|s| *s > MAX_RECOMMENDED_NODE_TIMEOUT_SECS) {
            warn!(node = node.name.as_str(), timeout_secs = secs; "Static node has a high timeout");
        }
    }
    nodes.iter().map(NodeRecord::from).collect()
}

impl ClientConfig {
    /// Transport for daemon calls.
    ///
    /// Uses the static node list when one is configured, otherwise the node
    /// cache if enabled, otherwise the daemon endpoint alone.
    pub fn daemon_transport(&self) -> Result<RpcTransport, ConfigError> {
        let template = self.daemon.to_endpoint(RpcKind::Daemon)?;

        if !self.static_nodes.is_empty() {
            let nodes = static_node_records(&self.static_nodes);
            return Ok(RpcTransport::new(Arc::new(NodeManager::from_static(nodes)), template));
        }

        if self.daemon.use_node_cache {
            let cache = self.node_cache.build_cache(self.network)?;
            return Ok(RpcTransport::new(Arc::new(NodeManager::with_cache(cache)), template));
        }

        Ok(RpcTransport::single(template))
    }

    /// Transport for wallet calls, always bound to the configured wallet RPC.
    pub fn wallet_transport(&self) -> Result<RpcTransport, ConfigError> {
        Ok(RpcTransport::single(self.wallet.to_endpoint(RpcKind::Wallet)?))
    }

    pub fn transport_for(&self, kind: RpcKind) -> Result<RpcTransport, ConfigError> {
        match kind {
            RpcKind::Daemon => self.daemon_transport(),
            RpcKind::Wallet => self.wallet_transport(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_fields_uses_kind_defaults() {
        let config = EndpointConfig {
            host: Some("wallet.local".to_string()),
            ..EndpointConfig::default()
        };
        let endpoint = config.to_endpoint(RpcKind::Wallet).unwrap();
        assert_eq!(endpoint.rpc_url(), "http://wallet.local:18082/json_rpc");
        assert_eq!(endpoint.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_endpoint_credentials_from_fields_override_url() {
        let config = EndpointConfig {
            url: Some("http://a:b@127.0.0.1:28088/json_rpc".to_string()),
            username: Some("monero".to_string()),
            password: Some("secret".to_string()),
            timeout_secs: 30,
            ..EndpointConfig::default()
        };
        let endpoint = config.to_endpoint(RpcKind::Wallet).unwrap();
        let credentials = endpoint.credentials().unwrap();
        assert_eq!(credentials.username, "monero");
        assert_eq!(credentials.password, "secret");
        assert_eq!(endpoint.port(), 28088);
        assert_eq!(endpoint.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_endpoint_url_is_config_error() {
        let config = EndpointConfig {
            url: Some("not a url".to_string()),
            ..EndpointConfig::default()
        };
        assert!(matches!(
            config.to_endpoint(RpcKind::Daemon),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_static_nodes_bypass_cache() {
        let config = ClientConfig {
            daemon: EndpointConfig {
                use_node_cache: true,
                ..EndpointConfig::default()
            },
            static_nodes: vec![StaticNodeConfig {
                name: "local".to_string(),
                url: "http://127.0.0.1:18081/json_rpc".to_string(),
                description: String::new(),
                is_local: true,
                priority: 0,
                timeout_secs: Some(5),
            }],
            ..ClientConfig::default()
        };
        let transport = config.daemon_transport().unwrap();
        assert!(!transport.manager().is_cache_backed());
        assert_eq!(transport.manager().known_node_count(), 1);
        let node = transport.manager().current_node().unwrap();
        assert_eq!(node.timeout_secs, Some(5));
    }

    #[test]
    fn test_static_node_timeout_is_optional_in_toml() {
        let source = r#"
            [[static_nodes]]
            name = "quick"
            url = "http://127.0.0.1:18081/json_rpc"
            timeout_secs = 20

            [[static_nodes]]
            name = "plain"
            url = "http://127.0.0.1:18089/json_rpc"
        "#;
        let config: ClientConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(source, ::config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let records = static_node_records(&config.static_nodes);
        assert_eq!(records[0].timeout_secs, Some(20));
        assert_eq!(records[1].timeout_secs, None);
        assert_eq!(records[1].priority, 1);
    }

    #[test]
    fn test_cache_settings_follow_network() {
        let settings = NodeCacheConfig::default().to_settings(Network::Stagenet);
        assert_eq!(settings.ttl, Duration::from_secs(3600));
        assert_eq!(settings.min_refresh_interval, Duration::from_secs(300));
        assert_eq!(settings.fallback_nodes, fallback::default_nodes(Network::Stagenet));
    }
}
