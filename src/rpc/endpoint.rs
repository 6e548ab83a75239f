//! Immutable description of a single Monero RPC server.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::ConfigError;

/// Path of the JSON-RPC envelope endpoint on both monerod and monero-wallet-rpc.
pub const DEFAULT_RPC_PATH: &str = "/json_rpc";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SCHEME: &str = "http";

/// Which kind of RPC server an endpoint talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcKind {
    /// A monerod daemon.
    #[default]
    Daemon,
    /// A monero-wallet-rpc instance.
    Wallet,
}

impl RpcKind {
    /// Default listening port. The wallet RPC uses 18082 so it can run next
    /// to a local monerod on 18081.
    pub fn default_port(self) -> u16 {
        match self {
            RpcKind::Daemon => 18081,
            RpcKind::Wallet => 18082,
        }
    }

    /// Cheapest method that proves the server is alive.
    pub fn liveness_method(self) -> &'static str {
        match self {
            RpcKind::Daemon => "get_info",
            RpcKind::Wallet => "get_version",
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcKind::Daemon => write!(f, "daemon"),
            RpcKind::Wallet => write!(f, "wallet"),
        }
    }
}

impl FromStr for RpcKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daemon" => Ok(RpcKind::Daemon),
            "wallet" => Ok(RpcKind::Wallet),
            _ => Err(ConfigError::InvalidKind(s.to_string())),
        }
    }
}

/// HTTP basic credentials for an endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct RpcCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RpcCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCredentials")
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .finish()
    }
}

/// Scheme, host, port, path, credentials, timeout and kind of one RPC server.
///
/// Built either from a URL with [`RpcEndpoint::from_url`] or from named
/// fields with [`RpcEndpoint::builder`]. A missing path defaults to
/// [`DEFAULT_RPC_PATH`] and a missing port to [`RpcKind::default_port`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    scheme: String,
    host: String,
    port: u16,
    path: String,
    credentials: Option<RpcCredentials>,
    timeout: Duration,
    kind: RpcKind,
}

impl RpcEndpoint {
    pub fn builder(kind: RpcKind) -> RpcEndpointBuilder {
        RpcEndpointBuilder::new(kind)
    }

    /// Parses an endpoint from a URL such as `http://node.example:18089/json_rpc`.
    ///
    /// Credentials embedded in the URL userinfo are kept.
    pub fn from_url(url: &str, kind: RpcKind, timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::MissingHost(url.to_string()))?;

        let mut builder = Self::builder(kind)
            .scheme(parsed.scheme())
            .host(host)
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT));

        // Url::port() hides a scheme's default port. An https node without an
        // explicit port is served on 443, a plain http one on the kind's port.
        match parsed.port() {
            Some(port) => builder = builder.port(port),
            None if parsed.scheme() == "https" => builder = builder.port(443),
            None => {},
        }
        if !parsed.path().is_empty() && parsed.path() != "/" {
            builder = builder.path(parsed.path());
        }
        if !parsed.username().is_empty() {
            builder = builder.credentials(parsed.username(), parsed.password().unwrap_or_default());
        }

        builder.build()
    }

    /// Derives the endpoint for another node from this one.
    ///
    /// Kind is inherited, and so is the timeout unless the node sets its own.
    /// Credentials are only inherited when the node is this same server; a
    /// different node only gets the credentials present in its own URL.
    pub fn for_node_url(&self, url: &str, timeout: Option<Duration>) -> Result<Self, ConfigError> {
        let node = Self::from_url(url, self.kind, Some(timeout.unwrap_or(self.timeout)))?;
        if node.credentials.is_none() && node.host == self.host && node.port == self.port {
            return Ok(Self {
                credentials: self.credentials.clone(),
                ..node
            });
        }
        Ok(node)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn credentials(&self) -> Option<&RpcCredentials> {
        self.credentials.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn kind(&self) -> RpcKind {
        self.kind
    }

    /// `scheme://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Full URL of the JSON-RPC envelope endpoint.
    pub fn rpc_url(&self) -> String {
        format!("{}{}", self.base_url(), self.path)
    }

    /// URL of a REST-style sibling of the envelope endpoint, e.g. `/get_height`.
    pub fn rest_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

/// Builds an [`RpcEndpoint`] from named fields.
#[derive(Debug, Clone)]
pub struct RpcEndpointBuilder {
    kind: RpcKind,
    scheme: String,
    host: String,
    port: Option<u16>,
    path: Option<String>,
    credentials: Option<RpcCredentials>,
    timeout: Duration,
}

impl RpcEndpointBuilder {
    fn new(kind: RpcKind) -> Self {
        Self {
            kind,
            scheme: DEFAULT_SCHEME.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: None,
            path: None,
            credentials: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_ascii_lowercase();
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(RpcCredentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RpcEndpoint, ConfigError> {
        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::UnsupportedScheme(self.scheme));
        }
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost(format!("{}://", self.scheme)));
        }

        let path = match self.path {
            Some(p) if p.is_empty() || p == "/" => DEFAULT_RPC_PATH.to_string(),
            Some(p) if p.starts_with('/') => p,
            Some(p) => format!("/{p}"),
            None => DEFAULT_RPC_PATH.to_string(),
        };

        let port = self.port.unwrap_or(self.kind.default_port());

        Ok(RpcEndpoint {
            scheme: self.scheme,
            host: self.host,
            port,
            path,
            credentials: self.credentials,
            timeout: self.timeout,
            kind: self.kind,
        })
    }
}
