//! JSON-RPC call execution with failover across nodes.
//!
//! One call walks the state machine
//!
//! ```text
//! Init -> Attempt(node) -> Success
//!                       -> RpcError
//!                       -> TransportFailure -> next untried node -> Attempt(..)
//!                                           -> no untried node   -> Exhausted
//! ```
//!
//! A node is attempted at most once per call. JSON-RPC errors are final and
//! never count against the node.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{
    endpoint::{RpcEndpoint, RpcKind},
    error::{ConfigError, RpcClientError, RpcError, TransportError},
    types::{JsonRpcRequest, into_rpc_result},
};
use crate::{
    logging::redact_url,
    nodes::{NodeManager, NodeRecord},
};

/// Methods that public nodes answer more reliably on their REST-style path.
const REST_METHODS: &[(&str, &str)] = &[("get_height", "/get_height")];

enum AttemptError {
    Transport(TransportError),
    Rpc(RpcError),
}

/// HTTP client bound to the node currently in use.
#[derive(Clone)]
struct ActiveEndpoint {
    node_url: String,
    endpoint: RpcEndpoint,
    client: reqwest::Client,
}

pub struct RpcTransport {
    manager: Arc<NodeManager>,
    template: RpcEndpoint,
    session: Mutex<Option<ActiveEndpoint>>,
    next_id: AtomicU64,
}

impl RpcTransport {
    /// Transport routing through `manager`.
    ///
    /// `template` supplies the kind, timeout and the credentials for the node
    /// it names; other nodes only get the credentials in their own URL.
    pub fn new(manager: Arc<NodeManager>, template: RpcEndpoint) -> Self {
        Self {
            manager,
            template,
            session: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Transport bound to exactly one endpoint, with no failover.
    pub fn single(endpoint: RpcEndpoint) -> Self {
        let node = NodeRecord::new(format!("{}:{}", endpoint.host(), endpoint.port()), endpoint.rpc_url())
            .local(is_loopback(endpoint.host()))
            .with_description("Configured endpoint");
        Self::new(Arc::new(NodeManager::from_static(vec![node])), endpoint)
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn kind(&self) -> RpcKind {
        self.template.kind()
    }

    /// Calls `method`, failing over to other nodes on transport errors.
    pub async fn call(&self, method: &str, params: Option<&Value>) -> Result<Value, RpcClientError> {
        self.call_with_options(method, params, true).await
    }

    /// Calls `method` and decodes the result into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Option<&Value>) -> Result<T, RpcClientError> {
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Calls `method`. With `retry_across_nodes` unset the call ends after
    /// the first transport failure.
    pub async fn call_with_options(
        &self,
        method: &str,
        params: Option<&Value>,
        retry_across_nodes: bool,
    ) -> Result<Value, RpcClientError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error = None;
        let mut next = self.manager.current_node();

        while let Some(node) = next.take() {
            if !tried.insert(node.name.clone()) {
                break;
            }
            let active = self.activate(&node)?;

            match self.attempt(&active, method, params).await {
                Ok((result, elapsed)) => {
                    self.manager.mark_node_success(&node.url, elapsed);
                    if self.manager.is_cache_backed() {
                        self.manager.reset_to_random_node();
                    }
                    return Ok(result);
                },
                Err(AttemptError::Rpc(e)) => {
                    debug!(method = method, code = e.code; "Node returned an RPC error");
                    return Err(e.into());
                },
                Err(AttemptError::Transport(e)) => {
                    warn!(
                        method = method,
                        attempt = tried.len(),
                        node:% = redact_url(&node.url),
                        timed_out = e.is_timeout(),
                        error:% = e;
                        "Node request failed"
                    );
                    last_error = Some(e);
                    if retry_across_nodes {
                        next = self.manager.next_node(&node, &tried);
                    } else {
                        self.manager.mark_node_failure(&node.url);
                    }
                },
            }
        }

        Err(RpcClientError::ExhaustedNodes {
            attempts: tried.len(),
            last_error,
        })
    }

    /// Whether the current node answers its liveness method.
    pub async fn test_connection(&self) -> bool {
        self.call(self.template.kind().liveness_method(), None).await.is_ok()
    }

    /// URL of the endpoint the last request went to.
    pub fn current_endpoint(&self) -> Option<String> {
        self.lock_session().as_ref().map(|active| active.endpoint.rpc_url())
    }

    /// Returns the client for `node`, rebuilding it if the node changed.
    fn activate(&self, node: &NodeRecord) -> Result<ActiveEndpoint, ConfigError> {
        let mut session = self.lock_session();
        if let Some(active) = session.as_ref().filter(|a| a.node_url == node.url) {
            return Ok(active.clone());
        }

        let endpoint = self.template.for_node_url(&node.url, node.timeout())?;
        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout())
            .build()
            .map_err(ConfigError::HttpClient)?;
        debug!(node:% = redact_url(&node.url); "Switched active endpoint");

        let active = ActiveEndpoint {
            node_url: node.url.clone(),
            endpoint,
            client,
        };
        *session = Some(active.clone());
        Ok(active)
    }

    async fn attempt(
        &self,
        active: &ActiveEndpoint,
        method: &str,
        params: Option<&Value>,
    ) -> Result<(Value, Duration), AttemptError> {
        let start = Instant::now();

        if let Some(result) = self.try_rest(active, method).await {
            return Ok((result, start.elapsed()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let mut req = active
            .client
            .post(active.endpoint.rpc_url())
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(credentials) = active.endpoint.credentials() {
            req = req.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let resp = req.send().await.map_err(|e| AttemptError::Transport(e.into()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read response body".into());
            return Err(AttemptError::Transport(TransportError::ServerError { status, body }));
        }

        let text = resp.text().await.map_err(|e| AttemptError::Transport(e.into()))?;
        let elapsed = start.elapsed();
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            AttemptError::Transport(TransportError::InvalidBody {
                status,
                reason: e.to_string(),
            })
        })?;

        into_rpc_result(body)
            .map(|result| (result, elapsed))
            .map_err(AttemptError::Rpc)
    }

    /// Best-effort GET on the REST sibling of `method`, if it has one.
    ///
    /// Any failure returns `None` and the caller uses the JSON-RPC envelope.
    async fn try_rest(&self, active: &ActiveEndpoint, method: &str) -> Option<Value> {
        if active.endpoint.kind() != RpcKind::Daemon {
            return None;
        }
        let (_, path) = REST_METHODS.iter().find(|(m, _)| *m == method)?;

        let mut req = active.client.get(active.endpoint.rest_url(path));
        if let Some(credentials) = active.endpoint.credentials() {
            req = req.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let outcome = async {
            let resp = req.send().await.ok()?.error_for_status().ok()?;
            let value: Value = resp.json().await.ok()?;
            value.is_object().then_some(value)
        }
        .await;

        if outcome.is_none() {
            debug!(method = method; "REST path unavailable, falling back to JSON-RPC");
        }
        outcome
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ActiveEndpoint>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}
