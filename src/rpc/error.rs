//! Error types for JSON-RPC calls.
//!
//! Callers only ever see [`RpcClientError`]. Its variants map onto the three
//! outcomes a call can end in:
//!
//! - [`RpcClientError::Config`]: the endpoint could not be built at all
//! - [`RpcClientError::Rpc`]: a working node answered with a JSON-RPC error
//! - [`RpcClientError::ExhaustedNodes`]: every node tried in this call failed
//!   at the transport level
//!
//! [`TransportError`] is the per-attempt classification used by the retry
//! loop; the last one seen is carried inside `ExhaustedNodes`.

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// A malformed or missing endpoint description.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid endpoint URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Endpoint has no host: {0}")]
    MissingHost(String),

    #[error("Invalid RPC kind: {0}")]
    InvalidKind(String),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// A failure talking to a node, as opposed to a node refusing a request.
///
/// Every variant makes the node a candidate for failover.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection refused or reset, DNS failure, TLS failure or timeout.
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The node answered with a non-2xx status code.
    #[error("Server error {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    /// The node answered 2xx but the body was not a JSON document.
    #[error("Non-JSON response from RPC (HTTP {status}): {reason}")]
    InvalidBody { status: StatusCode, reason: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::RequestFailed(e) if e.is_timeout())
    }
}

/// A well-formed JSON-RPC error envelope returned by a node.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    /// Builds an error from the value of an envelope's `error` member.
    ///
    /// Nodes are not always strict about the shape, so a bare string is
    /// accepted as the message and missing members fall back to defaults.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self {
                code: map.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("RPC error")
                    .to_string(),
                data: map.get("data").filter(|d| !d.is_null()).cloned(),
            },
            Value::String(message) => Self {
                code: 0,
                message: message.clone(),
                data: None,
            },
            other => Self {
                code: 0,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

/// The error returned by every call made through an
/// [`RpcTransport`](crate::rpc::RpcTransport).
#[derive(Debug, Error)]
pub enum RpcClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("All nodes exhausted after {attempts} attempt(s){}", describe_last(.last_error))]
    ExhaustedNodes {
        attempts: usize,
        last_error: Option<TransportError>,
    },

    #[error("Failed to decode RPC result: {0}")]
    Decode(#[from] serde_json::Error),
}

fn describe_last(last_error: &Option<TransportError>) -> String {
    match last_error {
        Some(e) => format!(", last error: {e}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_error_from_envelope_object() {
        let err = RpcError::from_value(&json!({"code": -1, "message": "denied", "data": {"why": "nope"}}));
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "denied");
        assert_eq!(err.data, Some(json!({"why": "nope"})));
    }

    #[test]
    fn test_rpc_error_from_partial_or_bare_values() {
        let err = RpcError::from_value(&json!({"code": -13}));
        assert_eq!(err.code, -13);
        assert_eq!(err.message, "RPC error");
        assert_eq!(err.data, None);

        let err = RpcError::from_value(&json!("wallet not open"));
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "wallet not open");
    }

    #[test]
    fn test_exhausted_display_mentions_last_error() {
        let err = RpcClientError::ExhaustedNodes {
            attempts: 3,
            last_error: Some(TransportError::ServerError {
                status: StatusCode::BAD_GATEWAY,
                body: "upstream".into(),
            }),
        };
        let text = err.to_string();
        assert!(text.starts_with("All nodes exhausted after 3 attempt(s)"));
        assert!(text.contains("502"));

        let err = RpcClientError::ExhaustedNodes {
            attempts: 0,
            last_error: None,
        };
        assert_eq!(err.to_string(), "All nodes exhausted after 0 attempt(s)");
    }
}
