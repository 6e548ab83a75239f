//! Candidate node discovery from an external node directory.
//!
//! The directory publishes a JSON document grouping node URLs by how they are
//! reached:
//!
//! ```json
//! { "monero": { "clear": ["http://node.example:18081"], "onion": ["http://abc.onion:18081"] } }
//! ```
//!
//! Only the clearnet group is consumed.

use std::{collections::HashSet, time::Duration};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::rpc::DEFAULT_RPC_PATH;

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Failures while discovering or probing candidates.
///
/// The node cache always recovers from these internally.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Middleware error: {0}")]
    MiddlewareError(#[from] reqwest_middleware::Error),

    #[error("Directory returned {status}")]
    ServerError { status: reqwest::StatusCode },

    #[error("Invalid directory document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("Directory listed no usable clearnet nodes")]
    NoCandidates,

    #[error("No candidate passed the liveness probe")]
    NoHealthyCandidates,
}

/// Source of candidate node URLs.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Returns at most `limit` normalised JSON-RPC URLs.
    async fn fetch_candidates(&self, limit: usize) -> Result<Vec<String>, DiscoveryError>;
}

#[derive(Debug, Default, Deserialize)]
struct ReachabilityGroups {
    #[serde(default)]
    clear: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DirectoryDocument {
    Grouped { monero: ReachabilityGroups },
    Flat(ReachabilityGroups),
}

/// Extracts the clearnet candidates from a directory document.
pub fn parse_directory_document(body: &str, limit: usize) -> Result<Vec<String>, DiscoveryError> {
    let document: DirectoryDocument = serde_json::from_str(body)?;
    let clear = match document {
        DirectoryDocument::Grouped { monero } => monero.clear,
        DirectoryDocument::Flat(groups) => groups.clear,
    };

    let mut seen = HashSet::new();
    Ok(clear
        .iter()
        .filter_map(|raw| normalize_candidate(raw))
        .filter(|url| seen.insert(url.clone()))
        .take(limit)
        .collect())
}

/// Turns a directory entry into a JSON-RPC URL.
///
/// Anything that is not plain http(s) on a clearnet host is dropped. A bare
/// base URL gets the JSON-RPC envelope path.
pub fn normalize_candidate(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    if host.ends_with(".onion") || host.ends_with(".i2p") {
        return None;
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_RPC_PATH);
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Fetches candidates over HTTP, retrying transient failures with
/// exponential backoff.
pub struct HttpNodeDirectory {
    url: Url,
    client: reqwest_middleware::ClientWithMiddleware,
}

impl HttpNodeDirectory {
    pub fn new(url: Url) -> Result<Self, reqwest::Error> {
        Self::with_config(url, DEFAULT_MAX_RETRIES, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_config(url: Url, max_retries: u32, timeout: Duration) -> Result<Self, reqwest::Error> {
        let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let inner_client = reqwest::Client::builder().timeout(timeout).build()?;

        let client = reqwest_middleware::ClientBuilder::new(inner_client)
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { url, client })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl NodeDirectory for HttpNodeDirectory {
    async fn fetch_candidates(&self, limit: usize) -> Result<Vec<String>, DiscoveryError> {
        let resp = self.client.get(self.url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(DiscoveryError::ServerError { status: resp.status() });
        }

        let body = resp.text().await?;
        let candidates = parse_directory_document(&body, limit)?;
        debug!(count = candidates.len(); "Fetched node directory");

        if candidates.is_empty() {
            return Err(DiscoveryError::NoCandidates);
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_normalize_candidate() {
        assert_eq!(
            normalize_candidate("http://node.example:18081").as_deref(),
            Some("http://node.example:18081/json_rpc")
        );
        assert_eq!(
            normalize_candidate("https://node.example/json_rpc?x=1").as_deref(),
            Some("https://node.example/json_rpc")
        );
        assert!(normalize_candidate("http://abcdef.onion:18081").is_none());
        assert!(normalize_candidate("http://xyz.b32.i2p").is_none());
        assert!(normalize_candidate("tcp://node.example:18081").is_none());
        assert!(normalize_candidate("garbage").is_none());
    }

    #[test]
    fn test_parse_directory_uses_clearnet_only_and_caps() {
        let body = r#"{
            "monero": {
                "clear": ["http://a.example:18081", "http://a.example:18081", "http://b.example:18089", "http://c.example:18081"],
                "onion": ["http://hidden.onion:18081"],
                "web_compatible": ["https://d.example"]
            }
        }"#;
        let nodes = parse_directory_document(body, 2).unwrap();
        assert_eq!(
            nodes,
            vec!["http://a.example:18081/json_rpc", "http://b.example:18089/json_rpc"]
        );

        let flat = parse_directory_document(r#"{"clear": ["http://e.example:18081"]}"#, 20).unwrap();
        assert_eq!(flat, vec!["http://e.example:18081/json_rpc"]);

        assert!(parse_directory_document("[1, 2]", 20).is_err());
    }

    #[tokio::test]
    async fn test_http_directory_fetch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodes.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "monero": {"clear": ["http://node-1.example:18081", "http://node-2.example:18081"]}
            })))
            .mount(&mock_server)
            .await;

        let url = Url::parse(&format!("{}/nodes.json", mock_server.uri())).unwrap();
        let directory = HttpNodeDirectory::with_config(url, 0, Duration::from_secs(5)).unwrap();
        let nodes = directory.fetch_candidates(20).await.unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_http_directory_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"monero": {"clear": []}}"#))
            .mount(&mock_server)
            .await;

        let down = HttpNodeDirectory::with_config(
            Url::parse(&format!("{}/down", mock_server.uri())).unwrap(),
            0,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            down.fetch_candidates(20).await,
            Err(DiscoveryError::ServerError { .. })
        ));

        let empty = HttpNodeDirectory::with_config(
            Url::parse(&format!("{}/empty", mock_server.uri())).unwrap(),
            0,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(empty.fetch_candidates(20).await, Err(DiscoveryError::NoCandidates)));
    }
}
