//! Liveness probing of candidate nodes.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use log::debug;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    logging::redact_url,
    rpc::{RpcKind, into_rpc_result},
};

/// Derived success rate of a node that answered but reports it is syncing.
pub const SYNCING_SUCCESS_RATE: f64 = 0.5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Probe request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Probe got HTTP {0}")]
    ServerError(reqwest::StatusCode),

    #[error("Probe got a non-JSON body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// Result of one successful probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub url: String,
    pub response_time: Duration,
    /// In `[0.0, 1.0]`, derived from what the node reported about itself.
    pub success_rate: f64,
}

#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError>;
}

/// Scores a probe response body.
///
/// A JSON-RPC error or a status other than `OK` scores zero, a node still
/// syncing scores [`SYNCING_SUCCESS_RATE`], anything else is fully healthy.
pub fn score_probe_response(body: Value) -> f64 {
    let info = match into_rpc_result(body) {
        Ok(info) => info,
        Err(_) => return 0.0,
    };

    if let Some(status) = info.get("status").and_then(Value::as_str) {
        if status != "OK" {
            return 0.0;
        }
    }

    let busy = info.get("busy_syncing").and_then(Value::as_bool).unwrap_or(false);
    let synchronized = info.get("synchronized").and_then(Value::as_bool).unwrap_or(true);
    if busy || !synchronized {
        return SYNCING_SUCCESS_RATE;
    }
    1.0
}

/// Probes nodes with a single liveness call over HTTP.
pub struct HttpProber {
    client: reqwest::Client,
    kind: RpcKind,
}

impl HttpProber {
    pub fn new(kind: RpcKind) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, kind })
    }
}

#[async_trait]
impl NodeProber for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        let body = json!({"jsonrpc": "2.0", "id": "0", "method": self.kind.liveness_method()});

        let start = Instant::now();
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ProbeError::ServerError(resp.status()));
        }

        let text = resp.text().await?;
        let response_time = start.elapsed();
        let body: Value = serde_json::from_str(&text)?;

        Ok(ProbeOutcome {
            url: url.to_string(),
            response_time,
            success_rate: score_probe_response(body),
        })
    }
}

/// Probes all candidates through a fixed-size pool of `workers`.
///
/// Each probe is bounded by `probe_timeout` and the whole phase by
/// `phase_timeout`; probes still running when the phase ends are dropped.
/// Failed and timed-out probes are simply absent from the result.
pub async fn run_probes(
    prober: Arc<dyn NodeProber>,
    candidates: Vec<String>,
    workers: usize,
    probe_timeout: Duration,
    phase_timeout: Duration,
) -> Vec<ProbeOutcome> {
    let deadline = tokio::time::Instant::now() + phase_timeout;

    let mut probes = stream::iter(candidates)
        .map(|url| {
            let prober = prober.clone();
            async move {
                match tokio::time::timeout(probe_timeout, prober.probe(&url, probe_timeout)).await {
                    Ok(Ok(outcome)) => Some(outcome),
                    Ok(Err(e)) => {
                        debug!(node:% = redact_url(&url), error:% = e; "Probe failed");
                        None
                    },
                    Err(_) => {
                        debug!(node:% = redact_url(&url); "Probe timed out");
                        None
                    },
                }
            }
        })
        .buffer_unordered(workers.max(1));

    let mut outcomes = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, probes.next()).await {
            Ok(Some(Some(outcome))) => outcomes.push(outcome),
            Ok(Some(None)) => {},
            Ok(None) => break,
            Err(_) => {
                debug!(completed = outcomes.len(); "Probe phase timed out");
                break;
            },
        }
    }
    outcomes
}
