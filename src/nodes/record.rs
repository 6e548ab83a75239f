use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A node's success rate never drops below this, so it always keeps some
/// chance of being selected again.
pub const SUCCESS_RATE_FLOOR: f64 = 0.1;

/// Factor applied to the success rate on every failure.
pub const FAILURE_DECAY: f64 = 0.8;

/// Nodes strictly above this success rate count as healthy.
pub const HEALTHY_SUCCESS_RATE: f64 = 0.5;

/// Lower bound for the response time used in weighting, in seconds.
pub const MIN_RESPONSE_TIME_SECS: f64 = 0.1;

/// Smoothing factor of the response time moving average.
const RESPONSE_TIME_ALPHA: f64 = 0.3;

fn default_success_rate() -> f64 {
    1.0
}

/// Identity and live health metrics of one node. The `url` is the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_local: bool,
    /// Lower is preferred. Only used to break ties between equal weights.
    #[serde(default)]
    pub priority: u32,
    /// Seconds. Zero until the first measurement.
    #[serde(default)]
    pub response_time: f64,
    #[serde(default)]
    pub last_tested: Option<DateTime<Utc>>,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    /// Request timeout for this node in seconds. The endpoint's own timeout
    /// applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            description: String::new(),
            is_local: false,
            priority: 1,
            response_time: 0.0,
            last_tested: None,
            success_rate: default_success_rate(),
            timeout_secs: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Selection weight: reliable and fast nodes dominate, but every node
    /// keeps a non-zero weight.
    pub fn weight(&self) -> f64 {
        self.success_rate / self.response_time.max(MIN_RESPONSE_TIME_SECS)
    }

    pub fn is_healthy(&self) -> bool {
        self.success_rate > HEALTHY_SUCCESS_RATE
    }

    /// Decays the success rate, clamped at [`SUCCESS_RATE_FLOOR`].
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.success_rate = (self.success_rate * FAILURE_DECAY).max(SUCCESS_RATE_FLOOR);
        self.last_tested = Some(now);
    }

    /// Folds a successful round trip into the metrics.
    pub fn record_success(&mut self, elapsed: Duration, now: DateTime<Utc>) {
        let sample = elapsed.as_secs_f64();
        self.response_time = if self.response_time <= 0.0 {
            sample
        } else {
            RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * self.response_time
        };
        self.success_rate = (self.success_rate * 0.9 + 0.1).min(1.0);
        self.last_tested = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeRecord {
        NodeRecord::new("a", "http://a.example:18081/json_rpc")
    }

    #[test]
    fn test_weight_uses_response_time_floor() {
        let mut n = node();
        assert!((n.weight() - 10.0).abs() < 1e-9);

        n.response_time = 0.5;
        n.success_rate = 0.8;
        assert!((n.weight() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_failure_decays_and_clamps() {
        let now = Utc::now();
        let mut start = SUCCESS_RATE_FLOOR;
        while start <= 1.0 {
            let mut n = node();
            n.success_rate = start;
            n.record_failure(now);
            assert!(n.success_rate >= SUCCESS_RATE_FLOOR);
            if start * FAILURE_DECAY > SUCCESS_RATE_FLOOR {
                assert!(n.success_rate < start);
                assert!((n.success_rate - start * FAILURE_DECAY).abs() < 1e-12);
            } else {
                assert_eq!(n.success_rate, SUCCESS_RATE_FLOOR);
            }
            start += 0.05;
        }
    }

    #[test]
    fn test_success_updates_metrics() {
        let now = Utc::now();
        let mut n = node();
        n.success_rate = 0.5;
        n.record_success(Duration::from_millis(400), now);
        assert!((n.response_time - 0.4).abs() < 1e-9);
        assert!((n.success_rate - 0.55).abs() < 1e-9);
        assert_eq!(n.last_tested, Some(now));

        n.record_success(Duration::from_millis(100), now);
        assert!((n.response_time - (0.3 * 0.1 + 0.7 * 0.4)).abs() < 1e-9);

        n.success_rate = 1.0;
        n.record_success(Duration::from_millis(100), now);
        assert_eq!(n.success_rate, 1.0);
    }

    #[test]
    fn test_deserialises_minimal_record_with_defaults() {
        let n: NodeRecord = serde_json::from_str(r#"{"name":"x","url":"http://x:18081/json_rpc"}"#).unwrap();
        assert_eq!(n.success_rate, 1.0);
        assert_eq!(n.response_time, 0.0);
        assert!(n.last_tested.is_none());
    }
}
