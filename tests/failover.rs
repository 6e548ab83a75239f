use std::{
    collections::HashSet,
    net::TcpListener,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use monerostack_rpc::{
    nodes::{
        DiscoveryError, HttpNodeDirectory, HttpProber, NodeCache, NodeCacheSettings, NodeDirectory, NodeManager,
        NodeRecord, SnapshotStore, trusted_nodes,
    },
    rpc::{RpcClientError, RpcEndpoint, RpcKind, RpcTransport, TransportError},
};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct UnreachableDirectory;

#[async_trait]
impl NodeDirectory for UnreachableDirectory {
    async fn fetch_candidates(&self, _limit: usize) -> Result<Vec<String>, DiscoveryError> {
        Err(DiscoveryError::NoCandidates)
    }
}

/// A loopback URL nothing is listening on.
fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/json_rpc")
}

fn cache_over(nodes: Vec<NodeRecord>) -> NodeCache {
    NodeCache::builder(Arc::new(UnreachableDirectory), Arc::new(HttpProber::new(RpcKind::Daemon).unwrap()))
        .settings(NodeCacheSettings {
            fallback_nodes: nodes.clone(),
            ..NodeCacheSettings::default()
        })
        .initial_nodes(nodes)
        .seed(42)
        .build()
}

fn template() -> RpcEndpoint {
    RpcEndpoint::builder(RpcKind::Daemon).build().unwrap()
}

fn success_rate(manager: &NodeManager, name: &str) -> f64 {
    manager
        .status()
        .nodes
        .into_iter()
        .find(|n| n.name == name)
        .map(|n| n.success_rate)
        .unwrap()
}

#[tokio::test]
async fn test_all_nodes_refused_exhausts_after_each_node_once() {
    let nodes: Vec<NodeRecord> = ["n1", "n2", "n3"]
        .into_iter()
        .map(|name| NodeRecord::new(name, refused_url()))
        .collect();
    let manager = Arc::new(NodeManager::with_cache(cache_over(nodes)));
    let transport = RpcTransport::new(manager.clone(), template());

    let err = transport.call("get_info", None).await.unwrap_err();
    match err {
        RpcClientError::ExhaustedNodes { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(matches!(last_error, Some(TransportError::RequestFailed(_))));
        },
        other => panic!("unexpected error: {other}"),
    }

    for name in ["n1", "n2", "n3"] {
        assert!((success_rate(&manager, name) - 0.8).abs() < 1e-12, "{name}");
    }
}

#[tokio::test]
async fn test_failing_servers_are_each_attempted_exactly_once() {
    let mut servers = Vec::new();
    for _ in 0..3 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        servers.push(server);
    }
    let nodes = servers
        .iter()
        .enumerate()
        .map(|(i, s)| NodeRecord::new(format!("s{i}"), format!("{}/json_rpc", s.uri())))
        .collect();
    let manager = Arc::new(NodeManager::from_static(nodes));
    let transport = RpcTransport::new(manager.clone(), template());

    let err = transport.call("get_info", None).await.unwrap_err();
    assert!(matches!(
        err,
        RpcClientError::ExhaustedNodes {
            attempts: 3,
            last_error: Some(TransportError::ServerError { .. })
        }
    ));
    assert_eq!(manager.failure_count(), 3);
}

#[tokio::test]
async fn test_rpc_error_is_raised_without_failover_or_decay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/json_rpc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": {"code": -1, "message": "denied"}})))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = RpcEndpoint::from_url(&format!("{}/json_rpc", server.uri()), RpcKind::Wallet, None).unwrap();
    let transport = RpcTransport::single(endpoint);
    let node_name = transport.manager().current_node().unwrap().name;

    let err = transport.call("transfer", Some(&json!({"destinations": []}))).await.unwrap_err();
    match err {
        RpcClientError::Rpc(e) => {
            assert_eq!(e.code, -1);
            assert_eq!(e.message, "denied");
        },
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(success_rate(transport.manager(), &node_name), 1.0);
    assert_eq!(transport.manager().failure_count(), 0);
}

#[tokio::test]
async fn test_success_rotates_to_another_node() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"height": 100}})))
            .mount(server)
            .await;
    }

    let nodes = vec![
        NodeRecord::new("first", format!("{}/json_rpc", first.uri())),
        NodeRecord::new("second", format!("{}/json_rpc", second.uri())),
    ];
    let manager = Arc::new(NodeManager::with_cache(cache_over(nodes)));
    let transport = RpcTransport::new(manager.clone(), template());

    let used = manager.current_node().unwrap();
    let result = transport.call("get_block_header_by_height", None).await.unwrap();
    assert_eq!(result, json!({"height": 100}));

    let next = manager.current_node().unwrap();
    assert_ne!(next.name, used.name);
    assert_eq!(transport.current_endpoint(), Some(used.url.clone()));

    // The next call goes to the rotated node.
    transport.call("get_block_header_by_height", None).await.unwrap();
    let hits: Vec<usize> = vec![
        first.received_requests().await.unwrap().len(),
        second.received_requests().await.unwrap().len(),
    ];
    assert_eq!(hits, vec![1, 1]);
}

#[tokio::test]
async fn test_transport_failure_fails_over_to_working_node() {
    let good = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"status": "OK"}})))
        .mount(&good)
        .await;

    let nodes = vec![
        NodeRecord::new("dead", refused_url()),
        NodeRecord::new("good", format!("{}/json_rpc", good.uri())),
    ];
    let manager = Arc::new(NodeManager::from_static(nodes).with_seed(0));
    let transport = RpcTransport::new(manager.clone(), template());

    for _ in 0..5 {
        let result = transport.call("get_info", None).await.unwrap();
        assert_eq!(result, json!({"status": "OK"}));
    }
}

#[tokio::test]
async fn test_concurrent_calls_fail_over_from_the_node_they_attempted() {
    let bad = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_delay(Duration::from_millis(200)))
        .expect(2)
        .mount(&bad)
        .await;
    let good = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"status": "OK"}})))
        .expect(2)
        .mount(&good)
        .await;

    let manager = Arc::new(NodeManager::from_static(vec![
        NodeRecord::new("bad", format!("{}/json_rpc", bad.uri())),
        NodeRecord::new("good", format!("{}/json_rpc", good.uri())),
    ]));
    if manager.current_node().unwrap().name != "bad" {
        manager.reset_to_random_node();
    }
    assert_eq!(manager.current_node().unwrap().name, "bad");
    let transport = RpcTransport::new(manager.clone(), template());

    // Both calls start on "bad"; the first to fail moves the manager to "good"
    // before the second one fails.
    let (first, second) = tokio::join!(transport.call("get_info", None), transport.call("get_info", None));
    assert_eq!(first.unwrap(), json!({"status": "OK"}));
    assert_eq!(second.unwrap(), json!({"status": "OK"}));

    assert!((success_rate(&manager, "bad") - 0.64).abs() < 1e-12);
    assert_eq!(success_rate(&manager, "good"), 1.0);
    assert_eq!(manager.failure_count(), 2);
}

#[tokio::test]
async fn test_empty_cache_with_unreachable_directory_serves_fallback() {
    let directory = HttpNodeDirectory::with_config(
        Url::parse(&refused_url()).unwrap(),
        0,
        Duration::from_secs(2),
    )
    .unwrap();
    let cache = NodeCache::builder(Arc::new(directory), Arc::new(HttpProber::new(RpcKind::Daemon).unwrap()))
        .seed(7)
        .build();

    let node = cache.get_random_node().expect("fallback node");
    let trusted: HashSet<String> = trusted_nodes().into_iter().map(|n| n.name).collect();
    assert!(trusted.contains(&node.name));

    cache.wait_for_refresh().await;
    assert!(!cache.is_refreshing());
    assert_eq!(cache.get_all_nodes().len(), trusted.len());
}

#[tokio::test]
async fn test_repeated_failures_decay_to_expected_rate() {
    let nodes = vec![
        NodeRecord::new("a", "http://a.example:18081/json_rpc"),
        NodeRecord::new("b", "http://b.example:18081/json_rpc"),
        NodeRecord::new("c", "http://c.example:18081/json_rpc"),
    ];
    let cache = cache_over(nodes);

    let mut rate = 0.0;
    for _ in 0..4 {
        rate = cache.mark_failure("http://a.example:18081/json_rpc").unwrap();
    }
    assert!((rate - f64::max(0.1, 0.8f64.powi(4))).abs() < 1e-12);
}

#[tokio::test]
async fn test_discovery_probes_directory_nodes_and_persists() {
    let synced = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "get_info"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"status": "OK", "synchronized": true}})))
        .mount(&synced)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"status": "BUSY"}})))
        .mount(&broken)
        .await;

    let directory_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nodes.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "monero": {
                "clear": [synced.uri(), broken.uri(), refused_url()],
                "onion": ["http://hidden.onion:18081"]
            }
        })))
        .expect(1)
        .mount(&directory_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("node_cache.json");
    let directory = HttpNodeDirectory::new(Url::parse(&format!("{}/nodes.json", directory_server.uri())).unwrap()).unwrap();
    let cache = NodeCache::builder(Arc::new(directory), Arc::new(HttpProber::new(RpcKind::Daemon).unwrap()))
        .settings(NodeCacheSettings {
            snapshot_path: Some(snapshot_path.clone()),
            ..NodeCacheSettings::default()
        })
        .build();

    assert!(cache.force_refresh());
    cache.wait_for_refresh().await;

    let pool = cache.get_all_nodes();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].url, format!("{}/json_rpc", synced.uri()));
    assert_eq!(pool[0].success_rate, 1.0);
    assert!(pool[0].last_tested.is_some());

    let snapshot = SnapshotStore::new(&snapshot_path).load().unwrap().unwrap();
    assert_eq!(snapshot.nodes.len(), 1);
    assert_eq!(snapshot.nodes[0].url, pool[0].url);
}
