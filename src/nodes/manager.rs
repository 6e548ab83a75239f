use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;

use super::{
    cache::NodeCache,
    fallback,
    record::NodeRecord,
    selection,
};
use crate::logging::redact_url;

/// Failures a manager tolerates before forcing a pool refresh.
pub const FAILURE_REFRESH_THRESHOLD: u32 = 3;

/// Diagnostic view of one known node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatusEntry {
    pub name: String,
    pub url: String,
    pub description: String,
    pub is_local: bool,
    pub priority: u32,
    pub response_time: f64,
    pub success_rate: f64,
    pub last_tested: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl NodeStatusEntry {
    fn from_record(record: NodeRecord, current: Option<&str>) -> Self {
        let is_current = current == Some(record.url.as_str());
        Self {
            name: record.name,
            url: record.url,
            description: record.description,
            is_local: record.is_local,
            priority: record.priority,
            response_time: record.response_time,
            success_rate: record.success_rate,
            last_tested: record.last_tested,
            is_current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub current_node: Option<String>,
    pub total_nodes: usize,
    pub nodes: Vec<NodeStatusEntry>,
}

struct ManagerState {
    current: Option<NodeRecord>,
    failure_count: u32,
    /// Owned records when the manager is not backed by a cache.
    static_nodes: Vec<NodeRecord>,
    rng: StdRng,
}

/// Per-client view of which node to use.
///
/// Backed either by a shared [`NodeCache`] or by a fixed list of nodes given
/// by the caller. Safe to share between concurrent callers.
pub struct NodeManager {
    cache: Option<NodeCache>,
    state: Mutex<ManagerState>,
}

impl NodeManager {
    /// Manager over a caller-supplied list. The node cache is never used.
    pub fn from_static(nodes: Vec<NodeRecord>) -> Self {
        Self::new(None, nodes)
    }

    /// Manager delegating pool maintenance to `cache`.
    pub fn with_cache(cache: NodeCache) -> Self {
        Self::new(Some(cache), Vec::new())
    }

    fn new(cache: Option<NodeCache>, static_nodes: Vec<NodeRecord>) -> Self {
        Self {
            cache,
            state: Mutex::new(ManagerState {
                current: None,
                failure_count: 0,
                static_nodes,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Reseeds the manager's own random source.
    pub fn with_seed(self, seed: u64) -> Self {
        self.lock_state().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn is_cache_backed(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&NodeCache> {
        self.cache.as_ref()
    }

    /// The node to use for the next request, choosing one if none is set.
    pub fn current_node(&self) -> Option<NodeRecord> {
        let mut state = self.lock_state();
        if let Some(current) = &state.current {
            return Some(current.clone());
        }
        let picked = self.pick(&mut state, &HashSet::new());
        state.current = picked.clone();
        picked
    }

    /// Marks `failed` and moves to a node whose name is not in `tried`.
    ///
    /// `failed` is the node the caller attempted, which is not necessarily
    /// the current node when the manager is shared. Returns `None`, leaving
    /// the current node unchanged, when every known node has been tried.
    pub fn next_node(&self, failed: &NodeRecord, tried: &HashSet<String>) -> Option<NodeRecord> {
        self.mark_node_failure(&failed.url);

        let mut excluded = tried.clone();
        excluded.insert(failed.name.clone());

        let mut state = self.lock_state();
        let next = self.pick_excluding(&mut state, &excluded)?;
        debug!(node:% = redact_url(&next.url); "Switching to next node");
        state.current = Some(next.clone());
        Some(next)
    }

    /// Re-rolls the current node without marking anything failed.
    ///
    /// Prefers a node other than the current one when there is a choice.
    pub fn reset_to_random_node(&self) -> Option<NodeRecord> {
        let mut state = self.lock_state();
        let mut excluded = HashSet::new();
        if let Some(current) = &state.current {
            excluded.insert(current.name.clone());
        }

        let picked = self
            .pick_excluding(&mut state, &excluded)
            .or_else(|| self.pick(&mut state, &HashSet::new()));
        state.current = picked.clone();
        picked
    }

    /// Records a transport failure against the node at `url`.
    ///
    /// Every [`FAILURE_REFRESH_THRESHOLD`] + 1 failures the pool is refreshed
    /// out of cycle.
    pub fn mark_node_failure(&self, url: &str) {
        let trip = {
            let mut state = self.lock_state();
            if self.cache.is_none() {
                let now = Utc::now();
                if let Some(record) = state.static_nodes.iter_mut().find(|n| n.url == url) {
                    record.record_failure(now);
                }
            }
            state.failure_count += 1;
            let trip = state.failure_count > FAILURE_REFRESH_THRESHOLD;
            if trip {
                state.failure_count = 0;
            }
            trip
        };

        if let Some(cache) = &self.cache {
            cache.mark_failure(url);
            if trip {
                info!(threshold = FAILURE_REFRESH_THRESHOLD; "Repeated node failures, forcing node pool refresh");
                cache.force_refresh();
            }
        }
    }

    /// Records a successful call against the node at `url`.
    pub fn mark_node_success(&self, url: &str, elapsed: Duration) {
        match &self.cache {
            Some(cache) => {
                cache.mark_success(url, elapsed);
            },
            None => {
                let now = Utc::now();
                let mut state = self.lock_state();
                if let Some(record) = state.static_nodes.iter_mut().find(|n| n.url == url) {
                    record.record_success(elapsed, now);
                }
            },
        }
    }

    /// Every known node, ordered by priority then name.
    pub fn list_nodes(&self) -> Vec<NodeStatusEntry> {
        let current = self.lock_state().current.as_ref().map(|n| n.url.clone());
        self.known_nodes()
            .into_iter()
            .map(|record| NodeStatusEntry::from_record(record, current.as_deref()))
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        let nodes = self.list_nodes();
        let current_node = self.lock_state().current.as_ref().map(|n| n.name.clone());
        NodeStatus {
            current_node,
            total_nodes: nodes.len(),
            nodes,
        }
    }

    pub fn known_node_count(&self) -> usize {
        self.known_nodes().len()
    }

    pub fn failure_count(&self) -> u32 {
        self.lock_state().failure_count
    }

    fn known_nodes(&self) -> Vec<NodeRecord> {
        match &self.cache {
            Some(cache) => cache.get_all_nodes(),
            None => {
                let mut nodes = self.lock_state().static_nodes.clone();
                nodes.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
                nodes
            },
        }
    }

    /// Any node not in `excluded`, falling back to the built-in list when the
    /// cache has nothing at all.
    fn pick(&self, state: &mut ManagerState, excluded: &HashSet<String>) -> Option<NodeRecord> {
        match &self.cache {
            Some(cache) => cache.random_node_excluding(excluded).or_else(|| {
                let fallback = cache.settings().fallback_nodes.clone();
                let fallback = if fallback.is_empty() {
                    fallback::trusted_nodes()
                } else {
                    fallback
                };
                uniform_excluding(&fallback, excluded, &mut state.rng)
            }),
            None => {
                let ManagerState { static_nodes, rng, .. } = state;
                uniform_excluding(static_nodes, excluded, rng)
            },
        }
    }

    /// Like [`pick`](Self::pick) but never leaves the known pool. The
    /// built-in list is only used when the pool itself is empty.
    fn pick_excluding(&self, state: &mut ManagerState, excluded: &HashSet<String>) -> Option<NodeRecord> {
        match &self.cache {
            Some(cache) => {
                if cache.is_empty() {
                    self.pick(state, excluded)
                } else {
                    cache.random_node_excluding(excluded)
                }
            },
            None => self.pick(state, excluded),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn uniform_excluding(nodes: &[NodeRecord], excluded: &HashSet<String>, rng: &mut StdRng) -> Option<NodeRecord> {
    let candidates: Vec<&NodeRecord> = nodes.iter().filter(|n| !excluded.contains(&n.name)).collect();
    selection::uniform_choice(&candidates, rng).cloned()
}
