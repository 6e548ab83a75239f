//! Scored, self-refreshing pool of candidate nodes.
//!
//! # Concurrency
//!
//! The record set, the last refresh time and the in-flight flag live behind a
//! single mutex. Every operation holds it only long enough to read or update
//! state; discovery, probing and snapshot IO all happen outside of it.
//!
//! A refresh is single-flight: the in-flight flag is checked and set in the
//! same critical section, and cleared by a guard when the refresh task ends,
//! whatever the outcome. Completion is published on a `watch` channel so
//! callers can await it with [`NodeCache::wait_for_refresh`].
//!
//! # Refresh policy
//!
//! A refresh is due when the pool is older than the TTL, empty, or has fewer
//! than two healthy records, and at least the minimum interval has passed
//! since the previous one. [`NodeCache::force_refresh`] skips both time
//! checks but is still single-flight.

use std::{
    collections::{BTreeMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{
    clock::{Clock, SystemClock},
    directory::{DiscoveryError, NodeDirectory},
    fallback,
    probe::{self, NodeProber, ProbeOutcome},
    record::NodeRecord,
    selection,
    snapshot::{NodeSnapshot, SnapshotStore},
};
use crate::logging::redact_url;

/// A pool needs at least this many healthy records to be left alone.
pub const MIN_HEALTHY_NODES: usize = 2;

#[derive(Debug, Clone)]
pub struct NodeCacheSettings {
    pub ttl: Duration,
    pub min_refresh_interval: Duration,
    pub max_candidates: usize,
    pub probe_workers: usize,
    pub probe_timeout: Duration,
    pub probe_phase_timeout: Duration,
    pub keep_top: usize,
    pub min_probe_success_rate: f64,
    /// Tick of the background worker started by [`NodeCache::start`].
    pub refresh_check_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub fallback_nodes: Vec<NodeRecord>,
}

impl Default for NodeCacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            min_refresh_interval: Duration::from_secs(5 * 60),
            max_candidates: 20,
            probe_workers: 8,
            probe_timeout: Duration::from_secs(5),
            probe_phase_timeout: Duration::from_secs(30),
            keep_top: 10,
            min_probe_success_rate: 0.3,
            refresh_check_interval: Duration::from_secs(60),
            snapshot_path: None,
            fallback_nodes: fallback::trusted_nodes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshReason {
    NeverRefreshed,
    Expired,
    Empty,
    Unhealthy,
    Forced,
}

impl RefreshReason {
    fn as_str(self) -> &'static str {
        match self {
            RefreshReason::NeverRefreshed => "never_refreshed",
            RefreshReason::Expired => "expired",
            RefreshReason::Empty => "empty",
            RefreshReason::Unhealthy => "unhealthy",
            RefreshReason::Forced => "forced",
        }
    }
}

struct CacheState {
    records: BTreeMap<String, NodeRecord>,
    last_refresh: Option<DateTime<Utc>>,
    refresh_in_flight: bool,
    rng: StdRng,
}

impl CacheState {
    fn healthy_count(&self) -> usize {
        self.records.values().filter(|r| r.is_healthy()).count()
    }

    fn replace(&mut self, records: Vec<NodeRecord>) {
        self.records = records.into_iter().map(|r| (r.url.clone(), r)).collect();
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CacheInner {
    settings: NodeCacheSettings,
    state: Mutex<CacheState>,
    directory: Arc<dyn NodeDirectory>,
    prober: Arc<dyn NodeProber>,
    clock: Arc<dyn Clock>,
    store: Option<SnapshotStore>,
    refresh_done: watch::Sender<u64>,
    worker: Mutex<Option<Worker>>,
}

/// Shared registry of node records.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct NodeCache {
    inner: Arc<CacheInner>,
}

impl NodeCache {
    pub fn builder(directory: Arc<dyn NodeDirectory>, prober: Arc<dyn NodeProber>) -> NodeCacheBuilder {
        NodeCacheBuilder::new(directory, prober)
    }

    pub fn settings(&self) -> &NodeCacheSettings {
        &self.inner.settings
    }

    /// Weighted random pick over the whole pool.
    pub fn get_random_node(&self) -> Option<NodeRecord> {
        self.random_node_excluding(&HashSet::new())
    }

    /// Weighted random pick over the records whose name is not in `excluded`.
    pub fn random_node_excluding(&self, excluded: &HashSet<String>) -> Option<NodeRecord> {
        self.populate_if_empty();
        self.refresh_if_needed();

        let mut state = self.inner.lock_state();
        let CacheState { records, rng, .. } = &mut *state;
        let candidates: Vec<&NodeRecord> = records.values().filter(|r| !excluded.contains(&r.name)).collect();
        selection::weighted_choice(&candidates, rng).cloned()
    }

    /// Copy of every record, ordered by priority then name.
    pub fn get_all_nodes(&self) -> Vec<NodeRecord> {
        self.populate_if_empty();
        self.refresh_if_needed();

        let mut nodes: Vec<NodeRecord> = self.inner.lock_state().records.values().cloned().collect();
        nodes.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        nodes
    }

    /// Decays the success rate of the node at `url` and returns the new rate.
    ///
    /// Schedules a refresh, regardless of TTL, when fewer than
    /// [`MIN_HEALTHY_NODES`] healthy records remain.
    pub fn mark_failure(&self, url: &str) -> Option<f64> {
        let now = self.inner.clock.now();
        let (rate, healthy) = {
            let mut state = self.inner.lock_state();
            let rate = state.records.get_mut(url).map(|record| {
                record.record_failure(now);
                record.success_rate
            });
            (rate, state.healthy_count())
        };

        match rate {
            Some(rate) => debug!(node:% = redact_url(url), success_rate = rate; "Marked node failure"),
            None => debug!(node:% = redact_url(url); "Failure reported for a node not in the pool"),
        }

        if healthy < MIN_HEALTHY_NODES {
            self.schedule_refresh(RefreshReason::Unhealthy, true);
        }
        rate
    }

    /// Folds a successful call into the node's metrics.
    pub fn mark_success(&self, url: &str, elapsed: Duration) -> Option<f64> {
        let now = self.inner.clock.now();
        let mut state = self.inner.lock_state();
        state.records.get_mut(url).map(|record| {
            record.record_success(elapsed, now);
            record.success_rate
        })
    }

    /// Starts a background refresh if one is due. Returns whether it did.
    pub fn refresh_if_needed(&self) -> bool {
        let now = self.inner.clock.now();
        let reason = {
            let state = self.inner.lock_state();
            if state.refresh_in_flight {
                return false;
            }

            let ttl = chrono::Duration::from_std(self.inner.settings.ttl).unwrap_or(chrono::Duration::MAX);
            let reason = match state.last_refresh {
                None => Some(RefreshReason::NeverRefreshed),
                Some(last) if now - last >= ttl => Some(RefreshReason::Expired),
                Some(_) if state.records.is_empty() => Some(RefreshReason::Empty),
                Some(_) if state.healthy_count() < MIN_HEALTHY_NODES => Some(RefreshReason::Unhealthy),
                Some(_) => None,
            };
            match reason {
                Some(reason) => reason,
                None => return false,
            }
        };

        self.schedule_refresh(reason, true)
    }

    /// Starts a background refresh ignoring TTL and the minimum interval.
    ///
    /// Returns `false` when a refresh is already in flight.
    pub fn force_refresh(&self) -> bool {
        self.schedule_refresh(RefreshReason::Forced, false)
    }

    /// Number of records currently in the pool. Never populates or refreshes.
    pub fn len(&self) -> usize {
        self.inner.lock_state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_state().records.is_empty()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.lock_state().refresh_in_flight
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.lock_state().last_refresh
    }

    /// Resolves once no refresh is in flight.
    pub async fn wait_for_refresh(&self) {
        let mut done = self.inner.refresh_done.subscribe();
        while self.is_refreshing() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawns the periodic refresh worker. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut worker = self.inner.lock_worker();
        if worker.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cache = self.clone();
        let period = self.inner.settings.refresh_check_interval;

        let handle = tokio::spawn(async move {
            info!("Node cache refresh worker started.");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.refresh_if_needed();
                    }
                    _ = token.cancelled() => {
                        info!("Node cache refresh worker received shutdown signal.");
                        break;
                    }
                }
            }
        });

        *worker = Some(Worker { cancel, handle });
    }

    /// Stops the periodic worker and waits for any refresh in flight.
    pub async fn shutdown(&self) {
        let worker = self.inner.lock_worker().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                warn!(error:% = e; "Node cache refresh worker ended abnormally");
            }
        }
        self.wait_for_refresh().await;
    }

    /// Fills an empty pool from the snapshot or the fallback list so a
    /// selection can be served right away.
    fn populate_if_empty(&self) {
        if !self.inner.lock_state().records.is_empty() {
            return;
        }

        let records = self.inner.load_fallback();
        let mut state = self.inner.lock_state();
        if state.records.is_empty() {
            debug!(count = records.len(); "Populated empty node pool from fallback");
            state.replace(records);
        }
    }

    fn schedule_refresh(&self, reason: RefreshReason, respect_min_interval: bool) -> bool {
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.lock_state();
            if state.refresh_in_flight {
                return false;
            }
            if respect_min_interval {
                if let Some(last) = state.last_refresh {
                    let min = chrono::Duration::from_std(self.inner.settings.min_refresh_interval)
                        .unwrap_or(chrono::Duration::MAX);
                    if now - last < min {
                        return false;
                    }
                }
            }
            state.refresh_in_flight = true;
        }

        let guard = RefreshGuard {
            inner: self.inner.clone(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                info!(reason = reason.as_str(); "Starting node pool refresh");
                runtime.spawn(async move {
                    guard.inner.run_refresh_cycle().await;
                    drop(guard);
                });
                true
            },
            Err(_) => {
                warn!(reason = reason.as_str(); "No async runtime available, skipping node pool refresh");
                drop(guard);
                false
            },
        }
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_fallback(&self) -> Vec<NodeRecord> {
        read_fallback(self.store.as_ref(), &self.settings.fallback_nodes)
    }

    /// [`load_fallback`](Self::load_fallback) off the async worker threads.
    async fn load_fallback_blocking(&self) -> Vec<NodeRecord> {
        let store = self.store.clone();
        let fallback = self.settings.fallback_nodes.clone();
        match tokio::task::spawn_blocking(move || read_fallback(store.as_ref(), &fallback)).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error:% = e; "Node snapshot task failed");
                self.settings.fallback_nodes.clone()
            },
        }
    }

    async fn run_refresh_cycle(&self) {
        let records = match self.discover().await {
            Ok(records) => {
                info!(count = records.len(); "Node pool refreshed from discovery");
                self.persist(&records).await;
                records
            },
            Err(e) => {
                warn!(error:% = e; "Node discovery failed, using fallback nodes");
                self.load_fallback_blocking().await
            },
        };

        let now = self.clock.now();
        let mut state = self.lock_state();
        state.replace(records);
        state.last_refresh = Some(now);
    }

    async fn discover(&self) -> Result<Vec<NodeRecord>, DiscoveryError> {
        let candidates = self.directory.fetch_candidates(self.settings.max_candidates).await?;
        if candidates.is_empty() {
            return Err(DiscoveryError::NoCandidates);
        }
        debug!(candidates = candidates.len(); "Probing node candidates");

        let outcomes = probe::run_probes(
            self.prober.clone(),
            candidates,
            self.settings.probe_workers,
            self.settings.probe_timeout,
            self.settings.probe_phase_timeout,
        )
        .await;

        let now = self.clock.now();
        let mut records: Vec<NodeRecord> = outcomes
            .into_iter()
            .filter(|o| o.success_rate >= self.settings.min_probe_success_rate)
            .map(|o| discovered_record(o, now))
            .collect();

        if records.is_empty() {
            return Err(DiscoveryError::NoHealthyCandidates);
        }

        selection::rank_by_weight(&mut records);
        records.truncate(self.settings.keep_top.max(1));
        Ok(records)
    }

    async fn persist(&self, records: &[NodeRecord]) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = NodeSnapshot::new(records.to_vec(), self.clock.now());

        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => debug!("Node snapshot saved"),
            Ok(Err(e)) => warn!(error:% = e; "Failed to save node snapshot"),
            Err(e) => warn!(error:% = e; "Node snapshot task failed"),
        }
    }
}

/// Clears the in-flight flag and announces completion when dropped, so the
/// flag is reset even if the refresh task panics or is cancelled.
struct RefreshGuard {
    inner: Arc<CacheInner>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.inner.lock_state().refresh_in_flight = false;
        self.inner.refresh_done.send_modify(|generation| *generation += 1);
    }
}

/// Most recent snapshot if one can be read, otherwise `fallback`.
fn read_fallback(store: Option<&SnapshotStore>, fallback: &[NodeRecord]) -> Vec<NodeRecord> {
    if let Some(store) = store {
        match store.load() {
            Ok(Some(snapshot)) if !snapshot.nodes.is_empty() => return snapshot.nodes,
            Ok(_) => {},
            Err(e) => warn!(path:% = store.path().display(), error:% = e; "Could not read node snapshot"),
        }
    }
    fallback.to_vec()
}

fn discovered_record(outcome: ProbeOutcome, now: DateTime<Utc>) -> NodeRecord {
    let name = url::Url::parse(&outcome.url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{}:{}", h, u.port_or_known_default().unwrap_or_default())))
        .unwrap_or_else(|| outcome.url.clone());

    let mut record = NodeRecord::new(name, outcome.url).with_description("Discovered node");
    record.response_time = outcome.response_time.as_secs_f64();
    record.success_rate = outcome.success_rate;
    record.last_tested = Some(now);
    record
}

pub struct NodeCacheBuilder {
    settings: NodeCacheSettings,
    directory: Arc<dyn NodeDirectory>,
    prober: Arc<dyn NodeProber>,
    clock: Arc<dyn Clock>,
    seed: Option<u64>,
    initial_nodes: Option<Vec<NodeRecord>>,
}

impl NodeCacheBuilder {
    fn new(directory: Arc<dyn NodeDirectory>, prober: Arc<dyn NodeProber>) -> Self {
        Self {
            settings: NodeCacheSettings::default(),
            directory,
            prober,
            clock: Arc::new(SystemClock),
            seed: None,
            initial_nodes: None,
        }
    }

    pub fn settings(mut self, settings: NodeCacheSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seeds the selection RNG, making picks reproducible.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Starts the pool with these records, considered fresh as of now.
    /// Takes precedence over an on-disk snapshot.
    pub fn initial_nodes(mut self, nodes: Vec<NodeRecord>) -> Self {
        self.initial_nodes = Some(nodes);
        self
    }

    pub fn build(self) -> NodeCache {
        let store = self.settings.snapshot_path.clone().map(SnapshotStore::new);
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut state = CacheState {
            records: BTreeMap::new(),
            last_refresh: None,
            refresh_in_flight: false,
            rng,
        };

        if let Some(nodes) = self.initial_nodes {
            state.replace(nodes);
            state.last_refresh = Some(self.clock.now());
        } else if let Some(store) = &store {
            match store.load() {
                Ok(Some(snapshot)) => {
                    debug!(count = snapshot.nodes.len(); "Loaded node snapshot");
                    state.last_refresh = Some(snapshot.taken_at());
                    state.replace(snapshot.nodes);
                },
                Ok(None) => {},
                Err(e) => warn!(path:% = store.path().display(), error:% = e; "Ignoring unreadable node snapshot"),
            }
        }

        let (refresh_done, _) = watch::channel(0);

        NodeCache {
            inner: Arc::new(CacheInner {
                settings: self.settings,
                state: Mutex::new(state),
                directory: self.directory,
                prober: self.prober,
                clock: self.clock,
                store,
                refresh_done,
                worker: Mutex::new(None),
            }),
        }
    }
}
