//! Weighted peer pools for the gateway's outbound traffic.
//!
//! Three pools exist, one per traffic category: chain queries, chunk GETs
//! and chunk POSTs. Peers accumulate weight on success and lose it on
//! failure, except operator-configured preferred peers whose weight is
//! pinned. Selection favors preferred peers unconditionally and samples the
//! rest by weight. The pools are process-scoped: a single writer population
//! (the refresher plus the success/failure reporters) and many readers that
//! always observe a consistent snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

pub mod dns;

pub use dns::DnsResolver;

pub const MIN_PEER_WEIGHT: u32 = 1;
pub const MAX_PEER_WEIGHT: u32 = 100;
pub const DEFAULT_INITIAL_WEIGHT: u32 = 50;
pub const SUCCESS_WEIGHT_DELTA: u32 = 5;
pub const FAILURE_WEIGHT_FACTOR: f64 = 0.8;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer list refresh failed: {0}")]
    Refresh(String),
}

/// The traffic category a peer pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerCategory {
    Chain,
    GetChunk,
    PostChunk,
}

impl PeerCategory {
    pub const ALL: [PeerCategory; 3] = [
        PeerCategory::Chain,
        PeerCategory::GetChunk,
        PeerCategory::PostChunk,
    ];
}

/// A peer URL with its current selection weight, `1..=100`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub url: String,
    pub weight: u32,
}

/// Supplies the source-of-truth peer list for a category, typically the
/// trusted node's `/peers` endpoint or a fixed configured set.
#[async_trait]
pub trait PeerListSource: Send + Sync {
    async fn peer_urls(&self, category: PeerCategory) -> Result<Vec<String>, PeerError>;
}

#[derive(Debug, Clone, Default)]
pub struct PeerManagerConfig {
    pub chain_peers: Vec<String>,
    pub get_chunk_peers: Vec<String>,
    pub post_chunk_peers: Vec<String>,
    pub preferred_chain_peers: Vec<String>,
    pub preferred_get_chunk_peers: Vec<String>,
    pub preferred_post_chunk_peers: Vec<String>,
}

impl PeerManagerConfig {
    fn initial_urls(&self, category: PeerCategory) -> &[String] {
        match category {
            PeerCategory::Chain => &self.chain_peers,
            PeerCategory::GetChunk => &self.get_chunk_peers,
            PeerCategory::PostChunk => &self.post_chunk_peers,
        }
    }

    fn preferred_urls(&self, category: PeerCategory) -> &[String] {
        match category {
            PeerCategory::Chain => &self.preferred_chain_peers,
            PeerCategory::GetChunk => &self.preferred_get_chunk_peers,
            PeerCategory::PostChunk => &self.preferred_post_chunk_peers,
        }
    }
}

struct Pool {
    /// url → weight. Preferred peers are members like any other.
    weights: HashMap<String, u32>,
    /// Exact-match URLs whose weight is pinned against failure decay.
    preferred: Vec<String>,
}

impl Pool {
    fn is_preferred(&self, url: &str) -> bool {
        self.preferred.iter().any(|preferred| preferred == url)
    }
}

pub struct PeerManager {
    pools: HashMap<PeerCategory, RwLock<Pool>>,
    list_source: Option<Arc<dyn PeerListSource>>,
    refresh_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    resolver: Option<Arc<DnsResolver>>,
}

impl PeerManager {
    pub fn new(config: PeerManagerConfig) -> Self {
        Self::with_list_source(config, None)
    }

    pub fn with_list_source(
        config: PeerManagerConfig,
        list_source: Option<Arc<dyn PeerListSource>>,
    ) -> Self {
        let mut pools = HashMap::new();
        for category in PeerCategory::ALL {
            let preferred: Vec<String> = config.preferred_urls(category).to_vec();
            let mut weights = HashMap::new();
            for url in config.initial_urls(category) {
                weights.insert(url.clone(), DEFAULT_INITIAL_WEIGHT);
            }
            for url in &preferred {
                weights
                    .entry(url.clone())
                    .or_insert(DEFAULT_INITIAL_WEIGHT);
            }
            pools.insert(category, RwLock::new(Pool { weights, preferred }));
        }
        Self {
            pools,
            list_source,
            refresh_task: Mutex::new(None),
            resolver: None,
        }
    }

    pub fn set_resolver(&mut self, resolver: Arc<DnsResolver>) {
        self.resolver = Some(resolver);
    }

    /// Resolves each URL's hostname now and keeps the mapping fresh on
    /// `refresh_interval`. Lookup failures never block or fail the caller;
    /// unresolved URLs are used as-is.
    pub async fn initialize_dns_resolution(
        &mut self,
        urls: Vec<String>,
        refresh_interval: Duration,
    ) {
        let resolver = DnsResolver::initialize(urls, dns::DEFAULT_LOOKUP_TIMEOUT).await;
        resolver.start_auto_refresh(refresh_interval);
        self.resolver = Some(resolver);
    }

    fn pool(&self, category: PeerCategory) -> &RwLock<Pool> {
        self.pools
            .get(&category)
            .expect("all categories exist from construction")
    }

    /// Substitutes a DNS-resolved URL when one is available; callers use
    /// this right before issuing a request.
    pub fn resolve_url(&self, url: &str) -> String {
        match &self.resolver {
            Some(resolver) => resolver.resolve(url),
            None => url.to_string(),
        }
    }

    /// Picks up to `count` peer URLs: preferred peers first (weight
    /// descending among themselves), remaining slots drawn from the others
    /// by weighted sampling without replacement.
    pub fn select_peers(&self, category: PeerCategory, count: usize) -> Vec<String> {
        let pool = self.pool(category).read().expect("pool lock poisoned");

        let mut preferred: Vec<(String, u32)> = pool
            .preferred
            .iter()
            .filter_map(|url| {
                pool.weights
                    .get(url)
                    .map(|weight| (url.clone(), *weight))
            })
            .collect();
        preferred.sort_by(|a, b| b.1.cmp(&a.1));

        let mut selected: Vec<String> = preferred
            .into_iter()
            .map(|(url, _)| url)
            .take(count)
            .collect();
        if selected.len() == count {
            return selected;
        }

        let mut candidates: Vec<(String, u32)> = pool
            .weights
            .iter()
            .filter(|(url, _)| !pool.is_preferred(url))
            .map(|(url, weight)| (url.clone(), *weight))
            .collect();
        drop(pool);

        let mut rng = rand::thread_rng();
        while selected.len() < count && !candidates.is_empty() {
            let total: u64 = candidates.iter().map(|(_, weight)| *weight as u64).sum();
            let mut ticket = rng.gen_range(0..total);
            let mut winner = candidates.len() - 1;
            for (index, (_, weight)) in candidates.iter().enumerate() {
                if ticket < *weight as u64 {
                    winner = index;
                    break;
                }
                ticket -= *weight as u64;
            }
            selected.push(candidates.swap_remove(winner).0);
        }
        selected
    }

    /// The full category population in deterministic order: preferred peers
    /// first by weight descending, then the rest by weight descending.
    /// Chunk POSTs walk this list front to back.
    pub fn sorted_peers(&self, category: PeerCategory) -> Vec<Peer> {
        let pool = self.pool(category).read().expect("pool lock poisoned");

        let mut preferred: Vec<Peer> = Vec::new();
        let mut others: Vec<Peer> = Vec::new();
        for (url, weight) in &pool.weights {
            let peer = Peer {
                url: url.clone(),
                weight: *weight,
            };
            if pool.is_preferred(url) {
                preferred.push(peer);
            } else {
                others.push(peer);
            }
        }
        preferred.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.url.cmp(&b.url)));
        others.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.url.cmp(&b.url)));
        preferred.extend(others);
        preferred
    }

    /// Additive increase, clamped to the maximum.
    pub fn report_success(&self, url: &str, category: PeerCategory) {
        let mut pool = self.pool(category).write().expect("pool lock poisoned");
        if let Some(weight) = pool.weights.get_mut(url) {
            *weight = (*weight + SUCCESS_WEIGHT_DELTA).min(MAX_PEER_WEIGHT);
        }
    }

    /// Multiplicative decrease, floored at the minimum. Preferred peers are
    /// exempt.
    pub fn report_failure(&self, url: &str, category: PeerCategory) {
        let mut pool = self.pool(category).write().expect("pool lock poisoned");
        if pool.is_preferred(url) {
            return;
        }
        if let Some(weight) = pool.weights.get_mut(url) {
            let decayed = (*weight as f64 * FAILURE_WEIGHT_FACTOR).floor() as u32;
            *weight = decayed.max(MIN_PEER_WEIGHT);
        }
    }

    pub fn peer_weight(&self, url: &str, category: PeerCategory) -> Option<u32> {
        self.pool(category)
            .read()
            .expect("pool lock poisoned")
            .weights
            .get(url)
            .copied()
    }

    /// Replaces the pool wholesale from the configured list source.
    /// Preferred peers and their weights survive; peers that persist keep
    /// their weights; new peers start at the initial weight.
    pub async fn refresh_peers(&self, category: PeerCategory) -> Result<(), PeerError> {
        let Some(source) = &self.list_source else {
            return Ok(());
        };
        let urls = source.peer_urls(category).await?;
        self.apply_peer_list(category, urls);
        Ok(())
    }

    fn apply_peer_list(&self, category: PeerCategory, urls: Vec<String>) {
        let mut pool = self.pool(category).write().expect("pool lock poisoned");
        let mut weights = HashMap::with_capacity(urls.len() + pool.preferred.len());
        for url in urls {
            let weight = pool
                .weights
                .get(&url)
                .copied()
                .unwrap_or(DEFAULT_INITIAL_WEIGHT);
            weights.insert(url, weight);
        }
        for url in &pool.preferred {
            let weight = pool
                .weights
                .get(url)
                .copied()
                .unwrap_or(DEFAULT_INITIAL_WEIGHT);
            weights.insert(url.clone(), weight);
        }
        pool.weights = weights;
    }

    /// Starts a background task refreshing every category on `interval`.
    pub fn start_auto_refresh(self: &Arc<Self>, interval: Duration) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, construction
            // already populated the pools.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for category in PeerCategory::ALL {
                    if let Err(err) = manager.refresh_peers(category).await {
                        warn!(?category, error = %err, "peer refresh failed");
                    } else {
                        debug!(?category, "peer list refreshed");
                    }
                }
            }
        });
        let mut task = self.refresh_task.lock().expect("task lock poisoned");
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self
            .refresh_task
            .lock()
            .expect("task lock poisoned")
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        self.stop_auto_refresh();
        if let Some(resolver) = &self.resolver {
            resolver.stop_auto_refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(
        post_peers: &[(&str, u32)],
        preferred: &[&str],
    ) -> PeerManager {
        let config = PeerManagerConfig {
            post_chunk_peers: post_peers.iter().map(|(url, _)| url.to_string()).collect(),
            preferred_post_chunk_peers: preferred.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let manager = PeerManager::new(config);
        // Pin the starting weights the scenario asks for.
        {
            let mut pool = manager
                .pool(PeerCategory::PostChunk)
                .write()
                .unwrap();
            for (url, weight) in post_peers {
                pool.weights.insert(url.to_string(), *weight);
            }
        }
        manager
    }

    #[test]
    fn preferred_peers_sort_first_by_weight() {
        let manager = manager_with(
            &[("P1", 10), ("R1", 100), ("P2", 50), ("R2", 80), ("R3", 90)],
            &["P1", "P2"],
        );
        let sorted: Vec<String> = manager
            .sorted_peers(PeerCategory::PostChunk)
            .into_iter()
            .map(|peer| peer.url)
            .collect();
        assert_eq!(sorted, vec!["P2", "P1", "R1", "R3", "R2"]);
    }

    #[test]
    fn preferred_peers_never_decay() {
        let manager = manager_with(
            &[("P1", 10), ("R1", 100), ("P2", 50), ("R2", 80), ("R3", 90)],
            &["P1", "P2"],
        );
        for _ in 0..10 {
            manager.report_failure("P1", PeerCategory::PostChunk);
        }
        assert_eq!(manager.peer_weight("P1", PeerCategory::PostChunk), Some(10));
    }

    #[test]
    fn failures_strictly_reduce_normal_peer_weight() {
        let manager = manager_with(&[("R1", 100)], &[]);
        manager.report_failure("R1", PeerCategory::PostChunk);
        let after_one = manager.peer_weight("R1", PeerCategory::PostChunk).unwrap();
        assert!(after_one < 100);
        for _ in 0..50 {
            manager.report_failure("R1", PeerCategory::PostChunk);
        }
        assert_eq!(
            manager.peer_weight("R1", PeerCategory::PostChunk),
            Some(MIN_PEER_WEIGHT)
        );
    }

    #[test]
    fn success_is_additive_and_clamped() {
        let manager = manager_with(&[("R1", 97), ("P1", 98)], &["P1"]);
        manager.report_success("R1", PeerCategory::PostChunk);
        assert_eq!(
            manager.peer_weight("R1", PeerCategory::PostChunk),
            Some(MAX_PEER_WEIGHT)
        );
        manager.report_success("P1", PeerCategory::PostChunk);
        assert_eq!(
            manager.peer_weight("P1", PeerCategory::PostChunk),
            Some(MAX_PEER_WEIGHT)
        );
    }

    #[test]
    fn select_peers_lists_preferred_first() {
        let manager = manager_with(
            &[("P1", 10), ("R1", 100), ("P2", 50), ("R2", 80), ("R3", 90)],
            &["P1", "P2"],
        );
        for _ in 0..20 {
            let selected = manager.select_peers(PeerCategory::PostChunk, 3);
            assert_eq!(selected.len(), 3);
            assert_eq!(selected[0], "P2");
            assert_eq!(selected[1], "P1");
            assert!(["R1", "R2", "R3"].contains(&selected[2].as_str()));
        }
    }

    #[test]
    fn select_peers_without_replacement() {
        let manager = manager_with(&[("R1", 100), ("R2", 80), ("R3", 90)], &[]);
        for _ in 0..20 {
            let mut selected = manager.select_peers(PeerCategory::PostChunk, 3);
            selected.sort();
            assert_eq!(selected, vec!["R1", "R2", "R3"]);
        }
    }

    #[test]
    fn selection_count_is_bounded_by_population() {
        let manager = manager_with(&[("R1", 100)], &[]);
        assert_eq!(
            manager.select_peers(PeerCategory::PostChunk, 5),
            vec!["R1"]
        );
        assert!(manager.select_peers(PeerCategory::Chain, 5).is_empty());
    }

    struct FixedListSource(Vec<String>);

    #[async_trait]
    impl PeerListSource for FixedListSource {
        async fn peer_urls(&self, _category: PeerCategory) -> Result<Vec<String>, PeerError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn refresh_replaces_pool_but_preserves_preferred() {
        let config = PeerManagerConfig {
            get_chunk_peers: vec!["old".into(), "kept".into()],
            preferred_get_chunk_peers: vec!["pinned".into()],
            ..Default::default()
        };
        let source = Arc::new(FixedListSource(vec!["kept".into(), "new".into()]));
        let manager = PeerManager::with_list_source(config, Some(source));

        manager.report_success("kept", PeerCategory::GetChunk);
        manager.report_failure("pinned", PeerCategory::GetChunk);
        let kept_weight = manager.peer_weight("kept", PeerCategory::GetChunk).unwrap();

        manager.refresh_peers(PeerCategory::GetChunk).await.unwrap();

        assert_eq!(manager.peer_weight("old", PeerCategory::GetChunk), None);
        assert_eq!(
            manager.peer_weight("kept", PeerCategory::GetChunk),
            Some(kept_weight)
        );
        assert_eq!(
            manager.peer_weight("new", PeerCategory::GetChunk),
            Some(DEFAULT_INITIAL_WEIGHT)
        );
        assert_eq!(
            manager.peer_weight("pinned", PeerCategory::GetChunk),
            Some(DEFAULT_INITIAL_WEIGHT)
        );
    }
}
