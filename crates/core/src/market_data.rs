//! Cached market data access.
//!
//! Snapshots are cached per chain id for a fixed TTL. Each chain id has one
//! async lock that is held for the duration of a refetch, so concurrent
//! callers share a single in-flight fetch. A failed fetch never poisons the
//! cache: the caller receives either the last cached (stale) snapshot or the
//! hardcoded fallback, together with a `MarketDataUnavailable` warning.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use looper_api::{fallback_snapshot, Asset, MarketDataFetcher, MarketSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::MarketConfig;
use crate::error::LoopError;

/// Where a returned snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnapshotSource {
    /// Served from cache within TTL
    Cached,
    /// Fetched by this call (or the in-flight fetch it joined)
    Fresh,
    /// Expired cache entry served because the refetch failed
    Stale,
    /// Hardcoded fallback, never cached
    Fallback,
}

/// Snapshot handed to callers.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub snapshot: Arc<MarketSnapshot>,
    pub source: SnapshotSource,
    /// Set when the data is stale or the fallback
    pub warning: Option<LoopError>,
}

impl MarketData {
    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }
}

/// Cache entry.
#[derive(Debug, Clone)]
struct SnapshotCache {
    snapshot: Arc<MarketSnapshot>,
    cached_at: DateTime<Utc>,
}

impl SnapshotCache {
    fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        // A clock that moved backwards counts as zero age.
        let age = (now - self.cached_at).to_std().unwrap_or(Duration::ZERO);
        age < ttl
    }
}

#[derive(Debug, Default)]
struct SlotState {
    cached: Option<SnapshotCache>,
    /// Outcome of the most recent failed fetch, shared with callers that
    /// were waiting on it
    last_failure: Option<MarketData>,
}

#[derive(Debug, Default)]
struct Slot {
    /// Completed fetch attempts
    attempts: AtomicU64,
    state: Mutex<SlotState>,
}

/// Market data provider with per-chain caching.
pub struct MarketDataProvider {
    fetcher: Arc<dyn MarketDataFetcher>,
    clock: Arc<dyn Clock>,
    slots: DashMap<u64, Arc<Slot>>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
    serve_stale: bool,
}

impl std::fmt::Debug for MarketDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataProvider")
            .field("fetcher", &self.fetcher.name())
            .field("chains", &self.slots.len())
            .field("cache_ttl", &self.cache_ttl)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("serve_stale", &self.serve_stale)
            .finish()
    }
}

impl MarketDataProvider {
    /// Create a provider using the wall clock and default cache settings.
    pub fn new(fetcher: Arc<dyn MarketDataFetcher>) -> Self {
        Self::from_config(fetcher, &MarketConfig::default())
    }

    pub fn from_config(fetcher: Arc<dyn MarketDataFetcher>, config: &MarketConfig) -> Self {
        Self {
            fetcher,
            clock: Arc::new(SystemClock),
            slots: DashMap::new(),
            cache_ttl: config.cache_ttl(),
            fetch_timeout: config.fetch_timeout(),
            serve_stale: config.serve_stale_on_failure,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Serve an expired snapshot instead of the fallback when a refetch fails.
    pub fn with_serve_stale(mut self, serve_stale: bool) -> Self {
        self.serve_stale = serve_stale;
        self
    }

    fn slot(&self, chain_id: u64) -> Arc<Slot> {
        self.slots.entry(chain_id).or_default().value().clone()
    }

    /// Snapshot for `chain_id`. Never fails; degraded responses carry a warning.
    #[instrument(skip(self))]
    pub async fn get_snapshot(&self, chain_id: u64) -> MarketData {
        let slot = self.slot(chain_id);
        let seen = slot.attempts.load(Ordering::Acquire);
        let mut state = slot.state.lock().await;

        if let Some(entry) = &state.cached {
            if entry.is_fresh(self.clock.now(), self.cache_ttl) {
                debug!(chain_id, "Market snapshot cache hit");
                return MarketData {
                    snapshot: Arc::clone(&entry.snapshot),
                    source: SnapshotSource::Cached,
                    warning: None,
                };
            }
        }

        // A fetch completed while we waited for the lock and it failed.
        if slot.attempts.load(Ordering::Acquire) != seen {
            if let Some(outcome) = &state.last_failure {
                return outcome.clone();
            }
        }

        let result = self.fetch(chain_id).await;
        slot.attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                state.cached = Some(SnapshotCache {
                    snapshot: Arc::clone(&snapshot),
                    cached_at: self.clock.now(),
                });
                state.last_failure = None;

                debug!(
                    chain_id,
                    fetcher = self.fetcher.name(),
                    assets = snapshot.assets.len(),
                    "Market snapshot refreshed"
                );

                MarketData {
                    snapshot,
                    source: SnapshotSource::Fresh,
                    warning: None,
                }
            }
            Err(reason) => {
                let warning = LoopError::MarketDataUnavailable {
                    chain_id,
                    reason: reason.clone(),
                };

                let outcome = match (&state.cached, self.serve_stale) {
                    (Some(entry), true) => {
                        warn!(
                            chain_id,
                            %reason,
                            cached_at = %entry.cached_at,
                            "Market data fetch failed, serving stale snapshot"
                        );
                        MarketData {
                            snapshot: Arc::clone(&entry.snapshot),
                            source: SnapshotSource::Stale,
                            warning: Some(warning),
                        }
                    }
                    _ => {
                        warn!(chain_id, %reason, "Market data fetch failed, using fallback data");
                        MarketData {
                            snapshot: Arc::new(fallback_snapshot(chain_id, self.clock.now())),
                            source: SnapshotSource::Fallback,
                            warning: Some(warning),
                        }
                    }
                };

                state.last_failure = Some(outcome.clone());
                outcome
            }
        }
    }

    /// Look up one asset in the current snapshot for `chain_id`.
    pub async fn get_asset(&self, symbol: &str, chain_id: u64) -> Result<Asset, LoopError> {
        let data = self.get_snapshot(chain_id).await;
        data.snapshot
            .asset(symbol)
            .cloned()
            .ok_or_else(|| LoopError::AssetNotFound {
                symbol: symbol.to_string(),
                chain_id,
            })
    }

    /// Drop the cached snapshot for `chain_id`.
    ///
    /// Waits for an in-flight fetch on that chain to finish. The slot and its
    /// lock stay in place, so later callers still queue behind one fetch.
    pub async fn invalidate(&self, chain_id: u64) {
        let Some(slot) = self.slots.get(&chain_id).map(|s| s.value().clone()) else {
            return;
        };
        let mut state = slot.state.lock().await;
        state.cached = None;
        state.last_failure = None;
        debug!(chain_id, "Market snapshot cache invalidated");
    }

    async fn fetch(&self, chain_id: u64) -> Result<MarketSnapshot, String> {
        let fetch = self.fetcher.fetch(chain_id);
        let snapshot = match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => return Err(format!("{:#}", e)),
            Err(_) => {
                return Err(format!(
                    "{} timed out after {:?}",
                    self.fetcher.name(),
                    self.fetch_timeout
                ))
            }
        };

        if snapshot.chain_id != chain_id {
            return Err(format!(
                "{} returned data for chain {}",
                self.fetcher.name(),
                snapshot.chain_id
            ));
        }
        snapshot.validate().map_err(|e| format!("{:#}", e))?;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::future::join_all;
    use looper_api::StaticMarketFetcher;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Debug, Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingFetcher {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MarketDataFetcher for CountingFetcher {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch(&self, chain_id: u64) -> Result<MarketSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("subgraph unreachable");
            }
            StaticMarketFetcher::new().fetch(chain_id).await
        }
    }

    fn provider(fetcher: &Arc<CountingFetcher>, clock: &Arc<ManualClock>) -> MarketDataProvider {
        let fetcher: Arc<dyn MarketDataFetcher> = fetcher.clone();
        let clock: Arc<dyn Clock> = clock.clone();
        MarketDataProvider::new(fetcher).with_clock(clock)
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let first = provider.get_snapshot(1).await;
        assert_eq!(first.source, SnapshotSource::Fresh);

        clock.advance(Duration::from_secs(29));
        let second = provider.get_snapshot(1).await;
        assert_eq!(second.source, SnapshotSource::Cached);
        assert!(Arc::ptr_eq(&first.snapshot, &second.snapshot));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_refetch_after_ttl() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let first = provider.get_snapshot(1).await;
        clock.advance(Duration::from_secs(30));
        let second = provider.get_snapshot(1).await;

        assert_eq!(second.source, SnapshotSource::Fresh);
        assert!(!Arc::ptr_eq(&first.snapshot, &second.snapshot));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_chains_cached_separately() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        assert_eq!(provider.get_snapshot(1).await.snapshot.chain_id, 1);
        assert_eq!(provider.get_snapshot(137).await.snapshot.chain_id, 137);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_fetch() {
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(50)));
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let results = join_all((0..10).map(|_| provider.get_snapshot(1))).await;

        assert_eq!(fetcher.calls(), 1);
        let fresh = results.iter().filter(|r| r.source == SnapshotSource::Fresh).count();
        assert_eq!(fresh, 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(&r.snapshot, &results[0].snapshot)));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_failure() {
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(50)));
        fetcher.set_failing(true);
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let results = join_all((0..5).map(|_| provider.get_snapshot(1))).await;

        assert_eq!(fetcher.calls(), 1);
        assert!(results.iter().all(|r| r.source == SnapshotSource::Fallback));
    }

    #[tokio::test]
    async fn test_fallback_not_cached() {
        let fetcher = Arc::new(CountingFetcher::default());
        fetcher.set_failing(true);
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let data = provider.get_snapshot(1).await;
        assert_eq!(data.source, SnapshotSource::Fallback);
        assert_eq!(data.snapshot.symbols(), vec!["ETH", "USDC"]);
        assert!(matches!(
            data.warning,
            Some(LoopError::MarketDataUnavailable { chain_id: 1, .. })
        ));

        let again = provider.get_snapshot(1).await;
        assert_eq!(again.source, SnapshotSource::Fallback);
        assert_eq!(fetcher.calls(), 2);

        fetcher.set_failing(false);
        let recovered = provider.get_snapshot(1).await;
        assert_eq!(recovered.source, SnapshotSource::Fresh);
        assert!(recovered.warning.is_none());
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_stale_served_on_failure() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let first = provider.get_snapshot(1).await;
        clock.advance(Duration::from_secs(31));
        fetcher.set_failing(true);

        let stale = provider.get_snapshot(1).await;
        assert_eq!(stale.source, SnapshotSource::Stale);
        assert!(stale.is_degraded());
        assert!(Arc::ptr_eq(&first.snapshot, &stale.snapshot));
    }

    #[tokio::test]
    async fn test_stale_disabled_uses_fallback() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock).with_serve_stale(false);

        provider.get_snapshot(1).await;
        clock.advance(Duration::from_secs(31));
        fetcher.set_failing(true);

        assert_eq!(provider.get_snapshot(1).await.source, SnapshotSource::Fallback);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(500)));
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock).with_fetch_timeout(Duration::from_millis(20));

        let data = provider.get_snapshot(1).await;
        assert_eq!(data.source, SnapshotSource::Fallback);
        match data.warning {
            Some(LoopError::MarketDataUnavailable { reason, .. }) => {
                assert!(reason.contains("timed out"), "{reason}")
            }
            other => panic!("unexpected warning {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_asset_and_invalidate() {
        let fetcher = Arc::new(CountingFetcher::default());
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let wbtc = provider.get_asset("WBTC", 1).await.unwrap();
        assert_eq!(wbtc.price, 40_000.0);

        let err = provider.get_asset("DOGE", 1).await.unwrap_err();
        assert_eq!(
            err,
            LoopError::AssetNotFound {
                symbol: "DOGE".to_string(),
                chain_id: 1
            }
        );
        assert_eq!(fetcher.calls(), 1);

        provider.invalidate(1).await;
        provider.get_snapshot(1).await;
        assert_eq!(fetcher.calls(), 2);

        // Unknown chain is a no-op
        provider.invalidate(999).await;
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_keeps_single_flight() {
        let fetcher = Arc::new(CountingFetcher::with_delay(Duration::from_millis(100)));
        let clock = Arc::new(ManualClock::default());
        let provider = provider(&fetcher, &clock);

        let (first, (), second) = tokio::join!(
            provider.get_snapshot(1),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                provider.invalidate(1).await;
            },
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                provider.get_snapshot(1).await
            }
        );

        assert_eq!(fetcher.max_in_flight(), 1);
        assert_eq!(first.source, SnapshotSource::Fresh);
        // The invalidation cleared the first result, so the later caller refetched.
        assert_eq!(second.source, SnapshotSource::Fresh);
        assert_eq!(fetcher.calls(), 2);
    }
}
