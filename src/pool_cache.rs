// src/pool_cache.rs
//
// TTL cache over externally discovered pool topology, with one in-flight
// refresh per token pair.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics;

/// Source of pool topology for a token pair (subgraph query, on-chain
/// enumeration, ...).
#[async_trait]
pub trait PoolFetcher: Send + Sync + 'static {
    type Pool: Clone + Send + Sync + 'static;

    async fn fetch_pools(
        &self,
        token_a: Address,
        token_b: Address,
    ) -> anyhow::Result<Vec<Self::Pool>>;

    fn pool_address(pool: &Self::Pool) -> Address;
}

/// Unordered token pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey(Address, Address);

impl PairKey {
    pub fn new(a: Address, b: Address) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<P> {
    pools: Vec<P>,
    expires_at: Instant,
}

type SharedRefresh<P> = Shared<BoxFuture<'static, Vec<P>>>;

struct PoolsCacheInner<F: PoolFetcher> {
    fetcher: F,
    ttl: Duration,
    cache: DashMap<PairKey, CacheEntry<F::Pool>>,
    in_flight: DashMap<PairKey, SharedRefresh<F::Pool>>,
}

pub struct PoolsCache<F: PoolFetcher> {
    inner: Arc<PoolsCacheInner<F>>,
}

impl<F: PoolFetcher> Clone for PoolsCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: PoolFetcher> PoolsCache<F> {
    pub fn new(fetcher: F, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PoolsCacheInner {
                fetcher,
                ttl,
                cache: DashMap::new(),
                in_flight: DashMap::new(),
            }),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Cached pools if fresh, otherwise the result of a refresh.
    ///
    /// With a `timeout`, returns an empty list if the refresh is still
    /// outstanding when it elapses; the refresh keeps running and fills the
    /// cache for later callers.
    pub async fn get_fresh_pools(
        &self,
        a: Address,
        b: Address,
        timeout: Option<Duration>,
    ) -> Vec<F::Pool> {
        let key = PairKey::new(a, b);
        if let Some(pools) = self.fresh_pools(&key) {
            return pools;
        }
        let refresh = self.refresh(a, b);
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, refresh).await {
                Ok(pools) => pools,
                Err(_) => {
                    debug!(?key, ?timeout, "pool refresh still outstanding, returning no pools");
                    Vec::new()
                }
            },
            None => refresh.await,
        }
    }

    /// Cached pools for the pair.
    ///
    /// `None` means unknown. Unless `ignore_expired` is set, a stale or
    /// missing entry reports `None` and schedules a background refresh.
    pub fn get_cached_pools(
        &self,
        a: Address,
        b: Address,
        ignore_expired: bool,
    ) -> Option<Vec<F::Pool>> {
        let key = PairKey::new(a, b);
        let cached = self
            .inner
            .cache
            .get(&key)
            .map(|entry| (entry.pools.clone(), entry.expires_at > Instant::now()));
        match cached {
            Some((pools, fresh)) if fresh || ignore_expired => Some(pools),
            None if ignore_expired => None,
            _ => {
                // Dropping the handle does not cancel the spawned fetch.
                drop(self.refresh(a, b));
                None
            }
        }
    }

    pub fn get_cached_addresses(
        &self,
        a: Address,
        b: Address,
        ignore_expired: bool,
    ) -> Option<Vec<Address>> {
        self.get_cached_pools(a, b, ignore_expired)
            .map(|pools| pools.iter().map(F::pool_address).collect())
    }

    pub fn is_fresh(&self, a: Address, b: Address) -> bool {
        self.fresh_pools(&PairKey::new(a, b)).is_some()
    }

    /// Stores pools discovered by other means, e.g. a bulk preload.
    pub fn cache_pools_for_pair(
        &self,
        a: Address,
        b: Address,
        pools: Vec<F::Pool>,
        ttl: Option<Duration>,
    ) {
        let expires_at = Instant::now() + ttl.unwrap_or(self.inner.ttl);
        self.inner
            .cache
            .insert(PairKey::new(a, b), CacheEntry { pools, expires_at });
    }

    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.cache.is_empty()
    }

    /// Runs `reload` now and then once per `period` on a background task.
    ///
    /// The task holds the cache weakly and stops once every handle is dropped.
    pub fn spawn_reload_loop<R, Fut>(&self, period: Duration, reload: R) -> JoinHandle<()>
    where
        R: Fn(PoolsCache<F>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<usize>> + Send + 'static,
    {
        let weak: Weak<PoolsCacheInner<F>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("pool cache dropped, stopping reload loop");
                    break;
                };
                match reload(PoolsCache { inner }).await {
                    Ok(pairs) => info!(pairs, "reloaded pools"),
                    Err(e) => warn!(error = %e, "pool reload failed"),
                }
            }
        })
    }

    fn fresh_pools(&self, key: &PairKey) -> Option<Vec<F::Pool>> {
        let now = Instant::now();
        self.inner
            .cache
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.pools.clone())
    }

    /// Joins the pair's in-flight refresh or starts one.
    ///
    /// The fetch runs on its own task, so it completes and fills the cache
    /// even if every waiter gives up.
    fn refresh(&self, a: Address, b: Address) -> SharedRefresh<F::Pool> {
        let key = PairKey::new(a, b);
        match self.inner.in_flight.entry(key) {
            Entry::Occupied(in_flight) => in_flight.get().clone(),
            Entry::Vacant(slot) => {
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let pools = match inner.fetcher.fetch_pools(a, b).await {
                        Ok(pools) => {
                            metrics::increment_pool_cache_refresh("ok");
                            debug!(?key, pools = pools.len(), "refreshed pools");
                            pools
                        }
                        Err(e) => {
                            metrics::increment_pool_cache_refresh("error");
                            warn!(?key, error = %e, "pool fetch failed, caching empty result");
                            Vec::new()
                        }
                    };
                    inner.cache.insert(
                        key,
                        CacheEntry {
                            pools: pools.clone(),
                            expires_at: Instant::now() + inner.ttl,
                        },
                    );
                    inner.in_flight.remove(&key);
                    pools
                });
                let shared = async move { task.await.unwrap_or_default() }.boxed().shared();
                slot.insert(shared.clone());
                shared
            }
        }
    }
}
