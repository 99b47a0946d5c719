//! Integration tests for the pool discovery cache
//!
//! Tests cover:
//! - Single-flight refresh per unordered pair
//! - Stale entries reported as unknown with one background refresh
//! - Primed entries

use async_trait::async_trait;
use ethers::types::Address;
use liquidity_sampler_sdk::pool_cache::{PoolFetcher, PoolsCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns one pool per pair, addressed by the sum of the token addresses' low bytes.
struct SlowFetcher {
    fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl PoolFetcher for SlowFetcher {
    type Pool = Address;

    async fn fetch_pools(
        &self,
        token_a: Address,
        token_b: Address,
    ) -> anyhow::Result<Vec<Address>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let id = token_a.to_low_u64_be() + token_b.to_low_u64_be();
        Ok(vec![Address::from_low_u64_be(id)])
    }

    fn pool_address(pool: &Address) -> Address {
        *pool
    }
}

fn cache(ttl: Duration) -> (PoolsCache<SlowFetcher>, Arc<AtomicUsize>) {
    let fetches = Arc::new(AtomicUsize::new(0));
    let cache = PoolsCache::new(SlowFetcher { fetches: fetches.clone() }, ttl);
    (cache, fetches)
}

/// Two concurrent fresh lookups fetch once
#[tokio::test(start_paused = true)]
async fn test_concurrent_lookups_fetch_once() {
    let (cache, fetches) = cache(Duration::from_secs(60));
    let (a, b) = (Address::from_low_u64_be(1), Address::from_low_u64_be(2));

    let (first, second) = tokio::join!(
        cache.get_fresh_pools(a, b, None),
        cache.get_fresh_pools(a, b, None)
    );
    assert_eq!(first, vec![Address::from_low_u64_be(3)]);
    assert_eq!(first, second);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(cache.is_fresh(b, a));
}

/// A just-expired entry reads as unknown and refreshes exactly once
#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_unknown() {
    let (cache, fetches) = cache(Duration::from_secs(60));
    let (a, b) = (Address::from_low_u64_be(1), Address::from_low_u64_be(2));
    let pool = Address::from_low_u64_be(99);
    cache.cache_pools_for_pair(a, b, vec![pool], Some(Duration::from_secs(10)));
    assert_eq!(cache.get_cached_addresses(a, b, false), Some(vec![Address::from_low_u64_be(99)]));
    assert_eq!(fetches.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(cache.get_cached_addresses(a, b, false), None);
    assert_eq!(cache.get_cached_addresses(b, a, false), None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_cached_addresses(a, b, false), Some(vec![Address::from_low_u64_be(3)]));
}

/// A timeout shorter than the fetch returns nothing
#[tokio::test(start_paused = true)]
async fn test_timeout_returns_empty() {
    let (cache, _) = cache(Duration::from_secs(60));
    let (a, b) = (Address::from_low_u64_be(5), Address::from_low_u64_be(6));
    assert!(cache
        .get_fresh_pools(a, b, Some(Duration::from_millis(50)))
        .await
        .is_empty());
    assert_eq!(cache.get_fresh_pools(a, b, None).await, vec![Address::from_low_u64_be(11)]);
}
