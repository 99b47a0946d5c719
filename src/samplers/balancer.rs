use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Chain, U256};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::errors::{SamplerError, SamplerResult};
use crate::pool_cache::{PairKey, PoolFetcher, PoolsCache};
use crate::source_sampler::{QuoteCall, QuoteStrategy};
use crate::types::conversions::{address_to_string, string_to_address};
use crate::types::{FillData, Side, Source};

pub const DEFAULT_BALANCER_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/balancer-labs/balancer";

/// How often the top pools are reloaded from the subgraph.
pub const TOP_POOLS_RELOAD_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const POOLS_FOR_PAIR_QUERY: &str = r#"
query ($tokens: [Bytes!]) {
  pools(first: 1000, where: { tokensList_contains: $tokens, publicSwap: true, liquidity_gt: 0 }) {
    id
    tokens { address balance }
  }
}"#;

const TOP_POOLS_QUERY: &str = r#"
query ($first: Int) {
  pools(first: $first, where: { publicSwap: true, liquidity_gt: 0 }, orderBy: swapsCount, orderDirection: desc) {
    id
    tokens { address balance }
  }
}"#;

/// A Balancer pool with its balances of one token pair.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerPool {
    pub address: Address,
    pub balances: [(Address, f64); 2],
}

impl BalancerPool {
    pub fn balance_of(&self, token: Address) -> Option<f64> {
        self.balances
            .iter()
            .find(|(address, _)| *address == token)
            .map(|(_, balance)| *balance)
    }

    /// Product of both balances. Independent of swap direction.
    fn depth(&self) -> f64 {
        self.balances[0].1 * self.balances[1].1
    }
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<PoolsData>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PoolsData {
    pools: Vec<SubgraphPool>,
}

#[derive(Debug, Deserialize)]
struct SubgraphPool {
    id: String,
    tokens: Vec<SubgraphToken>,
}

#[derive(Debug, Deserialize)]
struct SubgraphToken {
    address: String,
    balance: String,
}

impl SubgraphPool {
    fn balance_of(&self, token: Address) -> Option<f64> {
        self.tokens
            .iter()
            .find(|t| string_to_address(&t.address).map_or(false, |address| address == token))
            .map(|t| t.balance.parse().unwrap_or(0.0))
    }

    fn for_pair(&self, a: Address, b: Address) -> Option<BalancerPool> {
        Some(BalancerPool {
            address: string_to_address(&self.id).ok()?,
            balances: [(a, self.balance_of(a)?), (b, self.balance_of(b)?)],
        })
    }

    fn token_addresses(&self) -> Vec<Address> {
        self.tokens
            .iter()
            .filter_map(|t| string_to_address(&t.address).ok())
            .collect()
    }

    fn pair_views(&self) -> Vec<BalancerPool> {
        let tokens = self.token_addresses();
        let mut views = Vec::new();
        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i + 1..] {
                views.extend(self.for_pair(*a, *b));
            }
        }
        views
    }
}

/// Balancer v1 pool discovery through the subgraph.
pub struct BalancerSubgraphFetcher {
    client: reqwest::Client,
    url: String,
    max_pools: usize,
}

impl BalancerSubgraphFetcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>, max_pools: usize) -> Self {
        Self {
            client,
            url: url.into(),
            max_pools,
        }
    }

    async fn query(&self, query: &str, variables: serde_json::Value) -> Result<Vec<SubgraphPool>> {
        let response: GraphResponse = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.errors.is_empty() {
            bail!("subgraph returned errors: {:?}", response.errors);
        }
        Ok(response.data.map(|data| data.pools).unwrap_or_default())
    }

    /// Most traded pools, once for every unordered token pair each pool
    /// supports.
    pub async fn fetch_top_pools(&self, first: usize) -> Result<Vec<BalancerPool>> {
        let pools = self.query(TOP_POOLS_QUERY, json!({ "first": first })).await?;
        Ok(pools.iter().flat_map(SubgraphPool::pair_views).collect())
    }
}

#[async_trait]
impl PoolFetcher for BalancerSubgraphFetcher {
    type Pool = BalancerPool;

    async fn fetch_pools(&self, taker: Address, maker: Address) -> Result<Vec<BalancerPool>> {
        let tokens = vec![address_to_string(taker), address_to_string(maker)];
        let pools = self.query(POOLS_FOR_PAIR_QUERY, json!({ "tokens": tokens })).await?;
        Ok(select_best_pools(
            pools.iter().filter_map(|pool| pool.for_pair(taker, maker)).collect(),
            self.max_pools,
        ))
    }

    fn pool_address(pool: &BalancerPool) -> Address {
        pool.address
    }
}

/// Deepest `max_pools` pools by the product of the pair's balances.
fn select_best_pools(mut pools: Vec<BalancerPool>, max_pools: usize) -> Vec<BalancerPool> {
    pools.sort_by(|a, b| b.depth().total_cmp(&a.depth()));
    pools.truncate(max_pools);
    pools
}

/// Groups pair views by unordered pair, dropping repeated pools.
fn group_by_pair(pools: Vec<BalancerPool>) -> HashMap<(Address, Address), Vec<BalancerPool>> {
    let mut by_pair: HashMap<PairKey, ((Address, Address), Vec<BalancerPool>)> = HashMap::new();
    for pool in pools {
        let (a, b) = (pool.balances[0].0, pool.balances[1].0);
        let entry = by_pair
            .entry(PairKey::new(a, b))
            .or_insert_with(|| ((a, b), Vec::new()));
        if !entry.1.iter().any(|existing| existing.address == pool.address) {
            entry.1.push(pool);
        }
    }
    by_pair.into_values().collect()
}

/// Fills `cache` with the subgraph's top pools, grouped per token pair.
pub async fn preload_top_pools(
    cache: &PoolsCache<BalancerSubgraphFetcher>,
    first: usize,
) -> Result<usize> {
    let top = cache.fetcher().fetch_top_pools(first).await?;
    let by_pair = group_by_pair(top);
    let pairs = by_pair.len();
    for ((a, b), pools) in by_pair {
        let pools = select_best_pools(pools, cache.fetcher().max_pools);
        cache.cache_pools_for_pair(a, b, pools, None);
    }
    info!("[Balancer] preloaded pools for {} token pairs", pairs);
    Ok(pairs)
}

/// Preloads the top `first` pools now and again every `period`.
pub fn spawn_top_pools_reload(
    cache: &PoolsCache<BalancerSubgraphFetcher>,
    first: usize,
    period: Duration,
) -> JoinHandle<()> {
    cache.spawn_reload_loop(period, move |cache| async move {
        preload_top_pools(&cache, first).await
    })
}

/// Quotes every cached Balancer pool for a direct token pair.
pub struct BalancerQuotes {
    pools: PoolsCache<BalancerSubgraphFetcher>,
}

impl BalancerQuotes {
    /// # Errors
    ///
    /// `SamplerError::Configuration` outside mainnet.
    pub fn new(chain: Chain, pools: PoolsCache<BalancerSubgraphFetcher>) -> SamplerResult<Self> {
        if chain != Chain::Mainnet {
            return Err(SamplerError::Configuration(format!(
                "Balancer is only available on {}, not {}",
                Chain::Mainnet,
                chain
            )));
        }
        Ok(Self { pools })
    }

    pub fn pools(&self) -> &PoolsCache<BalancerSubgraphFetcher> {
        &self.pools
    }
}

impl QuoteStrategy for BalancerQuotes {
    fn source(&self) -> Source {
        Source::Balancer
    }

    fn can_handle(&self, token_path: &[Address]) -> bool {
        let [taker, maker] = token_path else {
            return false;
        };
        matches!(
            self.pools.get_cached_addresses(*taker, *maker, false),
            Some(pools) if !pools.is_empty()
        )
    }

    fn quote_calls(
        &self,
        side: Side,
        token_path: &[Address],
        amounts: &[U256],
    ) -> SamplerResult<Vec<QuoteCall>> {
        let [taker, maker] = token_path else {
            return Ok(Vec::new());
        };
        let function = match side {
            Side::Sell => "sampleSellsFromBalancer",
            Side::Buy => "sampleBuysFromBalancer",
        };
        let pools = self
            .pools
            .get_cached_addresses(*taker, *maker, true)
            .unwrap_or_default();
        debug!("[Balancer] quoting {} pool(s) for {:?} -> {:?}", pools.len(), taker, maker);
        Ok(pools
            .into_iter()
            .map(|pool| QuoteCall {
                function,
                args: vec![
                    Token::Address(pool),
                    Token::Address(*taker),
                    Token::Address(*maker),
                    Token::Array(amounts.iter().copied().map(Token::Uint).collect()),
                ],
                fill_data: FillData::Balancer { pool_address: pool },
                gas: None,
            })
            .collect())
    }
}
