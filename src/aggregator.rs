// src/aggregator.rs
//
// Fans a token pair out over every registered source and path, and derives
// median sell rates from the result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ethers::types::{Address, Chain, U256};
use futures::future::join_all;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::call_channel::CallChannel;
use crate::contract_helper::ContractHelper;
use crate::contracts::erc20_bridge_sampler_abi;
use crate::errors::{SamplerError, SamplerResult};
use crate::metrics;
use crate::pool_cache::PoolsCache;
use crate::samplers::balancer::{
    spawn_top_pools_reload, BalancerQuotes, BalancerSubgraphFetcher, TOP_POOLS_RELOAD_INTERVAL,
};
use crate::samplers::uniswap_v2::{is_uniswap_v2_fork, UniswapV2Quotes};
use crate::settings::Settings;
use crate::source_sampler::{OnChainSampler, SourceSampler};
use crate::token_graph::TokenAdjacencyGraph;
use crate::two_hop::TwoHopComposer;
use crate::types::conversions::ratio;
use crate::types::{DexSample, Side, Source};

pub const DEFAULT_PRICE_CACHE_AGE: Duration = Duration::from_secs(10);

/// Everything a sampler needs at construction.
#[derive(Clone)]
pub struct SamplerContext {
    pub chain: Chain,
    /// Targets the sampler contract.
    pub helper: ContractHelper,
    pub max_cache_age: Duration,
    pub http: reqwest::Client,
    pub pool_ttl: Duration,
    pub balancer_subgraph_url: String,
    pub max_pools_fetched: usize,
    pub top_pools_fetched: usize,
}

impl SamplerContext {
    pub fn from_settings(settings: &Settings, helper: ContractHelper) -> SamplerResult<Self> {
        Ok(Self {
            chain: settings.chain()?,
            helper,
            max_cache_age: settings.sampler_max_cache_age(),
            http: reqwest::Client::new(),
            pool_ttl: settings.pool_ttl(),
            balancer_subgraph_url: settings.pool_cache.balancer_subgraph_url.clone(),
            max_pools_fetched: settings.pool_cache.max_pools_fetched,
            top_pools_fetched: settings.pool_cache.top_pools_fetched,
        })
    }
}

/// Builds the sampler for `source`.
///
/// # Errors
///
/// `SamplerError::Configuration` if the source has no venue on the network,
/// or if this crate has no sampler for it.
pub fn create_source_sampler(
    source: Source,
    ctx: &SamplerContext,
) -> SamplerResult<Arc<dyn SourceSampler>> {
    if is_uniswap_v2_fork(source) {
        let quotes = UniswapV2Quotes::new(ctx.chain, source)?;
        let sampler =
            OnChainSampler::new(quotes, ctx.helper.clone()).with_max_cache_age(ctx.max_cache_age);
        return Ok(Arc::new(sampler));
    }
    match source {
        Source::Balancer => {
            let fetcher = BalancerSubgraphFetcher::new(
                ctx.http.clone(),
                ctx.balancer_subgraph_url.clone(),
                ctx.max_pools_fetched,
            );
            let pools = PoolsCache::new(fetcher, ctx.pool_ttl);
            let quotes = BalancerQuotes::new(ctx.chain, pools.clone())?;
            if ctx.top_pools_fetched > 0 {
                spawn_balancer_preload(pools, ctx.top_pools_fetched);
            }
            let sampler = OnChainSampler::new(quotes, ctx.helper.clone())
                .with_max_cache_age(ctx.max_cache_age);
            Ok(Arc::new(sampler))
        }
        _ => Err(SamplerError::Configuration(format!(
            "I don't know how to create sampler for source {}",
            source
        ))),
    }
}

fn spawn_balancer_preload(pools: PoolsCache<BalancerSubgraphFetcher>, first: usize) {
    if tokio::runtime::Handle::try_current().is_err() {
        debug!("[Aggregator] no runtime, skipping Balancer pool preload");
        return;
    }
    spawn_top_pools_reload(&pools, first, TOP_POOLS_RELOAD_INTERVAL);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PriceKey {
    taker: Address,
    maker: Address,
    amount: U256,
    sources: Vec<Source>,
}

#[derive(Debug, Clone, Copy)]
struct CachedRate {
    rate: Decimal,
    cached_at: Instant,
}

/// Samples every registered source over every candidate path of a pair.
pub struct SamplerAggregator {
    samplers: BTreeMap<Source, Arc<dyn SourceSampler>>,
    token_graph: TokenAdjacencyGraph,
    two_hop: TwoHopComposer,
    price_cache: DashMap<PriceKey, CachedRate>,
    max_price_cache_age: Duration,
}

impl SamplerAggregator {
    /// A later sampler for the same source replaces an earlier one.
    pub fn new(
        samplers: Vec<Arc<dyn SourceSampler>>,
        token_graph: TokenAdjacencyGraph,
        two_hop: TwoHopComposer,
    ) -> Self {
        Self {
            samplers: samplers.into_iter().map(|s| (s.source(), s)).collect(),
            token_graph,
            two_hop,
            price_cache: DashMap::new(),
            max_price_cache_age: DEFAULT_PRICE_CACHE_AGE,
        }
    }

    pub fn with_max_price_cache_age(mut self, max_age: Duration) -> Self {
        self.max_price_cache_age = max_age;
        self
    }

    /// Builds one sampler per configured source. Must be called from within a
    /// tokio runtime when Balancer is enabled.
    ///
    /// # Errors
    ///
    /// Fails eagerly on the first source that cannot be constructed.
    pub fn from_settings(settings: &Settings, channel: CallChannel) -> SamplerResult<Self> {
        let chain = settings.chain()?;
        let abi = erc20_bridge_sampler_abi()
            .map_err(|e| SamplerError::Configuration(format!("sampler ABI: {}", e)))?;
        let helper = ContractHelper::new(channel, abi, settings.sampler_deployment()?);
        let ctx = SamplerContext::from_settings(settings, helper.clone())?;

        let samplers = settings
            .sampler
            .sources
            .iter()
            .map(|source| create_source_sampler(*source, &ctx))
            .collect::<SamplerResult<Vec<_>>>()?;
        info!(
            "[Aggregator] {} sources enabled on {}: {:?}",
            samplers.len(),
            chain,
            settings.sampler.sources
        );

        let two_hop =
            TwoHopComposer::new(helper).with_default_call_gas(settings.channel.default_call_gas);
        Ok(Self::new(samplers, settings.token_graph(chain)?, two_hop)
            .with_max_price_cache_age(settings.max_price_cache_age()))
    }

    pub fn available_sources(&self) -> Vec<Source> {
        self.samplers.keys().copied().collect()
    }

    pub fn token_graph(&self) -> &TokenAdjacencyGraph {
        &self.token_graph
    }

    /// The direct path followed by one path per shared intermediate token.
    pub fn token_paths(&self, taker: Address, maker: Address) -> Vec<Vec<Address>> {
        let mut paths = vec![vec![taker, maker]];
        paths.extend(
            self.token_graph
                .intermediate_tokens(&taker, &maker)
                .into_iter()
                .map(|intermediate| vec![taker, intermediate, maker]),
        );
        paths
    }

    /// Requested sources that are registered, in request order. Unregistered
    /// sources are skipped.
    fn select(&self, sources: &[Source]) -> Vec<Arc<dyn SourceSampler>> {
        let mut selected: Vec<Arc<dyn SourceSampler>> = Vec::new();
        for source in sources {
            match self.samplers.get(source) {
                Some(sampler) if !selected.iter().any(|s| s.source() == *source) => {
                    selected.push(Arc::clone(sampler))
                }
                Some(_) => {}
                None => debug!("[Aggregator] source {} is not enabled", source),
            }
        }
        selected
    }

    /// One sample list per (source, path, venue) that produced anything.
    pub async fn sample_sells(
        &self,
        sources: &[Source],
        taker: Address,
        maker: Address,
        input_amounts: &[U256],
    ) -> Vec<Vec<DexSample>> {
        self.sample(Side::Sell, sources, taker, maker, input_amounts).await
    }

    pub async fn sample_buys(
        &self,
        sources: &[Source],
        taker: Address,
        maker: Address,
        output_amounts: &[U256],
    ) -> Vec<Vec<DexSample>> {
        self.sample(Side::Buy, sources, taker, maker, output_amounts).await
    }

    async fn sample(
        &self,
        side: Side,
        sources: &[Source],
        taker: Address,
        maker: Address,
        amounts: &[U256],
    ) -> Vec<Vec<DexSample>> {
        if amounts.iter().all(U256::is_zero) {
            return Vec::new();
        }
        let samplers = self.select(sources);
        let paths = self.token_paths(taker, maker);

        let branches = samplers.iter().flat_map(|sampler| {
            paths
                .iter()
                .filter(move |path| sampler.can_handle(path))
                .map(move |path| async move {
                    let result = match side {
                        Side::Sell => sampler.sample_sells(path, amounts).await,
                        Side::Buy => sampler.sample_buys(path, amounts).await,
                    };
                    match result {
                        Ok(venues) => venues,
                        Err(e) => {
                            warn!("[Aggregator] {} failed on {:?}: {}", sampler.source(), path, e);
                            metrics::increment_source_failures(sampler.source().name());
                            Vec::new()
                        }
                    }
                })
        });
        join_all(branches)
            .await
            .into_iter()
            .flatten()
            .filter(|venue| !venue.is_empty())
            .collect()
    }

    /// Median output per unit of `amount` sold across every source, over the
    /// direct pair only.
    ///
    /// One when both tokens are the same; zero when nothing could be sampled.
    /// Results are cached per (pair, amount, sources) for the price cache age.
    pub async fn median_sell_rate(
        &self,
        sources: &[Source],
        taker: Address,
        maker: Address,
        amount: U256,
    ) -> SamplerResult<Decimal> {
        if taker == maker {
            return Ok(Decimal::ONE);
        }
        if amount.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let key = PriceKey {
            taker,
            maker,
            amount,
            sources: sources.to_vec(),
        };
        if let Some(cached) = self.price_cache.get(&key) {
            if cached.cached_at.elapsed() <= self.max_price_cache_age {
                return Ok(cached.rate);
            }
        }

        let direct = [taker, maker];
        let samplers = self.select(sources);
        let quotes = samplers
            .iter()
            .filter(|sampler| sampler.can_handle(&direct))
            .map(|sampler| async move {
                match sampler.sample_sells(&direct, &[amount]).await {
                    Ok(venues) => venues,
                    Err(e) => {
                        warn!(
                            "[Aggregator] {} failed pricing {:?}: {}",
                            sampler.source(),
                            direct,
                            e
                        );
                        metrics::increment_source_failures(sampler.source().name());
                        Vec::new()
                    }
                }
            });
        let mut outputs: Vec<U256> = join_all(quotes)
            .await
            .into_iter()
            .flatten()
            .flatten()
            .filter(|sample| sample.input_amount == amount)
            .map(|sample| sample.output_amount)
            .collect();
        outputs.sort();
        let rate = match outputs.get(outputs.len().saturating_sub(1) / 2) {
            Some(median) => ratio(*median, amount)?,
            None => Decimal::ZERO,
        };
        self.price_cache.insert(
            key,
            CachedRate {
                rate,
                cached_at: Instant::now(),
            },
        );
        Ok(rate)
    }

    /// Two-hop sell quotes, one per intermediate token that produced one.
    pub async fn two_hop_sell_samples(
        &self,
        sources: &[Source],
        taker: Address,
        maker: Address,
        sell_amount: U256,
    ) -> Vec<DexSample> {
        self.two_hop_samples(Side::Sell, sources, taker, maker, sell_amount).await
    }

    pub async fn two_hop_buy_samples(
        &self,
        sources: &[Source],
        taker: Address,
        maker: Address,
        buy_amount: U256,
    ) -> Vec<DexSample> {
        self.two_hop_samples(Side::Buy, sources, taker, maker, buy_amount).await
    }

    async fn two_hop_samples(
        &self,
        side: Side,
        sources: &[Source],
        taker: Address,
        maker: Address,
        amount: U256,
    ) -> Vec<DexSample> {
        if amount.is_zero() {
            return Vec::new();
        }
        let samplers = self.select(sources);
        let paths: Vec<Vec<Address>> = self
            .token_paths(taker, maker)
            .into_iter()
            .filter(|path| path.len() == 3)
            .collect();
        let quotes = paths.iter().map(|path| {
            let samplers = &samplers;
            async move {
                match side {
                    Side::Sell => self.two_hop.sample_two_hop_sell(samplers, path, amount).await,
                    Side::Buy => self.two_hop.sample_two_hop_buy(samplers, path, amount).await,
                }
            }
        });
        join_all(quotes).await.into_iter().flatten().collect()
    }
}
