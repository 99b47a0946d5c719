// src/source_sampler.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, U256};
use futures::future::join_all;
use log::debug;

use crate::contract_helper::{
    uint_array_output, CallOptions, ContractHelper, MultiHopCallDescriptor,
};
use crate::errors::{SamplerError, SamplerResult};
use crate::types::{DexSample, FillData, Side, Source};

/// Default freshness accepted for cached quote calls.
pub const DEFAULT_SAMPLER_CACHE_AGE: Duration = Duration::from_secs(12);

/// Liquidity source plugin.
///
/// Each implementation covers one source and returns price samples for token
/// paths. The aggregator and the two-hop composer talk to sources only
/// through this trait, so any conforming implementation can be registered
/// without touching them.
#[async_trait]
pub trait SourceSampler: Send + Sync {
    /// The source produced samples are tagged with.
    fn source(&self) -> Source;

    /// Cheap eligibility check for `token_path`.
    ///
    /// Must not perform network I/O on the calling task. Implementations
    /// backed by off-chain topology may schedule a background refresh.
    fn can_handle(&self, token_path: &[Address]) -> bool;

    /// One sample list per venue, in `input_amounts` order.
    ///
    /// Amounts a venue cannot fill are omitted rather than zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if quoting fails for a reason other than a venue
    /// revert. Callers treat the source as contributing nothing.
    async fn sample_sells(
        &self,
        token_path: &[Address],
        input_amounts: &[U256],
    ) -> SamplerResult<Vec<Vec<DexSample>>>;

    /// Buy side of [`SourceSampler::sample_sells`]: each sample's `input_amount`
    /// is the amount bought and `output_amount` the amount that must be sold.
    async fn sample_buys(
        &self,
        token_path: &[Address],
        output_amounts: &[U256],
    ) -> SamplerResult<Vec<Vec<DexSample>>>;

    /// Pre-encoded sell quote calls for embedding in a two-hop call.
    async fn multi_hop_sell_descriptors(
        &self,
        token_path: &[Address],
        input_amount: U256,
    ) -> SamplerResult<Vec<MultiHopCallDescriptor>>;

    async fn multi_hop_buy_descriptors(
        &self,
        token_path: &[Address],
        output_amount: U256,
    ) -> SamplerResult<Vec<MultiHopCallDescriptor>>;

    /// Feedback: a hop quoted by this source on `token_path` produced output.
    fn pump(&self, _token_path: &[Address]) {}

    /// Feedback: no hop quoted by this source on `token_path` produced output.
    fn dump(&self, _token_path: &[Address]) {}
}

/// One on-chain quote call against a single venue.
#[derive(Debug, Clone)]
pub struct QuoteCall {
    pub function: &'static str,
    pub args: Vec<Token>,
    pub fill_data: FillData,
    pub gas: Option<u64>,
}

/// Venue discovery and result extraction for an [`OnChainSampler`].
pub trait QuoteStrategy: Send + Sync + 'static {
    fn source(&self) -> Source;

    fn can_handle(&self, token_path: &[Address]) -> bool;

    /// One call per venue quoting every amount in `amounts`.
    fn quote_calls(
        &self,
        side: Side,
        token_path: &[Address],
        amounts: &[U256],
    ) -> SamplerResult<Vec<QuoteCall>>;

    /// Outputs for each quoted amount, in order. Defaults to the single
    /// `uint256[]` return value.
    fn extract(&self, call: &QuoteCall, tokens: Vec<Token>) -> SamplerResult<Vec<U256>> {
        uint_array_output(call.function, tokens)
    }
}

/// Shared implementation for sources quoted through the sampler contract.
pub struct OnChainSampler<S: QuoteStrategy> {
    strategy: Arc<S>,
    helper: ContractHelper,
    max_cache_age: Duration,
}

impl<S: QuoteStrategy> OnChainSampler<S> {
    pub fn new(strategy: S, helper: ContractHelper) -> Self {
        Self {
            strategy: Arc::new(strategy),
            helper,
            max_cache_age: DEFAULT_SAMPLER_CACHE_AGE,
        }
    }

    pub fn with_max_cache_age(mut self, max_cache_age: Duration) -> Self {
        self.max_cache_age = max_cache_age;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    async fn sample(
        &self,
        side: Side,
        token_path: &[Address],
        amounts: &[U256],
    ) -> SamplerResult<Vec<Vec<DexSample>>> {
        if amounts.is_empty() || !self.strategy.can_handle(token_path) {
            return Ok(Vec::new());
        }
        let source = self.strategy.source();
        let calls = self.strategy.quote_calls(side, token_path, amounts)?;
        let opts = CallOptions::default().with_max_cache_age(self.max_cache_age);

        let venues = calls.into_iter().map(|call| {
            let opts = match call.gas {
                Some(gas) => opts.clone().with_gas(gas),
                None => opts.clone(),
            };
            self.sample_venue(source, call, opts, amounts)
        });
        join_all(venues).await.into_iter().collect()
    }

    async fn sample_venue(
        &self,
        source: Source,
        call: QuoteCall,
        opts: CallOptions,
        amounts: &[U256],
    ) -> SamplerResult<Vec<DexSample>> {
        let tokens = match self.helper.call(call.function, &call.args, &opts).await {
            Ok(tokens) => tokens,
            Err(SamplerError::Call(e)) if e.is_revert() => {
                debug!("[{}] {}() reverted: {}", source, call.function, e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let outputs = self.strategy.extract(&call, tokens)?;
        Ok(amounts
            .iter()
            .zip(outputs)
            .map(|(input, output)| DexSample::new(source, call.fill_data.clone(), *input, output))
            .filter(DexSample::is_fillable)
            .collect())
    }

    fn descriptors(
        &self,
        side: Side,
        token_path: &[Address],
        amount: U256,
    ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
        if !self.strategy.can_handle(token_path) {
            return Ok(Vec::new());
        }
        let source = self.strategy.source();
        self.strategy
            .quote_calls(side, token_path, &[amount])?
            .into_iter()
            .map(|call| -> SamplerResult<MultiHopCallDescriptor> {
                let strategy = Arc::clone(&self.strategy);
                let quoted = call.clone();
                let decode = move |tokens: Vec<Token>| -> SamplerResult<DexSample> {
                    let output = strategy
                        .extract(&quoted, tokens)?
                        .first()
                        .copied()
                        .unwrap_or_default();
                    Ok(DexSample::new(source, quoted.fill_data.clone(), amount, output))
                };
                let mut descriptor = self
                    .helper
                    .multi_hop_descriptor(source, call.function, &call.args, decode)?;
                if call.gas.is_some() {
                    descriptor.gas = call.gas;
                }
                Ok(descriptor)
            })
            .collect()
    }
}

#[async_trait]
impl<S: QuoteStrategy> SourceSampler for OnChainSampler<S> {
    fn source(&self) -> Source {
        self.strategy.source()
    }

    fn can_handle(&self, token_path: &[Address]) -> bool {
        self.strategy.can_handle(token_path)
    }

    async fn sample_sells(
        &self,
        token_path: &[Address],
        input_amounts: &[U256],
    ) -> SamplerResult<Vec<Vec<DexSample>>> {
        self.sample(Side::Sell, token_path, input_amounts).await
    }

    async fn sample_buys(
        &self,
        token_path: &[Address],
        output_amounts: &[U256],
    ) -> SamplerResult<Vec<Vec<DexSample>>> {
        self.sample(Side::Buy, token_path, output_amounts).await
    }

    async fn multi_hop_sell_descriptors(
        &self,
        token_path: &[Address],
        input_amount: U256,
    ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
        self.descriptors(Side::Sell, token_path, input_amount)
    }

    async fn multi_hop_buy_descriptors(
        &self,
        token_path: &[Address],
        output_amount: U256,
    ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
        self.descriptors(Side::Buy, token_path, output_amount)
    }
}
