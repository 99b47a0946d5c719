// src/two_hop.rs
//
// Quotes taker -> intermediate -> maker paths in one on-chain call that
// carries every eligible first-hop and second-hop quote.

use std::sync::Arc;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use futures::future::join_all;
use log::{debug, warn};

use crate::call_channel::Overrides;
use crate::contract_helper::{CallOptions, ContractHelper, MultiHopCallDescriptor};
use crate::dispatcher::DEFAULT_CALL_GAS;
use crate::errors::{CallError, SamplerResult};
use crate::metrics;
use crate::source_sampler::{SourceSampler, DEFAULT_SAMPLER_CACHE_AGE};
use crate::types::{DexSample, FillData, Side, Source, TwoHopFillData};

/// Lifecycle of one two-hop quote. `NotEligible`, `NoLiquidity`, `Scored`
/// and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoHopState {
    NotEligible,
    GatheringDescriptors,
    NoLiquidity,
    Dispatched,
    Scored,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TwoHopOutcome {
    pub state: TwoHopState,
    /// Present only when `state` is `Scored`.
    pub sample: Option<DexSample>,
}

impl TwoHopOutcome {
    fn terminal(state: TwoHopState) -> Self {
        Self { state, sample: None }
    }
}

/// A descriptor together with the sampler that produced it, for feedback.
struct HopCall {
    sampler: Arc<dyn SourceSampler>,
    descriptor: MultiHopCallDescriptor,
}

type HopResults = Vec<(bool, Bytes)>;

pub struct TwoHopComposer {
    helper: ContractHelper,
    default_call_gas: u64,
}

impl TwoHopComposer {
    /// `helper` targets the sampler contract exposing `sampleTwoHopSell` and
    /// `sampleTwoHopBuy`.
    pub fn new(helper: ContractHelper) -> Self {
        Self {
            helper,
            default_call_gas: DEFAULT_CALL_GAS,
        }
    }

    pub fn with_default_call_gas(mut self, gas: u64) -> Self {
        self.default_call_gas = gas;
        self
    }

    pub async fn sample_two_hop_sell(
        &self,
        samplers: &[Arc<dyn SourceSampler>],
        token_path: &[Address],
        sell_amount: U256,
    ) -> Option<DexSample> {
        self.quote(Side::Sell, samplers, token_path, sell_amount).await.sample
    }

    pub async fn sample_two_hop_buy(
        &self,
        samplers: &[Arc<dyn SourceSampler>],
        token_path: &[Address],
        buy_amount: U256,
    ) -> Option<DexSample> {
        self.quote(Side::Buy, samplers, token_path, buy_amount).await.sample
    }

    /// Runs one quote to a terminal state. Failures are logged and reported
    /// through the state, never raised.
    pub async fn quote(
        &self,
        side: Side,
        samplers: &[Arc<dyn SourceSampler>],
        token_path: &[Address],
        amount: U256,
    ) -> TwoHopOutcome {
        let [taker, intermediate, maker] = token_path else {
            return TwoHopOutcome::terminal(TwoHopState::NotEligible);
        };
        let first_path = [*taker, *intermediate];
        let second_path = [*intermediate, *maker];

        debug!(
            "[TwoHop] {:?} via {:?}: {:?}",
            side,
            intermediate,
            TwoHopState::GatheringDescriptors
        );
        // Only the fixed end of the path carries a real amount; the chained
        // hop is filled in by the sampler contract.
        let (first_amount, second_amount) = match side {
            Side::Sell => (amount, U256::zero()),
            Side::Buy => (U256::zero(), amount),
        };
        let (first_hop, second_hop) = futures::join!(
            gather_descriptors(side, samplers, &first_path, first_amount),
            gather_descriptors(side, samplers, &second_path, second_amount),
        );
        if first_hop.is_empty() || second_hop.is_empty() {
            metrics::increment_two_hop_dropped("no_descriptors");
            return TwoHopOutcome::terminal(TwoHopState::NoLiquidity);
        }

        let dispatched = self.dispatch(side, &first_hop, &second_hop, amount).await;
        let (first_results, second_results) = match dispatched {
            Ok(results) => results,
            Err(e) => {
                warn!("[TwoHop] dropping {:?} -> {:?} -> {:?}: {}", taker, intermediate, maker, e);
                metrics::increment_two_hop_dropped("dispatch");
                return TwoHopOutcome::terminal(TwoHopState::Failed);
            }
        };
        debug!("[TwoHop] {:?} via {:?}: {:?}", side, intermediate, TwoHopState::Dispatched);

        // Score the fixed end first; the other hop is only worth decoding
        // once it has a winner to chain from.
        let score_first = || score_hop(side, &first_hop, &first_results, &first_path);
        let score_second = || score_hop(side, &second_hop, &second_results, &second_path);
        let scored = match side {
            Side::Sell => {
                score_first().and_then(|first| score_second().map(|second| (first, second)))
            }
            Side::Buy => {
                score_second().and_then(|second| score_first().map(|first| (first, second)))
            }
        };
        let Some((mut first, mut second)) = scored else {
            metrics::increment_two_hop_dropped("no_liquidity");
            return TwoHopOutcome::terminal(TwoHopState::NoLiquidity);
        };

        let output_amount = match side {
            Side::Sell => {
                second.input_amount = first.output_amount;
                second.output_amount
            }
            Side::Buy => {
                first.input_amount = second.output_amount;
                first.output_amount
            }
        };
        let sample = DexSample::new(
            Source::MultiHop,
            FillData::TwoHop(Box::new(TwoHopFillData {
                first_hop: first,
                second_hop: second,
                intermediate_token: *intermediate,
            })),
            amount,
            output_amount,
        );
        TwoHopOutcome {
            state: TwoHopState::Scored,
            sample: Some(sample),
        }
    }

    /// One sampler-contract call carrying both hop groups. Gas and overrides
    /// are accumulated across every embedded call.
    async fn dispatch(
        &self,
        side: Side,
        first_hop: &[HopCall],
        second_hop: &[HopCall],
        amount: U256,
    ) -> SamplerResult<(HopResults, HopResults)> {
        let mut overrides = Overrides::default();
        let mut gas = 0u64;
        for hop in first_hop.iter().chain(second_hop) {
            overrides.merge(&hop.descriptor.overrides);
            gas = gas.saturating_add(hop.descriptor.gas.unwrap_or(self.default_call_gas));
        }
        let function = match side {
            Side::Sell => "sampleTwoHopSell",
            Side::Buy => "sampleTwoHopBuy",
        };
        let args = [hop_calls(first_hop), hop_calls(second_hop), Token::Uint(amount)];
        let opts = CallOptions::default()
            .with_gas(gas)
            .with_overrides(overrides)
            .with_max_cache_age(DEFAULT_SAMPLER_CACHE_AGE);

        let tokens = self.helper.call(function, &args, &opts).await?;
        let decoded = match tokens.as_slice() {
            [first, second] => hop_results(first).zip(hop_results(second)),
            _ => None,
        };
        let (first_results, second_results) = decoded.ok_or_else(|| CallError::Decode {
            function: function.to_string(),
            data: Bytes::from(ethers::abi::encode(&tokens)),
        })?;
        let counts = [
            (first_hop.len(), first_results.len()),
            (second_hop.len(), second_results.len()),
        ];
        for (calls, results) in counts {
            if calls != results {
                return Err(CallError::BatchLengthMismatch {
                    expected: calls,
                    actual: results,
                }
                .into());
            }
        }
        Ok((first_results, second_results))
    }
}

/// Descriptors from every sampler that handles `hop_path`. A sampler that
/// fails to produce descriptors is skipped.
async fn gather_descriptors(
    side: Side,
    samplers: &[Arc<dyn SourceSampler>],
    hop_path: &[Address],
    amount: U256,
) -> Vec<HopCall> {
    let eligible: Vec<&Arc<dyn SourceSampler>> = samplers
        .iter()
        .filter(|s| s.can_handle(hop_path))
        .collect();
    let requests = eligible.iter().map(|sampler| async move {
        match side {
            Side::Sell => sampler.multi_hop_sell_descriptors(hop_path, amount).await,
            Side::Buy => sampler.multi_hop_buy_descriptors(hop_path, amount).await,
        }
    });
    let mut calls = Vec::new();
    for (sampler, descriptors) in eligible.iter().zip(join_all(requests).await) {
        match descriptors {
            Ok(descriptors) => calls.extend(descriptors.into_iter().map(|descriptor| HopCall {
                sampler: Arc::clone(sampler),
                descriptor,
            })),
            Err(e) => {
                debug!(
                    "[TwoHop] {} gave no descriptors for {:?}: {}",
                    sampler.source(),
                    hop_path,
                    e
                );
                metrics::increment_source_failures(sampler.source().name());
            }
        }
    }
    calls
}

fn hop_calls(calls: &[HopCall]) -> Token {
    Token::Array(
        calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.descriptor.target),
                    Token::Bytes(call.descriptor.call_data.to_vec()),
                ])
            })
            .collect(),
    )
}

fn hop_results(token: &Token) -> Option<HopResults> {
    let Token::Array(items) = token else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Bool(success), Token::Bytes(data)] => {
                    Some((*success, Bytes::from(data.clone())))
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Best sample of one hop group: the largest output for sells, the smallest
/// for buys. Zero and saturated outputs never win. The winning sampler is
/// pumped; if nothing wins, every sampler in the group is dumped.
fn score_hop(
    side: Side,
    calls: &[HopCall],
    results: &[(bool, Bytes)],
    hop_path: &[Address],
) -> Option<DexSample> {
    let mut best: Option<(usize, DexSample)> = None;
    for (index, (call, (success, data))) in calls.iter().zip(results).enumerate() {
        if !success {
            continue;
        }
        let sample = match call.descriptor.decode(data) {
            Ok(sample) => sample,
            Err(e) => {
                debug!("[TwoHop] undecodable {} hop result: {}", call.descriptor.source, e);
                continue;
            }
        };
        if sample.output_amount.is_zero() || sample.output_amount == U256::MAX {
            continue;
        }
        let better = match &best {
            None => true,
            Some((_, current)) => match side {
                Side::Sell => sample.output_amount > current.output_amount,
                Side::Buy => sample.output_amount < current.output_amount,
            },
        };
        if better {
            best = Some((index, sample));
        }
    }

    match best {
        Some((index, sample)) => {
            calls[index].sampler.pump(hop_path);
            Some(sample)
        }
        None => {
            let mut dumped: Vec<Source> = Vec::new();
            for call in calls {
                let source = call.sampler.source();
                if !dumped.contains(&source) {
                    call.sampler.dump(hop_path);
                    dumped.push(source);
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_channel::{CallChannel, ChannelConfig};
    use crate::contract_helper::ContractDeployment;
    use crate::contracts::erc20_bridge_sampler_abi;
    use crate::dispatcher::{encode_revert_reason, DispatcherContract};
    use crate::test_utils::{address, uint_result, StubTransport};
    use async_trait::async_trait;
    use ethers::abi::ParamType;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Decoder = fn(&[u8]) -> SamplerResult<DexSample>;

    fn amount_decoder(data: &[u8]) -> SamplerResult<DexSample> {
        let tokens = ethers::abi::decode(&[ParamType::Uint(256)], data)?;
        let output = tokens[0].clone().into_uint().unwrap_or_default();
        Ok(DexSample::new(
            Source::UniswapV2,
            FillData::Custom {
                payload: serde_json::json!(null),
            },
            U256::zero(),
            output,
        ))
    }

    fn unreachable_decoder(_: &[u8]) -> SamplerResult<DexSample> {
        panic!("second hop must not be scored when the first hop has no winner");
    }

    /// Serves a fixed number of descriptors per hop path and records feedback.
    struct HopSampler {
        source: Source,
        hops: HashMap<Vec<Address>, (usize, Decoder)>,
        pumped: Mutex<Vec<Vec<Address>>>,
        dumped: Mutex<Vec<Vec<Address>>>,
    }

    impl HopSampler {
        fn new(source: Source, hops: Vec<(Vec<Address>, usize, Decoder)>) -> Arc<Self> {
            Arc::new(Self {
                source,
                hops: hops.into_iter().map(|(path, n, decoder)| (path, (n, decoder))).collect(),
                pumped: Mutex::new(Vec::new()),
                dumped: Mutex::new(Vec::new()),
            })
        }

        fn descriptors(
            &self,
            token_path: &[Address],
        ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
            let Some((count, decoder)) = self.hops.get(token_path) else {
                return Ok(Vec::new());
            };
            let decoder = *decoder;
            Ok((0..*count)
                .map(|i| MultiHopCallDescriptor {
                    source: self.source,
                    target: address(0x5a),
                    call_data: Bytes::from(vec![i as u8]),
                    overrides: Overrides::default(),
                    gas: Some(100_000),
                    decoder: Arc::new(decoder),
                })
                .collect())
        }
    }

    #[async_trait]
    impl SourceSampler for HopSampler {
        fn source(&self) -> Source {
            self.source
        }

        fn can_handle(&self, token_path: &[Address]) -> bool {
            self.hops.contains_key(token_path)
        }

        async fn sample_sells(
            &self,
            _: &[Address],
            _: &[U256],
        ) -> SamplerResult<Vec<Vec<DexSample>>> {
            Ok(Vec::new())
        }

        async fn sample_buys(
            &self,
            _: &[Address],
            _: &[U256],
        ) -> SamplerResult<Vec<Vec<DexSample>>> {
            Ok(Vec::new())
        }

        async fn multi_hop_sell_descriptors(
            &self,
            token_path: &[Address],
            _: U256,
        ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
            self.descriptors(token_path)
        }

        async fn multi_hop_buy_descriptors(
            &self,
            token_path: &[Address],
            _: U256,
        ) -> SamplerResult<Vec<MultiHopCallDescriptor>> {
            self.descriptors(token_path)
        }

        fn pump(&self, token_path: &[Address]) {
            self.pumped.lock().unwrap().push(token_path.to_vec());
        }

        fn dump(&self, token_path: &[Address]) {
            self.dumped.lock().unwrap().push(token_path.to_vec());
        }
    }

    fn result_group(results: &[Result<u64, &str>]) -> Token {
        Token::Array(
            results
                .iter()
                .map(|result| match result {
                    Ok(output) => Token::Tuple(vec![
                        Token::Bool(true),
                        Token::Bytes(uint_result(U256::from(*output)).to_vec()),
                    ]),
                    Err(reason) => Token::Tuple(vec![
                        Token::Bool(false),
                        Token::Bytes(encode_revert_reason(reason).to_vec()),
                    ]),
                })
                .collect(),
        )
    }

    fn two_hop_result(first: &[Result<u64, &str>], second: &[Result<u64, &str>]) -> Bytes {
        Bytes::from(ethers::abi::encode(&[result_group(first), result_group(second)]))
    }

    fn composer(transport: Arc<StubTransport>) -> TwoHopComposer {
        let channel = CallChannel::new(
            transport,
            DispatcherContract::deployed(address(0xd15)),
            ChannelConfig::default(),
        );
        TwoHopComposer::new(ContractHelper::new(
            channel,
            erc20_bridge_sampler_abi().unwrap(),
            ContractDeployment::Deployed(address(0x5a)),
        ))
    }

    fn path() -> Vec<Address> {
        vec![address(1), address(2), address(3)]
    }

    #[tokio::test(start_paused = true)]
    async fn sell_chains_best_first_hop_into_best_second_hop() {
        let transport = StubTransport::new(|_, _| {
            Ok(two_hop_result(&[Ok(50), Ok(70), Err("K")], &[Ok(300)]))
        });
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![
                (vec![address(1), address(2)], 3, amount_decoder),
                (vec![address(2), address(3)], 1, amount_decoder),
            ],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler.clone()];

        let outcome = composer(transport.clone())
            .quote(Side::Sell, &samplers, &path(), U256::from(1000))
            .await;
        assert_eq!(outcome.state, TwoHopState::Scored);
        let sample = outcome.sample.unwrap();
        assert_eq!(sample.source, Source::MultiHop);
        assert_eq!(sample.input_amount, U256::from(1000));
        assert_eq!(sample.output_amount, U256::from(300));
        let FillData::TwoHop(fill) = sample.fill_data else {
            panic!("expected two-hop fill data");
        };
        assert_eq!(fill.intermediate_token, address(2));
        assert_eq!(fill.first_hop.output_amount, U256::from(70));
        assert_eq!(fill.second_hop.input_amount, U256::from(70));
        assert_eq!(sampler.pumped.lock().unwrap().len(), 2);

        let raw_calls = transport.raw_calls();
        assert_eq!(raw_calls.len(), 1);
        assert_eq!(raw_calls[0].gas, 400_000);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_first_hop_never_scores_second_hop() {
        let transport = StubTransport::new(|_, _| Ok(two_hop_result(&[Ok(0), Ok(0)], &[Ok(123)])));
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![
                (vec![address(1), address(2)], 2, amount_decoder),
                (vec![address(2), address(3)], 1, unreachable_decoder),
            ],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler.clone()];

        let outcome = composer(transport)
            .quote(Side::Sell, &samplers, &path(), U256::from(1000))
            .await;
        assert_eq!(outcome, TwoHopOutcome::terminal(TwoHopState::NoLiquidity));
        assert_eq!(*sampler.dumped.lock().unwrap(), vec![vec![address(1), address(2)]]);
        assert!(sampler.pumped.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn buy_scores_second_hop_first_and_picks_cheapest() {
        let transport =
            StubTransport::new(|_, _| Ok(two_hop_result(&[Ok(500)], &[Ok(40), Ok(30)])));
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![
                (vec![address(1), address(2)], 1, amount_decoder),
                (vec![address(2), address(3)], 2, amount_decoder),
            ],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler];

        let sample = composer(transport)
            .sample_two_hop_buy(&samplers, &path(), U256::from(10))
            .await
            .unwrap();
        assert_eq!(sample.input_amount, U256::from(10));
        assert_eq!(sample.output_amount, U256::from(500));
        let FillData::TwoHop(fill) = sample.fill_data else {
            panic!("expected two-hop fill data");
        };
        assert_eq!(fill.second_hop.output_amount, U256::from(30));
        assert_eq!(fill.first_hop.input_amount, U256::from(30));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_error_drops_the_path() {
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![
                (vec![address(1), address(2)], 1, amount_decoder),
                (vec![address(2), address(3)], 1, amount_decoder),
            ],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler];

        let outcome = composer(StubTransport::failing("connection reset"))
            .quote(Side::Sell, &samplers, &path(), U256::from(1000))
            .await;
        assert_eq!(outcome, TwoHopOutcome::terminal(TwoHopState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn result_count_mismatch_is_a_failure() {
        let transport =
            StubTransport::new(|_, _| Ok(two_hop_result(&[Ok(50), Ok(60)], &[Ok(300)])));
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![
                (vec![address(1), address(2)], 1, amount_decoder),
                (vec![address(2), address(3)], 1, amount_decoder),
            ],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler];
        let outcome = composer(transport)
            .quote(Side::Sell, &samplers, &path(), U256::from(1000))
            .await;
        assert_eq!(outcome.state, TwoHopState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_or_empty_paths_never_dispatch() {
        let transport = StubTransport::new(|_, _| Ok(Bytes::default()));
        let sampler = HopSampler::new(
            Source::UniswapV2,
            vec![(vec![address(1), address(2)], 1, amount_decoder)],
        );
        let samplers: Vec<Arc<dyn SourceSampler>> = vec![sampler];
        let composer = composer(transport.clone());

        let direct = composer
            .quote(Side::Sell, &samplers, &[address(1), address(3)], U256::one())
            .await;
        assert_eq!(direct.state, TwoHopState::NotEligible);
        let missing_second_hop = composer.quote(Side::Sell, &samplers, &path(), U256::one()).await;
        assert_eq!(missing_second_hop.state, TwoHopState::NoLiquidity);
        assert!(transport.raw_calls().is_empty());
    }
}
