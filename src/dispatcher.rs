// src/dispatcher.rs
//
// Merge encoding for batched eth_calls: partitions queued requests into
// compatible batches and folds each batch into one call against the
// dispatcher contract.

use ethers::abi::{Function, Param, ParamType, StateMutability, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;

use crate::call_channel::{CallRequest, Overrides};
use crate::errors::CallError;

/// Gas assigned to a call that does not set its own limit.
pub const DEFAULT_CALL_GAS: u64 = 4_000_000;

/// Selector of `Error(string)`.
pub const REVERT_ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

static DISPATCH_FUNCTION: Lazy<Function> = Lazy::new(|| Function {
    name: "dispatch".to_string(),
    inputs: vec![Param {
        name: "calls".to_string(),
        kind: ParamType::Array(Box::new(dispatch_call_param())),
        internal_type: None,
    }],
    outputs: vec![Param {
        name: "results".to_string(),
        kind: ParamType::Array(Box::new(call_result_param())),
        internal_type: None,
    }],
    constant: None,
    state_mutability: StateMutability::View,
});

/// `(address to, bytes data, uint256 gas)`
pub(crate) fn dispatch_call_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Address, ParamType::Bytes, ParamType::Uint(256)])
}

/// `(bool success, bytes resultData)`
pub(crate) fn call_result_param() -> ParamType {
    ParamType::Tuple(vec![ParamType::Bool, ParamType::Bytes])
}

/// Address a contract is simulated at when it has no real deployment.
pub fn deterministic_address(bytecode: &[u8]) -> Address {
    Address::from_slice(&keccak256(bytecode)[12..])
}

/// Fully resolved eth_call handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: u64,
    pub gas_price: Option<U256>,
    pub overrides: Overrides,
}

/// The on-chain dispatcher that executes a list of sub-calls and reports
/// `(success, resultData)` for each.
#[derive(Debug, Clone)]
pub struct DispatcherContract {
    address: Address,
    bytecode: Option<Bytes>,
}

impl DispatcherContract {
    pub fn deployed(address: Address) -> Self {
        Self {
            address,
            bytecode: None,
        }
    }

    /// Injects `bytecode` through state overrides, at `address` or at the
    /// bytecode's deterministic address.
    pub fn simulated(bytecode: Bytes, address: Option<Address>) -> Self {
        let address = address.unwrap_or_else(|| deterministic_address(&bytecode));
        Self {
            address,
            bytecode: Some(bytecode),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn overrides(&self) -> Overrides {
        match &self.bytecode {
            Some(code) => Overrides::with_code(self.address, code.clone()),
            None => Overrides::default(),
        }
    }

    pub fn encode_dispatch(
        &self,
        calls: &[&CallRequest],
        default_gas: u64,
    ) -> Result<Bytes, CallError> {
        let call_tokens = calls
            .iter()
            .map(|call| {
                Token::Tuple(vec![
                    Token::Address(call.to),
                    Token::Bytes(call.data.to_vec()),
                    Token::Uint(U256::from(call.gas.unwrap_or(default_gas))),
                ])
            })
            .collect();
        DISPATCH_FUNCTION
            .encode_input(&[Token::Array(call_tokens)])
            .map(Bytes::from)
            .map_err(|e| CallError::Encode(e.to_string()))
    }

    pub fn decode_results(&self, data: &[u8]) -> Result<Vec<(bool, Bytes)>, CallError> {
        let decode_error = || CallError::Decode {
            function: DISPATCH_FUNCTION.name.clone(),
            data: Bytes::from(data.to_vec()),
        };
        let mut tokens = DISPATCH_FUNCTION.decode_output(data).map_err(|_| decode_error())?;
        let Some(Token::Array(results)) = tokens.pop() else {
            return Err(decode_error());
        };
        results
            .into_iter()
            .map(|result| match result {
                Token::Tuple(fields) => match fields.as_slice() {
                    [Token::Bool(success), Token::Bytes(data)] => {
                        Ok((*success, Bytes::from(data.clone())))
                    }
                    _ => Err(decode_error()),
                },
                _ => Err(decode_error()),
            })
            .collect()
    }
}

/// Size and gas ceilings for one merged batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_batch_gas: u64,
    /// Calldata plus override code, in bytes.
    pub max_batch_bytes: usize,
    pub default_call_gas: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_gas: 512_000_000,
            max_batch_bytes: 512_000,
            default_call_gas: DEFAULT_CALL_GAS,
        }
    }
}

pub(crate) fn estimated_call_bytes(call: &CallRequest) -> usize {
    call.data.len() + call.overrides.code_len()
}

/// Accumulates calls into one batch while they stay compatible.
#[derive(Debug)]
pub struct CallBatcher<'a> {
    limits: &'a BatchLimits,
    len: usize,
    gas: u64,
    bytes: usize,
    gas_price: Option<U256>,
    overrides: Overrides,
}

impl<'a> CallBatcher<'a> {
    pub fn new(limits: &'a BatchLimits) -> Self {
        Self {
            limits,
            len: 0,
            gas: 0,
            bytes: 0,
            gas_price: None,
            overrides: Overrides::default(),
        }
    }

    /// Adds `call` if it fits. The first call always fits; later calls must
    /// keep the batch strictly below both ceilings.
    pub fn try_to_batch(&mut self, call: &CallRequest) -> bool {
        let gas = call.gas.unwrap_or(self.limits.default_call_gas);
        let bytes = estimated_call_bytes(call);
        if self.len > 0 {
            if self.gas.saturating_add(gas) >= self.limits.max_batch_gas {
                return false;
            }
            if let (Some(batch_price), Some(price)) = (self.gas_price, call.gas_price) {
                if batch_price != price {
                    return false;
                }
            }
            if self.overrides.conflicts_with(&call.overrides) {
                return false;
            }
            if self.bytes + bytes >= self.limits.max_batch_bytes {
                return false;
            }
        }
        self.len += 1;
        self.gas = self.gas.saturating_add(gas);
        self.bytes += bytes;
        if self.gas_price.is_none() {
            self.gas_price = call.gas_price;
        }
        self.overrides.merge(&call.overrides);
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Splits `calls` into compatible batches.
///
/// Each pass walks the remaining calls in order and greedily keeps every call
/// compatible with the batch built so far; the rest spill into the next pass.
pub fn partition_batches<T: AsRef<CallRequest>>(
    calls: Vec<T>,
    limits: &BatchLimits,
) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut remaining = calls;
    while !remaining.is_empty() {
        let mut batcher = CallBatcher::new(limits);
        let mut batch = Vec::new();
        let mut spilled = Vec::new();
        for call in remaining {
            if batcher.try_to_batch(call.as_ref()) {
                batch.push(call);
            } else {
                spilled.push(call);
            }
        }
        batches.push(batch);
        remaining = spilled;
    }
    batches
}

/// Folds a batch into the eth_call actually sent to the node.
///
/// A single call goes out as-is; several calls become one `dispatch` call
/// whose gas is the sum of the per-call gas and whose overrides carry every
/// call's overrides plus the dispatcher code, which always wins.
pub fn merge_batch(
    calls: &[&CallRequest],
    from: Address,
    dispatcher: &DispatcherContract,
    default_gas: u64,
) -> Result<RawCall, CallError> {
    if let [call] = calls {
        return Ok(RawCall {
            from,
            to: call.to,
            data: call.data.clone(),
            value: call.value.unwrap_or_default(),
            gas: call.gas.unwrap_or(default_gas),
            gas_price: call.gas_price,
            overrides: call.overrides.clone(),
        });
    }

    let mut overrides = Overrides::default();
    let mut gas = 0u64;
    let mut value = U256::zero();
    let mut gas_price = None;
    for call in calls {
        overrides.merge(&call.overrides);
        gas = gas.saturating_add(call.gas.unwrap_or(default_gas));
        value = value.saturating_add(call.value.unwrap_or_default());
        match (gas_price, call.gas_price) {
            (None, price) => gas_price = price,
            (Some(batch_price), Some(price)) if batch_price != price => {
                return Err(CallError::Encode(format!(
                    "conflicting gas prices in one batch: {} != {}",
                    batch_price, price
                )));
            }
            _ => {}
        }
    }
    overrides.merge(&dispatcher.overrides());

    Ok(RawCall {
        from,
        to: dispatcher.address(),
        data: dispatcher.encode_dispatch(calls, default_gas)?,
        value,
        gas,
        gas_price,
        overrides,
    })
}

/// Human-readable reason carried by revert data.
///
/// `Error(string)` payloads yield the decoded string; anything else is
/// reported with its raw bytes.
pub fn decode_revert_reason(data: &[u8]) -> String {
    if data.is_empty() {
        return "(no data)".to_string();
    }
    if data.len() >= 4 && data[..4] == REVERT_ERROR_SELECTOR {
        if let Ok(mut tokens) = ethers::abi::decode(&[ParamType::String], &data[4..]) {
            if let Some(Token::String(reason)) = tokens.pop() {
                return reason.replace('\0', "");
            }
        }
    }
    format!("reverted with data 0x{}", hex::encode(data))
}

/// ABI-encodes `Error(string)(reason)`.
pub fn encode_revert_reason(reason: &str) -> Bytes {
    let mut data = REVERT_ERROR_SELECTOR.to_vec();
    data.extend(ethers::abi::encode(&[Token::String(reason.to_string())]));
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(s: &str) -> Address {
        Address::from_str(s).unwrap()
    }

    fn request(to: &str, gas: Option<u64>) -> CallRequest {
        let mut req = CallRequest::new(addr(to), Bytes::from(vec![0xde, 0xad]));
        req.gas = gas;
        req
    }

    #[test]
    fn compatible_calls_share_one_batch() {
        let limits = BatchLimits::default();
        let calls = vec![
            request("0x1111111111111111111111111111111111111111", Some(100_000)),
            request("0x2222222222222222222222222222222222222222", None),
            request("0x3333333333333333333333333333333333333333", Some(250_000)),
        ];
        let batches = partition_batches(calls.clone(), &limits);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], calls);

        let refs: Vec<&CallRequest> = batches[0].iter().collect();
        let dispatcher = DispatcherContract::simulated(Bytes::from(vec![0x60, 0x80]), None);
        let merged =
            merge_batch(&refs, Address::zero(), &dispatcher, limits.default_call_gas).unwrap();
        assert_eq!(merged.gas, 100_000 + DEFAULT_CALL_GAS + 250_000);
        assert_eq!(merged.to, dispatcher.address());
        assert!(merged.overrides.get(&dispatcher.address()).is_some());
    }

    #[test]
    fn conflicting_overrides_spill_into_new_batches() {
        let limits = BatchLimits::default();
        let helper = addr("0x9999999999999999999999999999999999999999");
        let calls: Vec<CallRequest> = (0..3u8)
            .map(|i| {
                request("0x1111111111111111111111111111111111111111", None)
                    .with_overrides(Overrides::with_code(helper, Bytes::from(vec![i])))
            })
            .collect();
        let batches = partition_batches(calls, &limits);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn identical_overrides_do_not_conflict() {
        let limits = BatchLimits::default();
        let helper = addr("0x9999999999999999999999999999999999999999");
        let calls: Vec<CallRequest> = (0..4)
            .map(|_| {
                request("0x1111111111111111111111111111111111111111", None)
                    .with_overrides(Overrides::with_code(helper, Bytes::from(vec![1, 2, 3])))
            })
            .collect();
        assert_eq!(partition_batches(calls, &limits).len(), 1);
    }

    #[test]
    fn differing_gas_prices_split_batches_but_unset_joins_either() {
        let limits = BatchLimits::default();
        let to = "0x1111111111111111111111111111111111111111";
        let calls = vec![
            request(to, None).with_gas_price(U256::from(10)),
            request(to, None).with_gas_price(U256::from(20)),
            request(to, None),
        ];
        let batches = partition_batches(calls, &limits);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].gas_price, Some(U256::from(10)));
        assert_eq!(batches[0][1].gas_price, None);
        assert_eq!(batches[1][0].gas_price, Some(U256::from(20)));
    }

    #[test]
    fn gas_ceiling_limits_batch_size() {
        let limits = BatchLimits {
            max_batch_gas: 10_000_000,
            ..BatchLimits::default()
        };
        let calls: Vec<CallRequest> = (0..5)
            .map(|_| request("0x1111111111111111111111111111111111111111", None))
            .collect();
        let sizes: Vec<usize> = partition_batches(calls, &limits).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn batch_reaching_gas_ceiling_is_rejected() {
        let limits = BatchLimits {
            max_batch_gas: 2 * DEFAULT_CALL_GAS,
            ..BatchLimits::default()
        };
        let calls: Vec<CallRequest> = (0..3)
            .map(|_| request("0x1111111111111111111111111111111111111111", None))
            .collect();
        let sizes: Vec<usize> = partition_batches(calls, &limits).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn byte_ceiling_counts_calldata_and_override_code() {
        let limits = BatchLimits {
            max_batch_bytes: 6,
            ..BatchLimits::default()
        };
        let to = "0x1111111111111111111111111111111111111111";
        let calls: Vec<CallRequest> = (0..5).map(|_| request(to, None)).collect();
        let sizes: Vec<usize> = partition_batches(calls, &limits).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let helper = addr("0x9999999999999999999999999999999999999999");
        let heavy = request(to, None)
            .with_overrides(Overrides::with_code(helper, Bytes::from(vec![0; 3])));
        let calls = vec![request(to, None), heavy, request(to, None)];
        let batches = partition_batches(calls, &limits);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].iter().all(|call| call.overrides.is_empty()));
        assert_eq!(batches[1][0].overrides.code_len(), 3);
    }

    #[test]
    fn dispatcher_code_wins_over_call_overrides() {
        let dispatcher = DispatcherContract::simulated(Bytes::from(vec![0x60, 0x80]), None);
        let to = "0x1111111111111111111111111111111111111111";
        let hijack = request(to, None)
            .with_overrides(Overrides::with_code(dispatcher.address(), Bytes::from(vec![0xff])));
        let plain = request(to, None);
        let batch = [&hijack, &plain];
        let merged = merge_batch(&batch, Address::zero(), &dispatcher, DEFAULT_CALL_GAS).unwrap();
        assert_eq!(
            merged.overrides.get(&dispatcher.address()),
            Some(&Bytes::from(vec![0x60, 0x80]))
        );
    }

    #[test]
    fn single_call_is_dispatched_as_is() {
        let call = request("0x1111111111111111111111111111111111111111", None);
        let dispatcher =
            DispatcherContract::deployed(addr("0x2222222222222222222222222222222222222222"));
        let raw = merge_batch(&[&call], Address::zero(), &dispatcher, DEFAULT_CALL_GAS).unwrap();
        assert_eq!(raw.to, call.to);
        assert_eq!(raw.data, call.data);
        assert_eq!(raw.gas, DEFAULT_CALL_GAS);
        assert_eq!(raw.value, U256::zero());
        assert!(raw.overrides.is_empty());
    }

    #[test]
    fn revert_reason_round_trip() {
        let data = encode_revert_reason("insufficient liquidity");
        assert_eq!(decode_revert_reason(&data), "insufficient liquidity");
    }

    #[test]
    fn undecodable_revert_reports_raw_bytes() {
        assert_eq!(decode_revert_reason(&[0xab, 0xcd]), "reverted with data 0xabcd");
        assert_eq!(decode_revert_reason(&[]), "(no data)");
    }

    #[test]
    fn dispatch_results_decode_in_order() {
        let dispatcher = DispatcherContract::deployed(Address::zero());
        let encoded = ethers::abi::encode(&[Token::Array(vec![
            Token::Tuple(vec![Token::Bool(true), Token::Bytes(vec![1])]),
            Token::Tuple(vec![Token::Bool(false), Token::Bytes(vec![2, 3])]),
        ])]);
        let results = dispatcher.decode_results(&encoded).unwrap();
        assert_eq!(
            results,
            vec![(true, Bytes::from(vec![1])), (false, Bytes::from(vec![2, 3]))]
        );
        assert!(matches!(
            dispatcher.decode_results(&[0x01]),
            Err(CallError::Decode { .. })
        ));
    }
}
