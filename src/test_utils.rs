// src/test_utils.rs
//
// In-process node stand-in: answers single calls directly and unpacks merged
// dispatcher calls into per-call handler invocations.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, Bytes, U256};

use crate::dispatcher::{decode_revert_reason, dispatch_call_param, RawCall};
use crate::errors::CallError;
use crate::transport::CallTransport;

/// `Ok(return data)` or `Err(revert data)` for one call.
type Handler = dyn Fn(Address, &Bytes) -> Result<Bytes, Bytes> + Send + Sync;

pub(crate) fn address(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub(crate) fn uint_result(value: U256) -> Bytes {
    Bytes::from(ethers::abi::encode(&[Token::Uint(value)]))
}

pub(crate) struct StubTransport {
    handler: Box<Handler>,
    failure: Option<String>,
    raw_calls: Mutex<Vec<RawCall>>,
    sub_calls: Mutex<Vec<(Address, Bytes)>>,
}

impl StubTransport {
    pub(crate) fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(Address, &Bytes) -> Result<Bytes, Bytes> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            failure: None,
            raw_calls: Mutex::new(Vec::new()),
            sub_calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(|_, _| Ok(Bytes::default())),
            failure: Some(message.to_string()),
            raw_calls: Mutex::new(Vec::new()),
            sub_calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn raw_calls(&self) -> Vec<RawCall> {
        self.raw_calls.lock().unwrap().clone()
    }

    pub(crate) fn sub_calls(&self) -> Vec<(Address, Bytes)> {
        self.sub_calls.lock().unwrap().clone()
    }

    fn handle(&self, to: Address, data: &Bytes) -> Result<Bytes, Bytes> {
        self.sub_calls.lock().unwrap().push((to, data.clone()));
        (self.handler)(to, data)
    }

    fn answer_dispatch(&self, calldata: &[u8]) -> Bytes {
        let mut decoded =
            ethers::abi::decode(&[ParamType::Array(Box::new(dispatch_call_param()))], calldata)
                .expect("malformed dispatch calldata");
        let Some(Token::Array(calls)) = decoded.pop() else {
            panic!("dispatch calldata is not an array");
        };
        let results = calls
            .into_iter()
            .map(|call| {
                let Token::Tuple(fields) = call else {
                    panic!("dispatch entry is not a tuple");
                };
                let (to, data) = match fields.as_slice() {
                    [Token::Address(to), Token::Bytes(data), Token::Uint(_)] => {
                        (*to, Bytes::from(data.clone()))
                    }
                    other => panic!("unexpected dispatch entry {:?}", other),
                };
                let (success, result) = match self.handle(to, &data) {
                    Ok(result) => (true, result),
                    Err(revert) => (false, revert),
                };
                Token::Tuple(vec![Token::Bool(success), Token::Bytes(result.to_vec())])
            })
            .collect();
        Bytes::from(ethers::abi::encode(&[Token::Array(results)]))
    }
}

fn dispatch_selector() -> [u8; 4] {
    ethers::utils::id("dispatch((address,bytes,uint256)[])")
}

#[async_trait]
impl CallTransport for StubTransport {
    async fn send_raw_call(&self, call: &RawCall) -> Result<Bytes, CallError> {
        self.raw_calls.lock().unwrap().push(call.clone());
        if let Some(message) = &self.failure {
            return Err(CallError::Transport(message.clone()));
        }
        if call.data.len() >= 4 && call.data[..4] == dispatch_selector() {
            return Ok(self.answer_dispatch(&call.data[4..]));
        }
        self.handle(call.to, &call.data).map_err(|revert| CallError::Reverted {
            reason: decode_revert_reason(&revert),
            data: revert,
        })
    }
}
