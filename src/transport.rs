// src/transport.rs

use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::{Http, Provider};
use ethers::providers::call_raw::{spoof, RawCall as _};
use ethers::providers::{ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockId, BlockNumber, Bytes, TransactionRequest};
use log::debug;

use crate::dispatcher::{decode_revert_reason, RawCall};
use crate::errors::CallError;

/// Node-facing primitive behind the call channel: one `eth_call` with state
/// overrides.
///
/// Implementations own retry policy; the channel never retries.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn send_raw_call(&self, call: &RawCall) -> Result<Bytes, CallError>;
}

/// `eth_call` over an ethers HTTP provider, with overrides sent as a state
/// override set.
pub struct EthersTransport {
    provider: Arc<Provider<Http>>,
    block: BlockId,
}

impl EthersTransport {
    pub fn new(provider: Arc<Provider<Http>>) -> Self {
        Self {
            provider,
            block: BlockId::Number(BlockNumber::Latest),
        }
    }

    pub fn from_url(rpc_url: &str) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        Ok(Self::new(Arc::new(provider)))
    }

    pub fn at_block(mut self, block: BlockId) -> Self {
        self.block = block;
        self
    }
}

fn provider_error(err: ProviderError) -> CallError {
    if let Some(data) = err.as_error_response().and_then(|resp| resp.as_revert_data()) {
        return CallError::Reverted {
            reason: decode_revert_reason(&data),
            data,
        };
    }
    CallError::Transport(err.to_string())
}

#[async_trait]
impl CallTransport for EthersTransport {
    async fn send_raw_call(&self, call: &RawCall) -> Result<Bytes, CallError> {
        let mut request = TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .data(call.data.clone())
            .gas(call.gas)
            .value(call.value);
        if let Some(gas_price) = call.gas_price {
            request = request.gas_price(gas_price);
        }
        let tx: TypedTransaction = request.into();

        let mut state = spoof::state();
        for (address, code) in call.overrides.iter() {
            state.account(*address).code(code.clone());
        }

        debug!(
            "[EthersTransport] eth_call to {:?} ({} bytes, {} override(s))",
            call.to,
            call.data.len(),
            call.overrides.len()
        );
        self.provider
            .call_raw(&tx)
            .block(self.block)
            .state(&state)
            .await
            .map_err(provider_error)
    }
}
