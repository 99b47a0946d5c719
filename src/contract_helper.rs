// src/contract_helper.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ethers::abi::{Abi, Function, Token};
use ethers::types::{Address, Bytes, U256};

use crate::call_channel::{CallChannel, CallRequest, Overrides};
use crate::dispatcher::deterministic_address;
use crate::errors::{CallError, SamplerError, SamplerResult};
use crate::types::{DexSample, Source};

/// Where a helper's target contract lives.
#[derive(Debug, Clone)]
pub enum ContractDeployment {
    Deployed(Address),
    /// Not deployed: the bytecode is injected through overrides on every call.
    Simulated {
        bytecode: Bytes,
        address: Option<Address>,
    },
}

impl ContractDeployment {
    pub fn from_parts(address: Option<Address>, bytecode: Option<Bytes>) -> SamplerResult<Self> {
        match (address, bytecode) {
            (address, Some(bytecode)) if !bytecode.is_empty() => {
                Ok(Self::Simulated { bytecode, address })
            }
            (Some(address), _) => Ok(Self::Deployed(address)),
            (None, _) => Err(SamplerError::Configuration(
                "contract needs either an address or bytecode".to_string(),
            )),
        }
    }

    pub fn address(&self) -> Address {
        match self {
            Self::Deployed(address) => *address,
            Self::Simulated { bytecode, address } => {
                address.unwrap_or_else(|| deterministic_address(bytecode))
            }
        }
    }

    pub fn overrides(&self) -> Overrides {
        match self {
            Self::Deployed(_) => Overrides::default(),
            Self::Simulated { bytecode, .. } => {
                Overrides::with_code(self.address(), bytecode.clone())
            }
        }
    }
}

/// Per-call options. Unset fields fall back to the helper's defaults.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub value: Option<U256>,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub overrides: Overrides,
    pub max_cache_age: Option<Duration>,
    pub immediate: bool,
}

impl CallOptions {
    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_max_cache_age(mut self, max_age: Duration) -> Self {
        self.max_cache_age = Some(max_age);
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// `self` on top of `defaults`; override maps are merged key-wise.
    pub fn merged_with(&self, defaults: &CallOptions) -> CallOptions {
        let mut overrides = defaults.overrides.clone();
        overrides.merge(&self.overrides);
        CallOptions {
            value: self.value.or(defaults.value),
            gas: self.gas.or(defaults.gas),
            gas_price: self.gas_price.or(defaults.gas_price),
            overrides,
            max_cache_age: self.max_cache_age.or(defaults.max_cache_age),
            immediate: self.immediate || defaults.immediate,
        }
    }
}

pub type ResultDecoder = Arc<dyn Fn(&[u8]) -> SamplerResult<DexSample> + Send + Sync>;

/// A pre-encoded single-hop quote call that can be embedded in a larger
/// on-chain call instead of being dispatched on its own.
#[derive(Clone)]
pub struct MultiHopCallDescriptor {
    pub source: Source,
    pub target: Address,
    pub call_data: Bytes,
    pub overrides: Overrides,
    pub gas: Option<u64>,
    pub decoder: ResultDecoder,
}

impl MultiHopCallDescriptor {
    pub fn decode(&self, result: &[u8]) -> SamplerResult<DexSample> {
        (self.decoder)(result)
    }
}

impl fmt::Debug for MultiHopCallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHopCallDescriptor")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("call_data", &self.call_data)
            .field("overrides", &self.overrides.len())
            .field("gas", &self.gas)
            .finish()
    }
}

/// Typed calls against one contract, routed through a [`CallChannel`].
#[derive(Clone)]
pub struct ContractHelper {
    channel: CallChannel,
    abi: Arc<Abi>,
    deployment: ContractDeployment,
    defaults: CallOptions,
}

impl ContractHelper {
    pub fn new(channel: CallChannel, abi: Abi, deployment: ContractDeployment) -> Self {
        let defaults = CallOptions {
            overrides: deployment.overrides(),
            ..CallOptions::default()
        };
        Self {
            channel,
            abi: Arc::new(abi),
            deployment,
            defaults,
        }
    }

    /// Options applied under every call's own options.
    pub fn with_defaults(mut self, defaults: CallOptions) -> Self {
        self.defaults = defaults.merged_with(&CallOptions {
            overrides: self.deployment.overrides(),
            ..CallOptions::default()
        });
        self
    }

    pub fn address(&self) -> Address {
        self.deployment.address()
    }

    pub fn channel(&self) -> &CallChannel {
        &self.channel
    }

    pub fn defaults(&self) -> &CallOptions {
        &self.defaults
    }

    fn function(&self, name: &str) -> SamplerResult<&Function> {
        self.abi
            .function(name)
            .map_err(|_| SamplerError::UnknownFunction(name.to_string()))
    }

    pub fn encode_call_data(&self, function: &str, args: &[Token]) -> SamplerResult<Bytes> {
        Ok(Bytes::from(self.function(function)?.encode_input(args)?))
    }

    pub fn encode(
        &self,
        function: &str,
        args: &[Token],
        opts: &CallOptions,
    ) -> SamplerResult<CallRequest> {
        let data = self.encode_call_data(function, args)?;
        let opts = opts.merged_with(&self.defaults);
        Ok(CallRequest {
            to: self.address(),
            data,
            value: opts.value,
            gas: opts.gas,
            gas_price: opts.gas_price,
            overrides: opts.overrides,
            max_cache_age: opts.max_cache_age,
            immediate: opts.immediate,
        })
    }

    pub fn decode(&self, function: &str, data: &[u8]) -> SamplerResult<Vec<Token>> {
        decode_output(self.function(function)?, data)
    }

    pub async fn call(
        &self,
        function: &str,
        args: &[Token],
        opts: &CallOptions,
    ) -> SamplerResult<Vec<Token>> {
        let request = self.encode(function, args, opts)?;
        let result = self.channel.call(request).await?;
        self.decode(function, &result)
    }

    /// Encodes `function(args)` without dispatching it. `extract` maps the
    /// decoded return values of the embedded call to a sample.
    pub fn multi_hop_descriptor<F>(
        &self,
        source: Source,
        function: &str,
        args: &[Token],
        extract: F,
    ) -> SamplerResult<MultiHopCallDescriptor>
    where
        F: Fn(Vec<Token>) -> SamplerResult<DexSample> + Send + Sync + 'static,
    {
        let call_data = self.encode_call_data(function, args)?;
        let function = self.function(function)?.clone();
        Ok(MultiHopCallDescriptor {
            source,
            target: self.address(),
            call_data,
            overrides: self.defaults.overrides.clone(),
            gas: self.defaults.gas,
            decoder: Arc::new(move |data| extract(decode_output(&function, data)?)),
        })
    }
}

fn decode_output(function: &Function, data: &[u8]) -> SamplerResult<Vec<Token>> {
    function.decode_output(data).map_err(|_| {
        SamplerError::Call(CallError::Decode {
            function: function.name.clone(),
            data: Bytes::from(data.to_vec()),
        })
    })
}

/// The `uint256[]` a sampling function returns as its only output.
pub fn uint_array_output(function: &str, tokens: Vec<Token>) -> SamplerResult<Vec<U256>> {
    let amounts = match tokens.as_slice() {
        [Token::Array(values)] => values
            .iter()
            .map(|value| value.clone().into_uint())
            .collect::<Option<Vec<_>>>(),
        _ => None,
    };
    amounts.ok_or_else(|| {
        SamplerError::Call(CallError::Decode {
            function: function.to_string(),
            data: Bytes::from(ethers::abi::encode(&tokens)),
        })
    })
}
