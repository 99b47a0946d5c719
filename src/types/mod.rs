// src/types/mod.rs

pub mod conversions;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A family of venues that share one interaction pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    UniswapV2,
    SushiSwap,
    CryptoCom,
    PancakeSwap,
    PancakeSwapV2,
    BakerySwap,
    QuickSwap,
    Dfyn,
    Balancer,
    MultiHop,
}

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::UniswapV2 => "uniswap_v2",
            Source::SushiSwap => "sushi_swap",
            Source::CryptoCom => "crypto_com",
            Source::PancakeSwap => "pancake_swap",
            Source::PancakeSwapV2 => "pancake_swap_v2",
            Source::BakerySwap => "bakery_swap",
            Source::QuickSwap => "quick_swap",
            Source::Dfyn => "dfyn",
            Source::Balancer => "balancer",
            Source::MultiHop => "multi_hop",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source-specific payload needed later to build an execution instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FillData {
    UniswapV2 {
        router: Address,
        token_address_path: Vec<Address>,
    },
    Balancer {
        pool_address: Address,
    },
    TwoHop(Box<TwoHopFillData>),
    /// Payload of adapters registered from outside this crate.
    Custom { payload: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TwoHopFillData {
    pub first_hop: DexSample,
    pub second_hop: DexSample,
    pub intermediate_token: Address,
}

/// One point on a source's price curve.
///
/// For sells `input_amount` is the taker amount sold and `output_amount` the
/// maker amount received. For buys `input_amount` is the maker amount bought
/// and `output_amount` the taker amount required.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DexSample {
    pub source: Source,
    pub fill_data: FillData,
    pub input_amount: U256,
    pub output_amount: U256,
}

impl DexSample {
    pub fn new(
        source: Source,
        fill_data: FillData,
        input_amount: U256,
        output_amount: U256,
    ) -> Self {
        Self {
            source,
            fill_data,
            input_amount,
            output_amount,
        }
    }

    pub fn is_fillable(&self) -> bool {
        !self.output_amount.is_zero()
    }
}

/// Sell or buy side of a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Sell,
    Buy,
}
