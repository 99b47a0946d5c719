use ethers::abi::Token;
use ethers::types::{Address, Chain, U256};

use crate::errors::{SamplerError, SamplerResult};
use crate::source_sampler::{QuoteCall, QuoteStrategy};
use crate::types::conversions::string_to_address;
use crate::types::{FillData, Side, Source};

fn router_address(chain: Chain, source: Source) -> Option<&'static str> {
    match (chain, source) {
        (Chain::Mainnet, Source::UniswapV2) => Some("0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D"),
        (Chain::Mainnet, Source::SushiSwap) => Some("0xd9e1cE17f2641f24aE83637ab66a2cca9C378B9F"),
        (Chain::Mainnet, Source::CryptoCom) => Some("0xCeB90E4C17d626BE0fACd78b79c9c87d7ca181b3"),
        (Chain::BinanceSmartChain, Source::PancakeSwap) => {
            Some("0x05fF2B0DB69458A0750badebc4f9e13aDd608C7F")
        }
        (Chain::BinanceSmartChain, Source::PancakeSwapV2) => {
            Some("0x10ED43C718714eb63d5aA57B78B54704E256024E")
        }
        (Chain::BinanceSmartChain, Source::BakerySwap) => {
            Some("0xCDe540d7eAFE93aC5fE6233Bee57E1270D3E330F")
        }
        (Chain::BinanceSmartChain, Source::SushiSwap) => {
            Some("0x1b02dA8Cb0d097eB8D57A175b88c7D8b47997506")
        }
        (Chain::Polygon, Source::QuickSwap) => Some("0xa5E0829CaCEd8fFDD4De3c43696c57F7D7A678ff"),
        (Chain::Polygon, Source::SushiSwap) => Some("0x1b02dA8Cb0d097eB8D57A175b88c7D8b47997506"),
        (Chain::Polygon, Source::Dfyn) => Some("0xA102072A4C07F06EC3B4900FDC4C7B80b6c57429"),
        _ => None,
    }
}

pub fn is_uniswap_v2_fork(source: Source) -> bool {
    matches!(
        source,
        Source::UniswapV2
            | Source::SushiSwap
            | Source::CryptoCom
            | Source::PancakeSwap
            | Source::PancakeSwapV2
            | Source::BakerySwap
            | Source::QuickSwap
            | Source::Dfyn
    )
}

/// Quotes a Uniswap V2 router (or fork) for a full token path. The sampler
/// contract walks the router's `getAmountsOut` / `getAmountsIn`.
#[derive(Debug, Clone)]
pub struct UniswapV2Quotes {
    source: Source,
    router: Address,
}

impl UniswapV2Quotes {
    /// # Errors
    ///
    /// `SamplerError::Configuration` if `source` has no router on `chain`.
    pub fn new(chain: Chain, source: Source) -> SamplerResult<Self> {
        let router = router_address(chain, source).ok_or_else(|| {
            SamplerError::Configuration(format!("{} has no known router on {}", source, chain))
        })?;
        Ok(Self::with_router(source, string_to_address(router)?))
    }

    pub fn with_router(source: Source, router: Address) -> Self {
        Self { source, router }
    }

    pub fn router(&self) -> Address {
        self.router
    }
}

impl QuoteStrategy for UniswapV2Quotes {
    fn source(&self) -> Source {
        self.source
    }

    fn can_handle(&self, token_path: &[Address]) -> bool {
        token_path.len() >= 2 && token_path.windows(2).all(|pair| pair[0] != pair[1])
    }

    fn quote_calls(
        &self,
        side: Side,
        token_path: &[Address],
        amounts: &[U256],
    ) -> SamplerResult<Vec<QuoteCall>> {
        let function = match side {
            Side::Sell => "sampleSellsFromUniswapV2",
            Side::Buy => "sampleBuysFromUniswapV2",
        };
        Ok(vec![QuoteCall {
            function,
            args: vec![
                Token::Address(self.router),
                Token::Array(token_path.iter().copied().map(Token::Address).collect()),
                Token::Array(amounts.iter().copied().map(Token::Uint).collect()),
            ],
            fill_data: FillData::UniswapV2 {
                router: self.router,
                token_address_path: token_path.to_vec(),
            },
            gas: None,
        }])
    }
}
