// src/token_graph.rs
//
// Candidate intermediate tokens for multi-hop paths.

use std::collections::HashMap;

use ethers::types::{Address, Chain};
use serde::Deserialize;

use crate::errors::{SamplerError, SamplerResult};
use crate::types::conversions::string_to_address;

/// Token -> ordered candidate intermediate tokens, with a `default` list for
/// tokens that have no entry of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenAdjacencyGraph {
    #[serde(default)]
    entries: HashMap<Address, Vec<Address>>,
    #[serde(default)]
    default: Vec<Address>,
}

impl TokenAdjacencyGraph {
    pub fn builder(default: Vec<Address>) -> TokenAdjacencyGraphBuilder {
        TokenAdjacencyGraphBuilder::new(default)
    }

    pub fn default_tokens(&self) -> &[Address] {
        &self.default
    }

    pub fn adjacent_tokens(&self, token: &Address) -> &[Address] {
        self.entries.get(token).map(Vec::as_slice).unwrap_or(&self.default)
    }

    /// Tokens adjacent to both `token_a` and `token_b`, in `token_a`'s order,
    /// never including either endpoint.
    pub fn intermediate_tokens(&self, token_a: &Address, token_b: &Address) -> Vec<Address> {
        let b_adjacent = self.adjacent_tokens(token_b);
        let mut intermediates = Vec::new();
        for token in self.adjacent_tokens(token_a) {
            if token == token_a || token == token_b {
                continue;
            }
            if b_adjacent.contains(token) && !intermediates.contains(token) {
                intermediates.push(*token);
            }
        }
        intermediates
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.default.is_empty()
    }
}

/// Builds a [`TokenAdjacencyGraph`]. A token's entry starts as a copy of the
/// default list the first time something is added for it.
#[derive(Debug, Clone)]
pub struct TokenAdjacencyGraphBuilder {
    graph: TokenAdjacencyGraph,
}

impl TokenAdjacencyGraphBuilder {
    pub fn new(default: Vec<Address>) -> Self {
        Self {
            graph: TokenAdjacencyGraph {
                entries: HashMap::new(),
                default,
            },
        }
    }

    /// Appends `to` tokens to `from`'s entry, skipping ones already present.
    pub fn add(mut self, from: Address, to: impl IntoIterator<Item = Address>) -> Self {
        self.add_in_place(from, to);
        self
    }

    pub fn add_bidirectional(mut self, a: Address, b: impl IntoIterator<Item = Address>) -> Self {
        for token in b {
            self.add_in_place(a, [token]);
            self.add_in_place(token, [a]);
        }
        self
    }

    /// Connects every token to every other token in `tokens`.
    pub fn add_complete_subgraph(mut self, tokens: &[Address]) -> Self {
        for (i, token) in tokens.iter().enumerate() {
            let others = tokens
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, other)| *other);
            self.add_in_place(*token, others);
        }
        self
    }

    /// Runs `f` on the builder, for conditional or looped additions inside a chain.
    pub fn tap(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }

    pub fn add_in_place(&mut self, from: Address, to: impl IntoIterator<Item = Address>) {
        let default = &self.graph.default;
        let entry = self
            .graph
            .entries
            .entry(from)
            .or_insert_with(|| default.clone());
        for token in to {
            if !entry.contains(&token) {
                entry.push(token);
            }
        }
    }

    pub fn build(self) -> TokenAdjacencyGraph {
        self.graph
    }
}

fn parse_tokens(tokens: &[&str]) -> SamplerResult<Vec<Address>> {
    tokens
        .iter()
        .map(|token| string_to_address(token).map_err(SamplerError::from))
        .collect()
}

/// Intermediate tokens used on a network when no graph is configured.
pub fn default_token_adjacency_graph(chain: Chain) -> SamplerResult<TokenAdjacencyGraph> {
    let graph = match chain {
        Chain::Mainnet => {
            let default = parse_tokens(&[
                "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", // WETH
                "0xdAC17F958D2ee523a2206206994597C13D831ec7", // USDT
                "0x6B175474E89094C44Da98b954EedeAC495271d0F", // DAI
                "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", // USDC
                "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", // WBTC
            ])?;
            let btc = parse_tokens(&[
                "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", // WBTC
                "0xEB4C2781e4ebA804CE9a9803C67d0893436bB27D", // renBTC
                "0xfE18be6b3Bd88A2D2A7f928d00292E7a9963CfC6", // sBTC
            ])?;
            TokenAdjacencyGraph::builder(default)
                .add_complete_subgraph(&btc)
                .build()
        }
        Chain::BinanceSmartChain => TokenAdjacencyGraph::builder(parse_tokens(&[
            "0xbb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c", // WBNB
            "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56", // BUSD
            "0x55d398326f99059fF775485246999027B3197955", // USDT
            "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d", // USDC
            "0x2170Ed0880ac9A755fd29B2688956BD959F933F8", // ETH
        ])?)
        .build(),
        Chain::Polygon => TokenAdjacencyGraph::builder(parse_tokens(&[
            "0x0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270", // WMATIC
            "0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619", // WETH
            "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174", // USDC
            "0x8f3Cf7ad23Cd3CaDbD9735AFf958023239c6A063", // DAI
            "0xc2132D05D31c914a87C6611C10748AEb04B58e8F", // USDT
        ])?)
        .build(),
        _ => TokenAdjacencyGraph::default(),
    };
    Ok(graph)
}
