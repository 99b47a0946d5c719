use ethers::abi::Abi;

/// Quote helper contract executed through state overrides. Every sampling
/// function is a view that returns one output per input amount, with zero for
/// amounts the venue cannot fill.
pub const ERC20_BRIDGE_SAMPLER_ABI_JSON: &str = r#"[
    {
        "type": "function",
        "name": "sampleSellsFromUniswapV2",
        "stateMutability": "view",
        "inputs": [
            {"name": "router", "type": "address"},
            {"name": "path", "type": "address[]"},
            {"name": "takerTokenAmounts", "type": "uint256[]"}
        ],
        "outputs": [{"name": "makerTokenAmounts", "type": "uint256[]"}]
    },
    {
        "type": "function",
        "name": "sampleBuysFromUniswapV2",
        "stateMutability": "view",
        "inputs": [
            {"name": "router", "type": "address"},
            {"name": "path", "type": "address[]"},
            {"name": "makerTokenAmounts", "type": "uint256[]"}
        ],
        "outputs": [{"name": "takerTokenAmounts", "type": "uint256[]"}]
    },
    {
        "type": "function",
        "name": "sampleSellsFromBalancer",
        "stateMutability": "view",
        "inputs": [
            {"name": "poolAddress", "type": "address"},
            {"name": "takerToken", "type": "address"},
            {"name": "makerToken", "type": "address"},
            {"name": "takerTokenAmounts", "type": "uint256[]"}
        ],
        "outputs": [{"name": "makerTokenAmounts", "type": "uint256[]"}]
    },
    {
        "type": "function",
        "name": "sampleBuysFromBalancer",
        "stateMutability": "view",
        "inputs": [
            {"name": "poolAddress", "type": "address"},
            {"name": "takerToken", "type": "address"},
            {"name": "makerToken", "type": "address"},
            {"name": "makerTokenAmounts", "type": "uint256[]"}
        ],
        "outputs": [{"name": "takerTokenAmounts", "type": "uint256[]"}]
    },
    {
        "type": "function",
        "name": "sampleTwoHopSell",
        "stateMutability": "view",
        "inputs": [
            {"name": "firstHopCalls", "type": "tuple[]", "components": [
                {"name": "to", "type": "address"},
                {"name": "data", "type": "bytes"}
            ]},
            {"name": "secondHopCalls", "type": "tuple[]", "components": [
                {"name": "to", "type": "address"},
                {"name": "data", "type": "bytes"}
            ]},
            {"name": "sellAmount", "type": "uint256"}
        ],
        "outputs": [
            {"name": "firstHopResults", "type": "tuple[]", "components": [
                {"name": "success", "type": "bool"},
                {"name": "resultData", "type": "bytes"}
            ]},
            {"name": "secondHopResults", "type": "tuple[]", "components": [
                {"name": "success", "type": "bool"},
                {"name": "resultData", "type": "bytes"}
            ]}
        ]
    },
    {
        "type": "function",
        "name": "sampleTwoHopBuy",
        "stateMutability": "view",
        "inputs": [
            {"name": "firstHopCalls", "type": "tuple[]", "components": [
                {"name": "to", "type": "address"},
                {"name": "data", "type": "bytes"}
            ]},
            {"name": "secondHopCalls", "type": "tuple[]", "components": [
                {"name": "to", "type": "address"},
                {"name": "data", "type": "bytes"}
            ]},
            {"name": "buyAmount", "type": "uint256"}
        ],
        "outputs": [
            {"name": "firstHopResults", "type": "tuple[]", "components": [
                {"name": "success", "type": "bool"},
                {"name": "resultData", "type": "bytes"}
            ]},
            {"name": "secondHopResults", "type": "tuple[]", "components": [
                {"name": "success", "type": "bool"},
                {"name": "resultData", "type": "bytes"}
            ]}
        ]
    }
]"#;

pub fn erc20_bridge_sampler_abi() -> Result<Abi, serde_json::Error> {
    serde_json::from_str(ERC20_BRIDGE_SAMPLER_ABI_JSON)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_exposes_every_sampling_function() {
        let abi = erc20_bridge_sampler_abi().unwrap();
        for name in [
            "sampleSellsFromUniswapV2",
            "sampleBuysFromUniswapV2",
            "sampleSellsFromBalancer",
            "sampleBuysFromBalancer",
            "sampleTwoHopSell",
            "sampleTwoHopBuy",
        ] {
            assert!(abi.function(name).is_ok(), "missing {}", name);
        }
    }
}
