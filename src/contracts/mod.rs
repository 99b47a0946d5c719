// Contracts Module - Public ABIs Only

pub mod erc20_bridge_sampler;

pub use erc20_bridge_sampler::{erc20_bridge_sampler_abi, ERC20_BRIDGE_SAMPLER_ABI_JSON};
