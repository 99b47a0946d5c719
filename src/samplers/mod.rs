// Source Samplers Module
// Quote strategies for the on-chain sampler, one per source family

pub mod balancer;
pub mod uniswap_v2;

// Re-export the plugin trait
pub use crate::source_sampler::{OnChainSampler, QuoteStrategy, SourceSampler};
