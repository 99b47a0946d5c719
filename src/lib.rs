//! # Liquidity Sampler SDK
//!
//! A Rust library that samples DEX liquidity through read-only `eth_call`s and
//! turns the results into price curves for a quoting service.
//!
//! ## Overview
//!
//! The SDK owns the sampling layer of an aggregator. It does not plan routes
//! or execute swaps. It focuses on:
//!
//! - **Dispatch**: batching, deduplicating and caching `eth_call`s against one node
//! - **Sampling**: per-source quote strategies behind one plugin trait
//! - **Composition**: two-hop quotes through intermediate tokens in a single call
//! - **Aggregation**: source x path fan-out and median sell rates
//!
//! ## Architecture
//!
//! ### Call Channel
//! Queues calls for one tick, merges compatible calls into dispatcher batches
//! (shared gas price, non-conflicting code overrides, gas and size ceilings) and
//! caches results by a hash of the full request.
//!
//! ### Contract Layer
//! [`contract_helper::ContractHelper`] encodes and decodes typed calls against a
//! deployed or simulated contract and attaches its code override automatically.
//!
//! ### Sampler Layer
//! [`source_sampler::SourceSampler`] is the plugin boundary. Most sources are an
//! [`source_sampler::OnChainSampler`] over a [`source_sampler::QuoteStrategy`]
//! that only supplies venues and result extraction.
//!
//! ### Aggregation Layer
//! [`aggregator::SamplerAggregator`] expands pairs through the
//! [`token_graph::TokenAdjacencyGraph`] and isolates failing sources; the
//! [`two_hop::TwoHopComposer`] scores both legs of a two-hop path.
//!
//! ### Pool Discovery
//! [`pool_cache::PoolsCache`] keeps off-chain pool topology fresh with a single
//! in-flight refresh per pair.

// Core Types
/// Sources, samples and fill data
pub mod types;
/// Error taxonomy
pub mod errors;

// Dispatch Layer
/// Batched, cached read calls
pub mod call_channel;
/// Dispatcher ABI, batch partitioning and revert decoding
pub mod dispatcher;
/// Node transport
pub mod transport;

// Contracts (ABIs)
/// Sampler contract ABI
pub mod contracts;
/// Typed calls against one contract
pub mod contract_helper;

// Sampling Layer
/// Source sampler plugin trait and on-chain base implementation
pub mod source_sampler;
/// Per-protocol quote strategies
pub mod samplers;
/// Two-hop quote composition
pub mod two_hop;
/// Intermediate token candidates per network
pub mod token_graph;
/// Source x path fan-out and median rates
pub mod aggregator;
/// TTL cache over off-chain pool discovery
pub mod pool_cache;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

#[cfg(test)]
mod test_utils;

// Re-exports for convenience
pub use aggregator::SamplerAggregator;
pub use call_channel::{CallChannel, CallRequest};
pub use contract_helper::ContractHelper;
pub use errors::{CallError, SamplerError};
pub use settings::Settings;
pub use source_sampler::SourceSampler;
pub use types::{DexSample, Source};
