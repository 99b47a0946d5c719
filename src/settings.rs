use config::{Config, ConfigError, File, FileFormat};
use ethers::types::{Address, Bytes, Chain};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::call_channel::ChannelConfig;
use crate::contract_helper::ContractDeployment;
use crate::dispatcher::{BatchLimits, DispatcherContract};
use crate::errors::{SamplerError, SamplerResult};
use crate::samplers::balancer::DEFAULT_BALANCER_SUBGRAPH_URL;
use crate::token_graph::{default_token_adjacency_graph, TokenAdjacencyGraph};
use crate::types::conversions::string_to_address;
use crate::types::Source;

#[derive(Debug, Deserialize, Clone)]
pub struct ChainSettings {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
}

fn default_chain_id() -> u64 {
    1 // Ethereum mainnet
}
fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            rpc_url: default_rpc_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_cache_retention_ms")]
    pub cache_retention_ms: u64,
    #[serde(default = "default_max_batch_gas")]
    pub max_batch_gas: u64,
    /// Calldata plus override code.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Queue fullness, in batches, that triggers an early flush.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: f64,
    #[serde(default = "default_call_gas")]
    pub default_call_gas: u64,
    #[serde(default)]
    pub dispatcher_address: Option<String>,
    /// Hex bytecode; when set the dispatcher is simulated through overrides.
    #[serde(default)]
    pub dispatcher_bytecode: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_cache_retention_ms() -> u64 {
    10_000
}
fn default_max_batch_gas() -> u64 {
    512_000_000
}
fn default_max_batch_bytes() -> usize {
    512_000
}
fn default_queue_capacity() -> f64 {
    1.5
}
fn default_call_gas() -> u64 {
    4_000_000
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            cache_retention_ms: default_cache_retention_ms(),
            max_batch_gas: default_max_batch_gas(),
            max_batch_bytes: default_max_batch_bytes(),
            queue_capacity: default_queue_capacity(),
            default_call_gas: default_call_gas(),
            dispatcher_address: None,
            dispatcher_bytecode: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplerSettings {
    #[serde(default = "default_sources")]
    pub sources: Vec<Source>,
    #[serde(default = "default_max_cache_age_ms")]
    pub max_cache_age_ms: u64,
    #[serde(default = "default_max_price_cache_age_ms")]
    pub max_price_cache_age_ms: u64,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub contract_bytecode: Option<String>,
}

fn default_sources() -> Vec<Source> {
    vec![Source::UniswapV2, Source::SushiSwap]
}
fn default_max_cache_age_ms() -> u64 {
    12_000 // one block
}
fn default_max_price_cache_age_ms() -> u64 {
    10_000
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            max_cache_age_ms: default_max_cache_age_ms(),
            max_price_cache_age_ms: default_max_price_cache_age_ms(),
            contract_address: None,
            contract_bytecode: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolCacheSettings {
    #[serde(default = "default_pool_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_balancer_subgraph_url")]
    pub balancer_subgraph_url: String,
    #[serde(default = "default_max_pools_fetched")]
    pub max_pools_fetched: usize,
    /// Pools preloaded from the subgraph at startup; 0 disables the preload.
    #[serde(default = "default_top_pools_fetched")]
    pub top_pools_fetched: usize,
}

fn default_pool_ttl_seconds() -> u64 {
    3600
}
fn default_balancer_subgraph_url() -> String {
    DEFAULT_BALANCER_SUBGRAPH_URL.to_string()
}
fn default_max_pools_fetched() -> usize {
    3
}
fn default_top_pools_fetched() -> usize {
    250
}

impl Default for PoolCacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_pool_ttl_seconds(),
            balancer_subgraph_url: default_balancer_subgraph_url(),
            max_pools_fetched: default_max_pools_fetched(),
            top_pools_fetched: default_top_pools_fetched(),
        }
    }
}

/// Replaces the network's built-in adjacency graph. Each entry is seeded with
/// `default` before its own tokens are appended.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TokenAdjacencySettings {
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub entries: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String, // "debug", "info", "warn"
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub chain: ChainSettings,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub sampler: SamplerSettings,
    #[serde(default)]
    pub pool_cache: PoolCacheSettings,
    #[serde(default)]
    pub token_adjacency: Option<TokenAdjacencySettings>,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    /// Loads `Config.toml` from the working directory, then applies
    /// `SAMPLER_*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(File::with_name("Config.toml"))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(File::from(path.as_ref()))
    }

    /// Parses settings from TOML text. Environment overrides are not applied.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn load<T>(source: T) -> Result<Self, ConfigError>
    where
        T: config::Source + Send + Sync + 'static,
    {
        let s = Config::builder().add_source(source).build()?;
        let mut settings: Self = s.try_deserialize()?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(rpc_url) = env::var("SAMPLER_RPC_URL") {
            let trimmed = rpc_url.trim();
            if !trimmed.is_empty() {
                self.chain.rpc_url = trimmed.to_string();
            }
        }
        if let Ok(chain_id) = env::var("SAMPLER_CHAIN_ID") {
            match chain_id.trim().parse() {
                Ok(id) => self.chain.chain_id = id,
                Err(e) => eprintln!("Failed to parse SAMPLER_CHAIN_ID: {}", e),
            }
        }
        if let Ok(raw_sources) = env::var("SAMPLER_SOURCES") {
            match parse_sources(&raw_sources) {
                Some(sources) if !sources.is_empty() => self.sampler.sources = sources,
                Some(_) => {}
                None => eprintln!("Failed to parse SAMPLER_SOURCES: {}", raw_sources),
            }
        }
    }

    /// # Errors
    ///
    /// `SamplerError::Configuration` for a chain id ethers does not know.
    pub fn chain(&self) -> SamplerResult<Chain> {
        Chain::try_from(self.chain.chain_id).map_err(|_| {
            SamplerError::Configuration(format!("unknown chain id {}", self.chain.chain_id))
        })
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            tick_interval: Duration::from_millis(self.channel.tick_interval_ms),
            cache_retention: Duration::from_millis(self.channel.cache_retention_ms),
            limits: BatchLimits {
                max_batch_gas: self.channel.max_batch_gas,
                max_batch_bytes: self.channel.max_batch_bytes,
                default_call_gas: self.channel.default_call_gas,
            },
            queue_capacity: self.channel.queue_capacity,
        }
    }

    pub fn dispatcher(&self) -> SamplerResult<DispatcherContract> {
        let address = parse_optional_address(self.channel.dispatcher_address.as_deref())?;
        let bytecode = parse_optional_bytecode(self.channel.dispatcher_bytecode.as_deref())?;
        match (address, bytecode) {
            (address, Some(bytecode)) => Ok(DispatcherContract::simulated(bytecode, address)),
            (Some(address), None) => Ok(DispatcherContract::deployed(address)),
            (None, None) => Err(SamplerError::Configuration(
                "[channel] needs dispatcher_address or dispatcher_bytecode".to_string(),
            )),
        }
    }

    pub fn sampler_deployment(&self) -> SamplerResult<ContractDeployment> {
        ContractDeployment::from_parts(
            parse_optional_address(self.sampler.contract_address.as_deref())?,
            parse_optional_bytecode(self.sampler.contract_bytecode.as_deref())?,
        )
    }

    /// Configured graph if present, otherwise the network default.
    pub fn token_graph(&self, chain: Chain) -> SamplerResult<TokenAdjacencyGraph> {
        let Some(adjacency) = &self.token_adjacency else {
            return default_token_adjacency_graph(chain);
        };
        let default = parse_addresses(&adjacency.default)?;
        let mut builder = TokenAdjacencyGraph::builder(default);
        for (token, adjacent) in &adjacency.entries {
            builder.add_in_place(string_to_address(token)?, parse_addresses(adjacent)?);
        }
        Ok(builder.build())
    }

    pub fn sampler_max_cache_age(&self) -> Duration {
        Duration::from_millis(self.sampler.max_cache_age_ms)
    }

    pub fn max_price_cache_age(&self) -> Duration {
        Duration::from_millis(self.sampler.max_price_cache_age_ms)
    }

    pub fn pool_ttl(&self) -> Duration {
        Duration::from_secs(self.pool_cache.ttl_seconds)
    }
}

fn parse_addresses(values: &[String]) -> SamplerResult<Vec<Address>> {
    values
        .iter()
        .map(|value| string_to_address(value).map_err(SamplerError::from))
        .collect()
}

fn parse_optional_address(value: Option<&str>) -> SamplerResult<Option<Address>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Ok(Some(string_to_address(value)?)),
    }
}

fn parse_optional_bytecode(value: Option<&str>) -> SamplerResult<Option<Bytes>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Bytes::from_str(value)
            .map(Some)
            .map_err(|e| SamplerError::Configuration(format!("invalid bytecode: {}", e))),
    }
}

/// JSON array (`["uniswap_v2","balancer"]`) or comma separated list.
fn parse_sources(input: &str) -> Option<Vec<Source>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).ok();
    }
    trimmed
        .split(',')
        .map(|name| serde_json::from_value(serde_json::Value::String(name.trim().to_string())).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let settings = Settings::from_toml_str("[chain]\nchain_id = 56\n").unwrap();
        assert_eq!(settings.chain().unwrap(), Chain::BinanceSmartChain);
        assert_eq!(settings.channel.max_batch_gas, 512_000_000);
        assert_eq!(settings.sampler_max_cache_age(), Duration::from_secs(12));
        assert_eq!(settings.pool_ttl(), Duration::from_secs(3600));
        assert_eq!(settings.channel_config().queue_capacity, 1.5);
    }

    #[test]
    fn sources_parse_from_json_or_comma_list() {
        assert_eq!(
            parse_sources(r#"["uniswap_v2","balancer"]"#),
            Some(vec![Source::UniswapV2, Source::Balancer])
        );
        assert_eq!(
            parse_sources("sushi_swap, quick_swap"),
            Some(vec![Source::SushiSwap, Source::QuickSwap])
        );
        assert_eq!(parse_sources("not_a_dex"), None);
    }

    #[test]
    fn bytecode_without_address_is_simulated_at_derived_address() {
        let settings = Settings::from_toml_str(
            r#"
            [channel]
            dispatcher_bytecode = "0x6080"
            [sampler]
            contract_address = "0x0000000000000000000000000000000000000042"
            "#,
        )
        .unwrap();
        let dispatcher = settings.dispatcher().unwrap();
        assert_eq!(dispatcher.address(), crate::dispatcher::deterministic_address(&[0x60, 0x80]));
        assert_eq!(dispatcher.overrides().len(), 1);
        assert_eq!(
            settings.sampler_deployment().unwrap().address(),
            Address::from_low_u64_be(0x42)
        );
    }

    #[test]
    fn missing_dispatcher_is_a_configuration_error() {
        let settings = Settings::default();
        assert!(matches!(settings.dispatcher(), Err(SamplerError::Configuration(_))));
        assert!(settings.sampler_deployment().is_err());
    }

    #[test]
    fn configured_adjacency_replaces_network_default() {
        let settings = Settings::from_toml_str(
            r#"
            [token_adjacency]
            default = ["0x0000000000000000000000000000000000000001"]
            [token_adjacency.entries]
            "0x0000000000000000000000000000000000000010" = ["0x0000000000000000000000000000000000000011"]
            "#,
        )
        .unwrap();
        let graph = settings.token_graph(Chain::Mainnet).unwrap();
        assert_eq!(graph.default_tokens(), &[Address::from_low_u64_be(1)]);
        assert_eq!(
            graph.adjacent_tokens(&Address::from_low_u64_be(0x10)),
            &[Address::from_low_u64_be(1), Address::from_low_u64_be(0x11)]
        );
    }
}
