//! Integration tests for settings loading
//!
//! Tests cover:
//! - Loading a TOML file from disk
//! - SAMPLER_* environment overrides
//! - Building the aggregator from settings

use ethers::types::Chain;
use liquidity_sampler_sdk::types::Source;
use liquidity_sampler_sdk::Settings;
use std::io::Write;
use std::time::Duration;

const CONFIG: &str = r#"
[chain]
chain_id = 137
rpc_url = "http://polygon.invalid:8545"

[channel]
tick_interval_ms = 50
dispatcher_address = "0x00000000000000000000000000000000000d1500"

[sampler]
sources = ["quick_swap", "sushi_swap"]
max_cache_age_ms = 6000
contract_address = "0x0000000000000000000000000000000000005a00"

[log]
level = "debug"
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Values from the file override defaults, environment overrides the file
#[test]
fn test_settings_from_file_and_env() {
    let file = write_config(CONFIG);

    let settings = Settings::from_path(file.path()).unwrap();
    assert_eq!(settings.chain().unwrap(), Chain::Polygon);
    assert_eq!(settings.sampler.sources, vec![Source::QuickSwap, Source::SushiSwap]);
    assert_eq!(settings.sampler_max_cache_age(), Duration::from_secs(6));
    assert_eq!(settings.channel_config().tick_interval, Duration::from_millis(50));
    assert_eq!(settings.channel.max_batch_bytes, 512_000);
    assert_eq!(settings.log.level, "debug");

    std::env::set_var("SAMPLER_RPC_URL", "http://override.invalid:8545");
    std::env::set_var("SAMPLER_SOURCES", "sushi_swap");
    let overridden = Settings::from_path(file.path()).unwrap();
    std::env::remove_var("SAMPLER_RPC_URL");
    std::env::remove_var("SAMPLER_SOURCES");
    assert_eq!(overridden.chain.rpc_url, "http://override.invalid:8545");
    assert_eq!(overridden.sampler.sources, vec![Source::SushiSwap]);
}

/// The aggregator builds one sampler per configured source
#[tokio::test]
async fn test_aggregator_from_settings() {
    use liquidity_sampler_sdk::transport::EthersTransport;
    use liquidity_sampler_sdk::{CallChannel, SamplerAggregator};
    use std::sync::Arc;

    let settings = Settings::from_toml_str(CONFIG).unwrap();
    let transport = Arc::new(EthersTransport::from_url(&settings.chain.rpc_url).unwrap());
    let channel =
        CallChannel::new(transport, settings.dispatcher().unwrap(), settings.channel_config());
    let aggregator = SamplerAggregator::from_settings(&settings, channel).unwrap();
    assert_eq!(aggregator.available_sources(), vec![Source::SushiSwap, Source::QuickSwap]);
    assert!(!aggregator.token_graph().is_empty());
}

/// A source with no venue on the network fails at construction
#[tokio::test]
async fn test_unsupported_source_fails_eagerly() {
    use liquidity_sampler_sdk::transport::EthersTransport;
    use liquidity_sampler_sdk::{CallChannel, SamplerAggregator};
    use std::sync::Arc;

    let config = CONFIG.replace("\"quick_swap\"", "\"balancer\"");
    let settings = Settings::from_toml_str(&config).unwrap();
    let transport = Arc::new(EthersTransport::from_url(&settings.chain.rpc_url).unwrap());
    let channel =
        CallChannel::new(transport, settings.dispatcher().unwrap(), settings.channel_config());
    assert!(SamplerAggregator::from_settings(&settings, channel).is_err());
}
