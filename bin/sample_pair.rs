use anyhow::{anyhow, Result};
use clap::Parser;
use ethers::types::{Address, U256};
use log::info;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use liquidity_sampler_sdk::transport::EthersTransport;
use liquidity_sampler_sdk::{CallChannel, DexSample, SamplerAggregator, Settings, Source};

/// Samples one token pair across the configured sources and prints the result as JSON.
#[derive(Parser, Debug)]
#[command(name = "sample_pair", version)]
struct Args {
    /// Token sold
    #[arg(long)]
    taker: Address,

    /// Token bought
    #[arg(long)]
    maker: Address,

    /// Sell amounts in base units, comma separated
    #[arg(long, value_delimiter = ',', required = true, value_parser = parse_amount)]
    amounts: Vec<U256>,

    /// Sources to sample (defaults to every enabled source)
    #[arg(long, value_delimiter = ',', value_parser = parse_source)]
    sources: Vec<Source>,

    /// Also quote two-hop paths for the first amount
    #[arg(long)]
    two_hop: bool,

    #[arg(long, default_value = "Config.toml")]
    config: PathBuf,
}

fn parse_amount(raw: &str) -> Result<U256, String> {
    U256::from_dec_str(raw.trim()).map_err(|e| format!("invalid amount {}: {}", raw, e))
}

fn parse_source(raw: &str) -> Result<Source, String> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .map_err(|_| format!("unknown source {}", raw))
}

#[derive(Serialize)]
struct Report {
    taker: Address,
    maker: Address,
    sources: Vec<Source>,
    median_sell_rate: Decimal,
    samples: Vec<Vec<DexSample>>,
    two_hop_samples: Vec<DexSample>,
}

fn init_logging(settings: &Settings) {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&settings.log.level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    let _ = builder.try_init();

    #[cfg(feature = "observability")]
    {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&settings.log.level))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = Settings::from_path(&args.config)?;
    init_logging(&settings);

    #[cfg(feature = "observability")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new().install()?;
        liquidity_sampler_sdk::metrics::describe_metrics();
    }

    let transport = Arc::new(EthersTransport::from_url(&settings.chain.rpc_url)?);
    let channel = CallChannel::new(transport, settings.dispatcher()?, settings.channel_config());
    let aggregator = SamplerAggregator::from_settings(&settings, channel)?;

    let sources = if args.sources.is_empty() {
        aggregator.available_sources()
    } else {
        args.sources.clone()
    };
    let first_amount = *args.amounts.first().ok_or_else(|| anyhow!("no amounts given"))?;
    info!(
        "Sampling {:?} -> {:?} over {} sources, {} amounts",
        args.taker,
        args.maker,
        sources.len(),
        args.amounts.len()
    );

    let (median_sell_rate, samples) = tokio::join!(
        aggregator.median_sell_rate(&sources, args.taker, args.maker, first_amount),
        aggregator.sample_sells(&sources, args.taker, args.maker, &args.amounts),
    );
    let two_hop_samples = if args.two_hop {
        aggregator
            .two_hop_sell_samples(&sources, args.taker, args.maker, first_amount)
            .await
    } else {
        Vec::new()
    };

    let report = Report {
        taker: args.taker,
        maker: args.maker,
        sources,
        median_sell_rate: median_sell_rate?,
        samples,
        two_hop_samples,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
