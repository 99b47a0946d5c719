// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter,
};

/// Registers descriptions for every metric emitted by the SDK.
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        "sampler_call_cache_hits_total",
        "eth_calls answered from the call channel cache."
    );
    describe_counter!(
        "sampler_call_cache_misses_total",
        "Cacheable eth_calls that had to be dispatched."
    );
    describe_gauge!(
        "sampler_call_cache_entries",
        "Results currently held by the call channel cache."
    );
    describe_histogram!("sampler_call_batch_size", "Calls merged into one dispatched batch.");
    describe_counter!("sampler_dispatched_batches_total", "Batches sent to the node.");
    describe_counter!("sampler_dispatch_failures_total", "Batches rejected as a whole, by kind.");
    describe_counter!("sampler_source_failures_total", "Sampling branches that failed, by source.");
    describe_counter!("sampler_two_hop_dropped_total", "Two-hop paths dropped, by reason.");
    describe_counter!("sampler_pool_cache_refreshes_total", "Pool discovery fetches, by outcome.");
}

pub fn increment_call_cache_hit() {
    increment_counter!("sampler_call_cache_hits_total");
}

pub fn increment_call_cache_miss() {
    increment_counter!("sampler_call_cache_misses_total");
}

pub fn set_call_cache_size(size: f64) {
    gauge!("sampler_call_cache_entries", size);
}

pub fn record_call_batch_size(size: f64) {
    histogram!("sampler_call_batch_size", size);
}

pub fn increment_dispatched_batches() {
    increment_counter!("sampler_dispatched_batches_total");
}

pub fn increment_dispatch_failures(kind: &'static str) {
    increment_counter!("sampler_dispatch_failures_total", "kind" => kind);
}

pub fn increment_source_failures(source: &'static str) {
    increment_counter!("sampler_source_failures_total", "source" => source);
}

pub fn increment_two_hop_dropped(reason: &'static str) {
    increment_counter!("sampler_two_hop_dropped_total", "reason" => reason);
}

pub fn increment_pool_cache_refresh(outcome: &'static str) {
    increment_counter!("sampler_pool_cache_refreshes_total", "outcome" => outcome);
}
