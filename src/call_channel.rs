// src/call_channel.rs
//
// Batched, cached eth_call dispatch.
//
// Callers submit independent read calls; a tick loop drains the pending
// queue on a fixed interval, partitions it into compatible batches and sends
// each batch as one eth_call through the dispatcher contract.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::dispatcher::{
    decode_revert_reason, estimated_call_bytes, merge_batch, partition_batches, BatchLimits,
    DispatcherContract,
};
use crate::errors::CallError;
use crate::metrics;
use crate::transport::CallTransport;

pub type CallResult = Result<Bytes, CallError>;

/// Stable hash of a request's call fields.
pub type CallId = H256;

/// Replacement bytecode per address, applied for the duration of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides(BTreeMap<Address, Bytes>);

impl Overrides {
    pub fn with_code(address: Address, code: Bytes) -> Self {
        let mut overrides = Self::default();
        overrides.insert(address, code);
        overrides
    }

    pub fn insert(&mut self, address: Address, code: Bytes) -> Option<Bytes> {
        self.0.insert(address, code)
    }

    pub fn get(&self, address: &Address) -> Option<&Bytes> {
        self.0.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Bytes)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `other` replaces an address we also replace, with different code.
    pub fn conflicts_with(&self, other: &Overrides) -> bool {
        other
            .iter()
            .any(|(address, code)| self.0.get(address).map_or(false, |existing| existing != code))
    }

    /// Copies every entry of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: &Overrides) {
        for (address, code) in other.iter() {
            self.0.insert(*address, code.clone());
        }
    }

    pub fn code_len(&self) -> usize {
        self.0.values().map(|code| code.len()).sum()
    }
}

/// A read-only call as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: Option<U256>,
    pub gas: Option<u64>,
    pub gas_price: Option<U256>,
    pub overrides: Overrides,
    /// Accept a cached result no older than this.
    pub max_cache_age: Option<Duration>,
    /// Dispatch alone, bypassing the queue.
    pub immediate: bool,
}

impl CallRequest {
    pub fn new(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: None,
            gas: None,
            gas_price: None,
            overrides: Overrides::default(),
            max_cache_age: None,
            immediate: false,
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_gas_price(mut self, gas_price: U256) -> Self {
        self.gas_price = Some(gas_price);
        self
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_max_cache_age(mut self, max_age: Duration) -> Self {
        self.max_cache_age = Some(max_age);
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Hash over `{to, data, value, gas, gas_price, overrides}`.
    ///
    /// Every variable-length field is length-prefixed and optional fields
    /// carry a presence tag, so distinct requests never serialize alike.
    /// Overrides iterate in address order.
    pub fn cache_key(&self) -> CallId {
        let mut buf = Vec::with_capacity(128 + self.data.len() + self.overrides.code_len());
        buf.extend_from_slice(self.to.as_bytes());
        push_bytes(&mut buf, &self.data);
        push_u256(&mut buf, self.value);
        match self.gas {
            Some(gas) => {
                buf.push(1);
                buf.extend_from_slice(&gas.to_be_bytes());
            }
            None => buf.push(0),
        }
        push_u256(&mut buf, self.gas_price);
        buf.extend_from_slice(&(self.overrides.len() as u64).to_be_bytes());
        for (address, code) in self.overrides.iter() {
            buf.extend_from_slice(address.as_bytes());
            push_bytes(&mut buf, code);
        }
        H256(keccak256(buf))
    }
}

impl AsRef<CallRequest> for CallRequest {
    fn as_ref(&self) -> &CallRequest {
        self
    }
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_u256(buf: &mut Vec<u8>, value: Option<U256>) {
    match value {
        Some(value) => {
            buf.push(1);
            let mut word = [0u8; 32];
            value.to_big_endian(&mut word);
            buf.extend_from_slice(&word);
        }
        None => buf.push(0),
    }
}

/// Completion handle of one queued call. Delivers at most one result to the
/// waiters it holds.
#[derive(Debug)]
pub struct Settlement {
    waiters: Option<Vec<oneshot::Sender<CallResult>>>,
}

impl Settlement {
    pub fn new(waiter: oneshot::Sender<CallResult>) -> Self {
        Self {
            waiters: Some(vec![waiter]),
        }
    }

    /// Delivers `result` to every waiter. Returns `false`, delivering
    /// nothing, if this settlement was already resolved.
    pub fn resolve(&mut self, result: CallResult) -> bool {
        match self.waiters.take() {
            Some(waiters) => {
                for waiter in waiters {
                    // The caller may have dropped its handle.
                    let _ = waiter.send(result.clone());
                }
                true
            }
            None => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.waiters.is_none()
    }

    fn absorb(&mut self, other: Settlement) {
        if let (Some(waiters), Some(more)) = (self.waiters.as_mut(), other.waiters) {
            waiters.extend(more);
        }
    }
}

/// Result handle returned by [`CallChannel::submit`].
#[derive(Debug)]
pub struct PendingCall {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CallError::ChannelClosed)))
    }
}

struct QueuedCall {
    id: CallId,
    request: CallRequest,
    settlement: Settlement,
    cache_result: bool,
}

impl AsRef<CallRequest> for QueuedCall {
    fn as_ref(&self) -> &CallRequest {
        &self.request
    }
}

#[derive(Debug, Clone)]
struct CachedCallResult {
    result: CallResult,
    cached_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub tick_interval: Duration,
    /// Cached results older than this are purged on every tick.
    pub cache_retention: Duration,
    pub limits: BatchLimits,
    /// Queue fullness, in batches, that forces a flush before the next tick.
    pub queue_capacity: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            cache_retention: Duration::from_secs(10),
            limits: BatchLimits::default(),
            queue_capacity: 1.5,
        }
    }
}

#[derive(Default)]
struct ChannelState {
    queue: IndexMap<CallId, QueuedCall>,
    queue_fullness: f64,
    cache: HashMap<CallId, CachedCallResult>,
}

struct ChannelInner {
    transport: Arc<dyn CallTransport>,
    dispatcher: DispatcherContract,
    config: ChannelConfig,
    caller: Address,
    state: Mutex<ChannelState>,
}

/// Batches and caches read calls against one node.
///
/// Cloning is cheap and every clone shares the same queue and cache. The
/// tick loop stops once the last clone is dropped.
#[derive(Clone)]
pub struct CallChannel {
    inner: Arc<ChannelInner>,
}

impl CallChannel {
    /// Must be called from within a tokio runtime; spawns the tick loop.
    pub fn new(
        transport: Arc<dyn CallTransport>,
        dispatcher: DispatcherContract,
        config: ChannelConfig,
    ) -> Self {
        let tick_interval = config.tick_interval;
        let inner = Arc::new(ChannelInner {
            transport,
            dispatcher,
            config,
            caller: Address::random(),
            state: Mutex::new(ChannelState::default()),
        });
        spawn_ticker(Arc::downgrade(&inner), tick_interval);
        Self { inner }
    }

    pub fn dispatcher(&self) -> &DispatcherContract {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Queues `request` and returns a handle resolving to its result.
    pub fn submit(&self, request: CallRequest) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut settlement = Settlement::new(tx);
        let id = request.cache_key();

        let mut state = self.inner.state();
        if let Some(max_age) = request.max_cache_age {
            let cached = state
                .cache
                .get(&id)
                .filter(|c| c.cached_at.elapsed() <= max_age);
            if let Some(cached) = cached {
                metrics::increment_call_cache_hit();
                settlement.resolve(cached.result.clone());
                return PendingCall { rx };
            }
            metrics::increment_call_cache_miss();
        }

        let queued = QueuedCall {
            id,
            cache_result: request.max_cache_age.is_some(),
            request,
            settlement,
        };

        if queued.request.immediate {
            drop(state);
            tokio::spawn(self.inner.clone().execute(vec![queued]));
            return PendingCall { rx };
        }

        if let Some(existing) = state.queue.get_mut(&id) {
            existing.settlement.absorb(queued.settlement);
            existing.cache_result |= queued.cache_result;
            return PendingCall { rx };
        }

        state.queue_fullness += self.inner.call_fullness(&queued.request);
        state.queue.insert(id, queued);
        if state.queue_fullness >= self.inner.config.queue_capacity {
            let drained = state.drain_queue();
            drop(state);
            debug!("[CallChannel] queue at capacity, flushing {} calls early", drained.len());
            tokio::spawn(self.inner.clone().execute(drained));
        }
        PendingCall { rx }
    }

    pub async fn call(&self, request: CallRequest) -> CallResult {
        self.submit(request).await
    }

    /// Dispatches everything queued so far without waiting for the tick.
    pub fn flush(&self) {
        let drained = self.inner.state().drain_queue();
        if !drained.is_empty() {
            tokio::spawn(self.inner.clone().execute(drained));
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn cached_results(&self) -> usize {
        self.inner.state().cache.len()
    }
}

impl ChannelState {
    fn drain_queue(&mut self) -> Vec<QueuedCall> {
        self.queue_fullness = 0.0;
        self.queue.drain(..).map(|(_, call)| call).collect()
    }
}

impl ChannelInner {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call_fullness(&self, request: &CallRequest) -> f64 {
        let limits = &self.config.limits;
        let gas = request.gas.unwrap_or(limits.default_call_gas) as f64;
        let bytes = estimated_call_bytes(request) as f64;
        (gas / limits.max_batch_gas.max(1) as f64).max(bytes / limits.max_batch_bytes.max(1) as f64)
    }

    fn tick(self: &Arc<Self>) {
        let drained = {
            let mut state = self.state();
            let retention = self.config.cache_retention;
            state.cache.retain(|_, cached| cached.cached_at.elapsed() < retention);
            metrics::set_call_cache_size(state.cache.len() as f64);
            state.drain_queue()
        };
        if !drained.is_empty() {
            tokio::spawn(self.clone().execute(drained));
        }
    }

    async fn execute(self: Arc<Self>, calls: Vec<QueuedCall>) {
        let batches = partition_batches(calls, &self.config.limits);
        debug!("[CallChannel] dispatching {} batch(es)", batches.len());
        join_all(batches.into_iter().map(|batch| self.dispatch_batch(batch))).await;
    }

    async fn dispatch_batch(&self, batch: Vec<QueuedCall>) {
        metrics::record_call_batch_size(batch.len() as f64);
        let merged = {
            let requests: Vec<&CallRequest> = batch.iter().map(|call| &call.request).collect();
            merge_batch(
                &requests,
                self.caller,
                &self.dispatcher,
                self.config.limits.default_call_gas,
            )
        };
        let raw = match merged {
            Ok(raw) => raw,
            Err(e) => return self.reject_all(batch, e),
        };

        metrics::increment_dispatched_batches();
        let data = match self.transport.send_raw_call(&raw).await {
            Ok(data) => data,
            Err(e) => {
                warn!("[CallChannel] batch of {} call(s) failed: {}", batch.len(), e);
                metrics::increment_dispatch_failures("transport");
                return self.reject_all(batch, e);
            }
        };
        if data.is_empty() {
            metrics::increment_dispatch_failures("empty");
            return self.reject_all(batch, CallError::EmptyResult);
        }

        if batch.len() == 1 {
            for call in batch {
                self.settle(call, Ok(data.clone()));
            }
            return;
        }

        let results = match self.dispatcher.decode_results(&data) {
            Ok(results) if results.len() == batch.len() => results,
            Ok(results) => {
                metrics::increment_dispatch_failures("length_mismatch");
                let e = CallError::BatchLengthMismatch {
                    expected: batch.len(),
                    actual: results.len(),
                };
                return self.reject_all(batch, e);
            }
            Err(e) => {
                metrics::increment_dispatch_failures("decode");
                return self.reject_all(batch, e);
            }
        };

        for (call, (success, result_data)) in batch.into_iter().zip(results) {
            let result = if success {
                Ok(result_data)
            } else {
                Err(CallError::Reverted {
                    reason: decode_revert_reason(&result_data),
                    data: result_data,
                })
            };
            self.settle(call, result);
        }
    }

    fn reject_all(&self, batch: Vec<QueuedCall>, error: CallError) {
        for call in batch {
            self.settle(call, Err(error.clone()));
        }
    }

    fn settle(&self, call: QueuedCall, result: CallResult) {
        let QueuedCall {
            id,
            mut settlement,
            cache_result,
            ..
        } = call;
        let cacheable = match &result {
            Ok(_) => true,
            Err(e) => e.is_revert(),
        };
        if cache_result && cacheable {
            self.state().cache.insert(
                id,
                CachedCallResult {
                    result: result.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        settlement.resolve(result);
    }
}

fn spawn_ticker(inner: Weak<ChannelInner>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                debug!("[CallChannel] channel dropped, stopping tick loop");
                break;
            };
            inner.tick();
        }
    });
}
