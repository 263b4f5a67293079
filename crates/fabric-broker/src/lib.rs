//! Embedded message broker.
//!
//! Every element identity owns at most one producer channel and one consumer
//! channel. Producers address consumers by identity; each consumer identity
//! has a buffered queue that outlives individual consumer handles, so
//! messages survive a consumer (or whole broker) restart. A queue exists from
//! the first `create_consumer` for an identity until `remove_consumer`.
//!
//! The `test-util` feature exposes fault injection for channel repair tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info};

pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker is not running")]
    NotRunning,
    #[error("channel for {0} is closed")]
    ChannelClosed(String),
    #[error("broker memory limit of {limit} bytes reached")]
    MemoryLimit { limit: usize },
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Channel management surface used by the message bus.
///
/// Only the bus creates or destroys channels; producers and consumers are
/// handed out as cheap cloneable handles.
pub trait Broker: Send + Sync {
    fn start(&self) -> BrokerResult<()>;
    fn stop(&self) -> BrokerResult<()>;
    fn is_active(&self) -> bool;
    fn set_memory_limit(&self, bytes: usize);
    fn create_producer(&self, name: &str) -> BrokerResult<Producer>;
    fn remove_producer(&self, name: &str);
    fn is_producer_closed(&self, name: &str) -> bool;
    fn create_consumer(&self, name: &str) -> BrokerResult<Consumer>;
    fn remove_consumer(&self, name: &str);
    fn is_consumer_closed(&self, name: &str) -> bool;
}

#[derive(Debug, Default)]
struct ChannelState {
    closed: AtomicBool,
}

impl ChannelState {
    /// Returns true only for the call that actually closed the channel.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct Queue {
    items: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

#[derive(Debug)]
struct BrokerInner {
    active: AtomicBool,
    memory_limit: AtomicUsize,
    used_bytes: AtomicUsize,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    producers: RwLock<HashMap<String, Arc<ChannelState>>>,
    consumers: RwLock<HashMap<String, Arc<ChannelState>>>,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Arc<Queue> {
        if let Some(queue) = self.queues.read().get(name) {
            return Arc::clone(queue);
        }
        let mut guard = self.queues.write();
        Arc::clone(guard.entry(name.to_string()).or_default())
    }

    fn reserve(&self, bytes: usize) -> BrokerResult<()> {
        let limit = self.memory_limit.load(Ordering::SeqCst);
        let previous = self.used_bytes.fetch_add(bytes, Ordering::SeqCst);
        if previous.saturating_add(bytes) > limit {
            self.used_bytes.fetch_sub(bytes, Ordering::SeqCst);
            return Err(BrokerError::MemoryLimit { limit });
        }
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// Write side of an element's channel.
#[derive(Debug, Clone)]
pub struct Producer {
    name: Arc<str>,
    state: Arc<ChannelState>,
    broker: Arc<BrokerInner>,
}

impl Producer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues `payload` for every addressed consumer identity and returns
    /// the number of queues it was delivered to. Identities without a
    /// consumer queue are skipped.
    pub fn send<I, S>(&self, addresses: I, payload: Bytes) -> BrokerResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.state.is_closed() {
            return Err(BrokerError::ChannelClosed(self.name.to_string()));
        }
        if !self.broker.active.load(Ordering::SeqCst) {
            return Err(BrokerError::NotRunning);
        }

        // Held until the payload is queued so a concurrent remove_consumer
        // cannot leave reserved bytes in a detached queue.
        let registered = self.broker.queues.read();
        let mut queues = Vec::new();
        for address in addresses {
            let address = address.as_ref();
            match registered.get(address) {
                Some(queue) => queues.push(Arc::clone(queue)),
                None => debug!(producer = %self.name, consumer = %address, "no consumer queue, skipping"),
            }
        }
        self.broker.reserve(payload.len() * queues.len())?;

        for queue in &queues {
            queue.items.lock().push_back(payload.clone());
            queue.notify.notify_one();
        }
        Ok(queues.len())
    }

    pub fn close(&self) {
        if self.state.close() {
            debug!(producer = %self.name, "producer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// Read side of an element's channel.
#[derive(Debug, Clone)]
pub struct Consumer {
    name: Arc<str>,
    state: Arc<ChannelState>,
    queue: Arc<Queue>,
    broker: Arc<BrokerInner>,
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_recv(&self) -> BrokerResult<Option<Bytes>> {
        if self.state.is_closed() {
            return Err(BrokerError::ChannelClosed(self.name.to_string()));
        }
        let next = self.queue.items.lock().pop_front();
        if let Some(payload) = &next {
            self.broker.release(payload.len());
        }
        Ok(next)
    }

    /// Waits for the next message. Resolves with `ChannelClosed` as soon as
    /// the consumer is closed, even while parked.
    pub async fn recv(&self) -> BrokerResult<Bytes> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(payload) = self.try_recv()? {
                return Ok(payload);
            }
            notified.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.items.lock().len()
    }

    pub fn close(&self) {
        if self.state.close() {
            debug!(consumer = %self.name, "consumer closed");
        }
        self.queue.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// In-process broker with per-identity queues and a global memory budget.
#[derive(Debug, Clone)]
pub struct EmbeddedBroker {
    inner: Arc<BrokerInner>,
}

impl Default for EmbeddedBroker {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT_BYTES)
    }
}

impl EmbeddedBroker {
    pub fn new(memory_limit_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                active: AtomicBool::new(false),
                memory_limit: AtomicUsize::new(memory_limit_bytes),
                used_bytes: AtomicUsize::new(0),
                queues: RwLock::new(HashMap::new()),
                producers: RwLock::new(HashMap::new()),
                consumers: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn memory_limit(&self) -> usize {
        self.inner.memory_limit.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> usize {
        self.inner.used_bytes.load(Ordering::SeqCst)
    }

    /// Number of messages buffered for a consumer identity.
    #[cfg(any(test, feature = "test-util"))]
    pub fn queued(&self, name: &str) -> usize {
        self.inner
            .queues
            .read()
            .get(name)
            .map(|queue| queue.items.lock().len())
            .unwrap_or(0)
    }

    /// Marks the producer channel of `name` as failed without removing it.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_producer(&self, name: &str) {
        if let Some(state) = self.inner.producers.read().get(name) {
            state.close();
        }
    }

    /// Marks the consumer channel of `name` as failed without removing it.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_consumer(&self, name: &str) {
        if let Some(state) = self.inner.consumers.read().get(name) {
            state.close();
        }
        if let Some(queue) = self.inner.queues.read().get(name) {
            queue.notify.notify_waiters();
        }
    }
}

impl Broker for EmbeddedBroker {
    fn start(&self) -> BrokerResult<()> {
        if !self.inner.active.swap(true, Ordering::SeqCst) {
            info!(
                memory_limit = self.memory_limit(),
                "embedded broker started"
            );
        }
        Ok(())
    }

    fn stop(&self) -> BrokerResult<()> {
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);
        for (_, state) in self.inner.producers.write().drain() {
            state.close();
        }
        for (_, state) in self.inner.consumers.write().drain() {
            state.close();
        }
        for queue in self.inner.queues.read().values() {
            queue.notify.notify_waiters();
        }
        if was_active {
            info!("embedded broker stopped");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn set_memory_limit(&self, bytes: usize) {
        self.inner.memory_limit.store(bytes, Ordering::SeqCst);
        info!(memory_limit = bytes, "broker memory limit updated");
    }

    fn create_producer(&self, name: &str) -> BrokerResult<Producer> {
        if !self.is_active() {
            return Err(BrokerError::NotRunning);
        }
        let state = Arc::new(ChannelState::default());
        let previous = self
            .inner
            .producers
            .write()
            .insert(name.to_string(), Arc::clone(&state));
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(Producer {
            name: Arc::from(name),
            state,
            broker: Arc::clone(&self.inner),
        })
    }

    fn remove_producer(&self, name: &str) {
        if let Some(state) = self.inner.producers.write().remove(name) {
            state.close();
        }
    }

    fn is_producer_closed(&self, name: &str) -> bool {
        self.inner
            .producers
            .read()
            .get(name)
            .map(|state| state.is_closed())
            .unwrap_or(true)
    }

    fn create_consumer(&self, name: &str) -> BrokerResult<Consumer> {
        if !self.is_active() {
            return Err(BrokerError::NotRunning);
        }
        let state = Arc::new(ChannelState::default());
        let previous = self
            .inner
            .consumers
            .write()
            .insert(name.to_string(), Arc::clone(&state));
        let queue = self.inner.queue(name);
        if let Some(previous) = previous {
            previous.close();
            queue.notify.notify_waiters();
        }
        Ok(Consumer {
            name: Arc::from(name),
            state,
            queue,
            broker: Arc::clone(&self.inner),
        })
    }

    fn remove_consumer(&self, name: &str) {
        if let Some(state) = self.inner.consumers.write().remove(name) {
            state.close();
        }
        if let Some(queue) = self.inner.queues.write().remove(name) {
            let released: usize = queue.items.lock().drain(..).map(|p| p.len()).sum();
            self.inner.release(released);
            queue.notify.notify_waiters();
        }
    }

    fn is_consumer_closed(&self, name: &str) -> bool {
        self.inner
            .consumers
            .read()
            .get(name)
            .map(|state| state.is_closed())
            .unwrap_or(true)
    }
}
