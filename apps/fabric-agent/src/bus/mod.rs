//! Local message bus: keeps one publisher per routed source element and one
//! receiver per subscribed element in step with the routing table.

mod health;
mod publisher;
mod receiver;
mod speed;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fabric_broker::{Broker, BrokerError};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::id_generator::MessageIdGenerator;
use crate::message::{CodecError, Message};
use crate::routing::{RouteSource, RoutingTable};
use crate::status::{AgentStatus, ModuleKind};
use crate::supervisor::{Module, ModuleActivity};

pub use health::{HealthMonitor, HealthReport};
pub use publisher::Publisher;
pub use receiver::{DiscardSink, RealtimeSink, Receiver};
pub use speed::SpeedMeter;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no publisher registered for element {0}")]
    NoPublisher(String),
    #[error("no receiver registered for element {0}")]
    NoReceiver(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub memory_limit_bytes: usize,
    pub health_check_interval: Duration,
    pub speed_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: fabric_broker::DEFAULT_MEMORY_LIMIT_BYTES,
            health_check_interval: Duration::from_secs(5),
            speed_interval: Duration::from_secs(60),
        }
    }
}

/// Immutable view of the reconciled routing state. Replaced wholesale.
#[derive(Debug, Default)]
struct Topology {
    routes: RoutingTable,
    publishers: HashMap<String, Arc<Publisher>>,
    receivers: HashMap<String, Arc<Receiver>>,
}

impl Topology {
    /// Receivers first, then publishers.
    fn close_all(&self) {
        for receiver in self.receivers.values() {
            receiver.close();
        }
        for publisher in self.publishers.values() {
            publisher.close();
        }
    }
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<MessageBusInner>,
}

struct MessageBusInner {
    broker: Arc<dyn Broker>,
    route_source: Arc<dyn RouteSource>,
    sink: Arc<dyn RealtimeSink>,
    status: Arc<AgentStatus>,
    ids: MessageIdGenerator,
    config: BusConfig,
    topology: RwLock<Arc<Topology>>,
    update_lock: Mutex<()>,
}

impl MessageBus {
    pub fn new(
        broker: Arc<dyn Broker>,
        route_source: Arc<dyn RouteSource>,
        sink: Arc<dyn RealtimeSink>,
        status: Arc<AgentStatus>,
        config: BusConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MessageBusInner {
                broker,
                route_source,
                sink,
                status,
                ids: MessageIdGenerator::new(),
                config,
                topology: RwLock::new(Arc::new(Topology::default())),
                update_lock: Mutex::new(()),
            }),
        }
    }

    pub fn status(&self) -> &Arc<AgentStatus> {
        &self.inner.status
    }

    /// Starts the broker and builds the initial topology.
    pub fn start(&self) -> Result<(), BusError> {
        info!("starting message bus");
        self.inner
            .broker
            .set_memory_limit(self.inner.config.memory_limit_bytes);
        if let Err(err) = self.inner.broker.start() {
            if let Err(stop_err) = self.inner.broker.stop() {
                debug!(error = %stop_err, "broker stop after failed start");
            }
            return Err(err.into());
        }
        self.init();
        info!("message bus started");
        Ok(())
    }

    /// Rebuilds every publisher and receiver from the current routing
    /// table. Counters and real-time flags of identities that stay routed
    /// carry over.
    pub fn init(&self) {
        let _guard = self.inner.update_lock.lock();
        let previous = self.topology();
        let routes = self.inner.route_source.routes();

        previous.close_all();

        let mut next = Topology {
            routes,
            ..Topology::default()
        };
        for (element_id, route) in next.routes.routes() {
            let published = previous
                .publishers
                .get(element_id)
                .map(|publisher| publisher.published_count())
                .unwrap_or(0);
            if let Some(publisher) = self.create_publisher(element_id, route.clone(), published) {
                next.publishers.insert(element_id.clone(), publisher);
            }
        }
        for element_id in next.routes.receivers() {
            let realtime = previous
                .receivers
                .get(&element_id)
                .map(|receiver| receiver.is_realtime())
                .unwrap_or(false);
            if let Some(receiver) = self.create_receiver(&element_id, realtime) {
                next.receivers.insert(element_id, receiver);
            }
        }

        self.inner.status.retain_elements(next.routes.elements().iter());
        info!(
            publishers = next.publishers.len(),
            receivers = next.receivers.len(),
            "message bus initialized"
        );
        self.replace_topology(next);
    }

    /// Reconciles the live topology with the routing table. Per identity a
    /// departing channel is closed and removed before a new one is created.
    /// Receivers that stay or arrive exist before any publisher addresses
    /// them, and kept publishers drop departing receivers from their route
    /// before those queues are removed.
    pub fn update(&self) {
        let _guard = self.inner.update_lock.lock();
        let previous = self.topology();
        let routes = self.inner.route_source.routes();
        let new_publishers = routes.publishers();
        let new_receivers = routes.receivers();

        for (element_id, publisher) in &previous.publishers {
            if !new_publishers.contains(element_id) {
                publisher.close();
                self.inner.broker.remove_producer(element_id);
                debug!(element_id = %element_id, "publisher removed");
            }
        }

        let mut next = Topology {
            routes,
            ..Topology::default()
        };
        for element_id in new_receivers {
            match previous.receivers.get(&element_id) {
                Some(receiver) => {
                    next.receivers.insert(element_id, Arc::clone(receiver));
                }
                None => {
                    if let Some(receiver) = self.create_receiver(&element_id, false) {
                        next.receivers.insert(element_id, receiver);
                    }
                }
            }
        }
        for (element_id, route) in next.routes.routes() {
            if let Some(publisher) = previous.publishers.get(element_id) {
                publisher.update_route(route.clone());
                next.publishers
                    .insert(element_id.clone(), Arc::clone(publisher));
            }
        }

        for (element_id, receiver) in &previous.receivers {
            if !next.receivers.contains_key(element_id) {
                receiver.close();
                self.inner.broker.remove_consumer(element_id);
                debug!(element_id = %element_id, "receiver removed");
            }
        }

        for (element_id, route) in next.routes.routes() {
            if next.publishers.contains_key(element_id) {
                continue;
            }
            if let Some(publisher) = self.create_publisher(element_id, route.clone(), 0) {
                next.publishers.insert(element_id.clone(), publisher);
            }
        }

        self.inner.status.retain_elements(next.routes.elements().iter());
        info!(
            publishers = next.publishers.len(),
            receivers = next.receivers.len(),
            "message bus routing updated"
        );
        self.replace_topology(next);
    }

    pub fn get_publisher(&self, element_id: &str) -> Option<Arc<Publisher>> {
        self.topology().publishers.get(element_id).cloned()
    }

    pub fn get_receiver(&self, element_id: &str) -> Option<Arc<Receiver>> {
        self.topology().receivers.get(element_id).cloned()
    }

    pub fn routes(&self) -> RoutingTable {
        self.topology().routes.clone()
    }

    pub fn publisher_ids(&self) -> BTreeSet<String> {
        self.topology().publishers.keys().cloned().collect()
    }

    pub fn receiver_ids(&self) -> BTreeSet<String> {
        self.topology().receivers.keys().cloned().collect()
    }

    pub fn next_id(&self) -> String {
        self.inner.ids.next_id()
    }

    /// Publishes on behalf of `message.publisher`.
    pub fn publish(&self, message: Message) -> Result<Message, BusError> {
        let publisher = self
            .get_publisher(&message.publisher)
            .ok_or_else(|| BusError::NoPublisher(message.publisher.clone()))?;
        let published = publisher.publish(message, &self.inner.ids)?;
        self.inner.status.record_published(publisher.element_id());
        Ok(published)
    }

    /// Switches the receiver of `element_id` to real-time delivery. An
    /// identity without a receiver is left alone.
    pub fn enable_realtime_receiving(&self, element_id: &str) {
        match self.get_receiver(element_id) {
            Some(receiver) => {
                receiver.enable_realtime();
                info!(element_id = %element_id, "real-time receiving enabled");
            }
            None => debug!(element_id = %element_id, "no receiver to switch to real-time"),
        }
    }

    pub fn disable_realtime_receiving(&self, element_id: &str) {
        match self.get_receiver(element_id) {
            Some(receiver) => {
                receiver.disable_realtime();
                info!(element_id = %element_id, "real-time receiving disabled");
            }
            None => debug!(element_id = %element_id, "no receiver to switch off real-time"),
        }
    }

    pub fn instance_config_updated(&self, memory_limit_bytes: usize) {
        info!(memory_limit_bytes, "broker memory limit updated");
        self.inner.broker.set_memory_limit(memory_limit_bytes);
    }

    /// Closes every receiver, then every publisher, then stops the broker.
    pub fn stop(&self) {
        let _guard = self.inner.update_lock.lock();
        self.close_channels();
        if let Err(err) = self.inner.broker.stop() {
            warn!(error = %err, "broker stop failed");
        }
        info!("message bus stopped");
    }

    /// Runs the health and speed loops until `shutdown` fires.
    pub async fn run_loops(&self, activity: Arc<ModuleActivity>, shutdown: CancellationToken) {
        let monitor = HealthMonitor::new(self.clone());
        let mut speed = SpeedMeter::new(self.inner.status.processed_messages(), Instant::now());

        let mut health_ticker = tokio::time::interval(self.inner.config.health_check_interval);
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut speed_ticker = tokio::time::interval(self.inner.config.speed_interval);
        speed_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately; the first speed sample would
        // cover an empty window.
        speed_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = health_ticker.tick() => {
                    monitor.tick();
                    activity.heartbeat(ModuleKind::MessageBus);
                }
                _ = speed_ticker.tick() => {
                    let value = speed.sample(self.inner.status.processed_messages(), Instant::now());
                    self.inner.status.set_average_speed(value);
                    debug!(speed = value, "message processing speed");
                }
            }
        }
    }

    fn topology(&self) -> Arc<Topology> {
        Arc::clone(&self.inner.topology.read())
    }

    fn replace_topology(&self, topology: Topology) {
        *self.inner.topology.write() = Arc::new(topology);
    }

    /// Closes all channels and empties the topology. Caller holds the
    /// update lock.
    fn close_channels(&self) {
        let previous = self.topology();
        previous.close_all();
        self.replace_topology(Topology {
            routes: previous.routes.clone(),
            ..Topology::default()
        });
    }

    fn create_publisher(
        &self,
        element_id: &str,
        route: crate::routing::Route,
        published: u64,
    ) -> Option<Arc<Publisher>> {
        match self.inner.broker.create_producer(element_id) {
            Ok(producer) => Some(Arc::new(Publisher::new(
                element_id.to_string(),
                route,
                producer,
                published,
            ))),
            Err(err) => {
                warn!(element_id = %element_id, error = %err, "unable to create publisher");
                None
            }
        }
    }

    /// `realtime` carries a previous receiver's flag; an identity with an
    /// open real-time session starts in real-time mode regardless.
    fn create_receiver(&self, element_id: &str, realtime: bool) -> Option<Arc<Receiver>> {
        let realtime = realtime || self.inner.sink.has_session(element_id);
        match self.inner.broker.create_consumer(element_id) {
            Ok(consumer) => Some(Arc::new(Receiver::new(
                element_id.to_string(),
                consumer,
                Arc::clone(&self.inner.sink),
                realtime,
            ))),
            Err(err) => {
                warn!(element_id = %element_id, error = %err, "unable to create receiver");
                None
            }
        }
    }
}

#[async_trait]
impl Module for MessageBus {
    fn kind(&self) -> ModuleKind {
        ModuleKind::MessageBus
    }

    async fn run(&self, activity: Arc<ModuleActivity>, shutdown: CancellationToken) {
        self.run_loops(activity, shutdown).await;
    }
}
