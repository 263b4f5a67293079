use metrics::counter;
use tracing::{debug, info, warn};

use super::{MessageBus, Topology};

/// Outcome of one health check pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub broker_restarted: bool,
    pub publishers_repaired: Vec<String>,
    pub publishers_dropped: Vec<String>,
    pub receivers_repaired: Vec<String>,
    pub failures: usize,
}

impl HealthReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Probes the broker and every channel, restarting whatever has failed.
/// Failures are logged and retried on the next tick.
pub struct HealthMonitor {
    bus: MessageBus,
}

impl HealthMonitor {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    pub fn tick(&self) -> HealthReport {
        debug!("checking message bus health");
        let mut report = HealthReport::default();
        let inner = &self.bus.inner;

        if !inner.broker.is_active() {
            warn!("broker is not active, restarting");
            {
                let _guard = inner.update_lock.lock();
                self.bus.topology().close_all();
                if let Err(err) = inner.broker.stop() {
                    debug!(error = %err, "broker stop before restart");
                }
                if let Err(err) = inner.broker.start() {
                    warn!(error = %err, "broker restart failed");
                    report.failures += 1;
                    return report;
                }
            }
            counter!("fabric_broker_restarts_total", 1);
            info!("broker restarted");
            self.bus.init();
            report.broker_restarted = true;
            return report;
        }

        let _guard = inner.update_lock.lock();
        let current = self.bus.topology();
        let mut publishers = current.publishers.clone();
        let mut receivers = current.receivers.clone();

        for (element_id, publisher) in &current.publishers {
            if !publisher.is_closed() && !inner.broker.is_producer_closed(element_id) {
                continue;
            }
            warn!(element_id = %element_id, "publisher channel closed, restarting");
            publisher.close();

            let route = current
                .routes
                .route(element_id)
                .filter(|route| !route.is_empty())
                .cloned();
            let Some(route) = route else {
                publishers.remove(element_id);
                report.publishers_dropped.push(element_id.clone());
                continue;
            };
            match self
                .bus
                .create_publisher(element_id, route, publisher.published_count())
            {
                Some(repaired) => {
                    publishers.insert(element_id.clone(), repaired);
                    report.publishers_repaired.push(element_id.clone());
                    counter!("fabric_channel_repairs_total", 1, "kind" => "publisher");
                    info!(element_id = %element_id, "publisher restarted");
                }
                None => report.failures += 1,
            }
        }

        for (element_id, receiver) in &current.receivers {
            if !receiver.is_closed() && !inner.broker.is_consumer_closed(element_id) {
                continue;
            }
            warn!(element_id = %element_id, "receiver channel closed, restarting");
            receiver.close();

            match self.bus.create_receiver(element_id, receiver.is_realtime()) {
                Some(repaired) => {
                    receivers.insert(element_id.clone(), repaired);
                    report.receivers_repaired.push(element_id.clone());
                    counter!("fabric_channel_repairs_total", 1, "kind" => "receiver");
                    info!(element_id = %element_id, "receiver restarted");
                }
                None => report.failures += 1,
            }
        }

        // Identities whose channel could not be created during init or
        // update are still routed but have no entry yet.
        for element_id in current.routes.receivers() {
            if receivers.contains_key(&element_id) {
                continue;
            }
            match self.bus.create_receiver(&element_id, false) {
                Some(created) => {
                    info!(element_id = %element_id, "missing receiver created");
                    counter!("fabric_channel_repairs_total", 1, "kind" => "receiver");
                    report.receivers_repaired.push(element_id.clone());
                    receivers.insert(element_id, created);
                }
                None => report.failures += 1,
            }
        }
        for (element_id, route) in current.routes.routes() {
            if publishers.contains_key(element_id) {
                continue;
            }
            match self.bus.create_publisher(element_id, route.clone(), 0) {
                Some(created) => {
                    info!(element_id = %element_id, "missing publisher created");
                    counter!("fabric_channel_repairs_total", 1, "kind" => "publisher");
                    report.publishers_repaired.push(element_id.clone());
                    publishers.insert(element_id.clone(), created);
                }
                None => report.failures += 1,
            }
        }

        if !report.is_clean() {
            self.bus.replace_topology(Topology {
                routes: current.routes.clone(),
                publishers,
                receivers,
            });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::bus::{BusConfig, DiscardSink};
    use crate::message::Message;
    use crate::routing::{RouteTableStore, RoutingTable};
    use crate::status::AgentStatus;
    use fabric_broker::{Broker, BrokerError, BrokerResult, Consumer, EmbeddedBroker, Producer};

    /// Embedded broker whose next channel creations can be made to fail.
    #[derive(Default)]
    struct FlakyBroker {
        inner: EmbeddedBroker,
        producer_failures: AtomicUsize,
        consumer_failures: AtomicUsize,
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl Broker for FlakyBroker {
        fn start(&self) -> BrokerResult<()> {
            self.inner.start()
        }
        fn stop(&self) -> BrokerResult<()> {
            self.inner.stop()
        }
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }
        fn set_memory_limit(&self, bytes: usize) {
            self.inner.set_memory_limit(bytes)
        }
        fn create_producer(&self, name: &str) -> BrokerResult<Producer> {
            if take_failure(&self.producer_failures) {
                return Err(BrokerError::ChannelClosed(name.to_string()));
            }
            self.inner.create_producer(name)
        }
        fn remove_producer(&self, name: &str) {
            self.inner.remove_producer(name)
        }
        fn is_producer_closed(&self, name: &str) -> bool {
            self.inner.is_producer_closed(name)
        }
        fn create_consumer(&self, name: &str) -> BrokerResult<Consumer> {
            if take_failure(&self.consumer_failures) {
                return Err(BrokerError::ChannelClosed(name.to_string()));
            }
            self.inner.create_consumer(name)
        }
        fn remove_consumer(&self, name: &str) {
            self.inner.remove_consumer(name)
        }
        fn is_consumer_closed(&self, name: &str) -> bool {
            self.inner.is_consumer_closed(name)
        }
    }

    fn flaky_setup() -> (MessageBus, Arc<FlakyBroker>, Arc<RouteTableStore>) {
        let broker = Arc::new(FlakyBroker::default());
        let store = Arc::new(RouteTableStore::new(RoutingTable::new()));
        let bus = MessageBus::new(
            broker.clone(),
            store.clone(),
            Arc::new(DiscardSink),
            Arc::new(AgentStatus::new()),
            BusConfig::default(),
        );
        bus.start().expect("start");
        (bus, broker, store)
    }

    fn setup() -> (MessageBus, EmbeddedBroker) {
        let broker = EmbeddedBroker::default();
        let bus = MessageBus::new(
            Arc::new(broker.clone()),
            Arc::new(RouteTableStore::new(
                RoutingTable::new().with_route("camera", ["detector"]),
            )),
            Arc::new(DiscardSink),
            Arc::new(AgentStatus::new()),
            BusConfig::default(),
        );
        bus.start().expect("start");
        (bus, broker)
    }

    #[test]
    fn healthy_bus_reports_nothing() {
        let (bus, _) = setup();
        assert!(HealthMonitor::new(bus).tick().is_clean());
    }

    #[test]
    fn failed_publisher_is_recreated_with_its_route_and_count() {
        let (bus, broker) = setup();
        bus.publish(Message::new("camera", &b"a"[..])).expect("publish");
        broker.fail_producer("camera");

        let report = HealthMonitor::new(bus.clone()).tick();
        assert_eq!(report.publishers_repaired, vec!["camera".to_string()]);

        let publisher = bus.get_publisher("camera").expect("publisher");
        assert_eq!(publisher.published_count(), 1);
        assert!(publisher.route().receivers().contains("detector"));
        bus.publish(Message::new("camera", &b"b"[..])).expect("publish after repair");
        assert_eq!(
            bus.get_receiver("detector").expect("receiver").get_messages(10).expect("drain").len(),
            2
        );
    }

    #[test]
    fn failed_receiver_keeps_buffered_messages() {
        let (bus, broker) = setup();
        bus.publish(Message::new("camera", &b"a"[..])).expect("publish");
        broker.fail_consumer("detector");

        let report = HealthMonitor::new(bus.clone()).tick();
        assert_eq!(report.receivers_repaired, vec!["detector".to_string()]);
        let messages = bus
            .get_receiver("detector")
            .expect("receiver")
            .get_messages(10)
            .expect("drain");
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn stopped_broker_is_restarted_and_topology_rebuilt() {
        let (bus, broker) = setup();
        broker.stop().expect("stop");

        let report = HealthMonitor::new(bus.clone()).tick();
        assert!(report.broker_restarted);
        assert!(broker.is_active());
        assert!(bus.get_publisher("camera").is_some());
        bus.publish(Message::new("camera", &b"a"[..])).expect("publish");
    }

    #[test]
    fn publisher_that_failed_to_create_is_created_on_next_tick() {
        let (bus, broker, store) = flaky_setup();
        broker.producer_failures.store(1, Ordering::SeqCst);
        store.replace(RoutingTable::new().with_route("camera", ["detector"]));
        bus.update();
        assert!(bus.get_publisher("camera").is_none());

        let report = HealthMonitor::new(bus.clone()).tick();
        assert_eq!(report.publishers_repaired, vec!["camera".to_string()]);
        assert_eq!(report.failures, 0);

        let publisher = bus.get_publisher("camera").expect("publisher");
        assert!(publisher.route().receivers().contains("detector"));
        bus.publish(Message::new("camera", &b"a"[..])).expect("publish");
        assert_eq!(
            bus.get_receiver("detector").expect("receiver").get_messages(10).expect("drain").len(),
            1
        );
        assert!(HealthMonitor::new(bus).tick().is_clean());
    }

    #[test]
    fn receiver_that_failed_to_create_is_created_without_leaking_bytes() {
        let (bus, broker, store) = flaky_setup();
        broker.consumer_failures.store(1, Ordering::SeqCst);
        store.replace(RoutingTable::new().with_route("camera", ["detector"]));
        bus.update();
        assert!(bus.get_receiver("detector").is_none());

        bus.publish(Message::new("camera", &b"lost"[..])).expect("publish");
        assert_eq!(broker.inner.used_bytes(), 0);

        let report = HealthMonitor::new(bus.clone()).tick();
        assert_eq!(report.receivers_repaired, vec!["detector".to_string()]);

        bus.publish(Message::new("camera", &b"kept"[..])).expect("publish");
        let messages = bus
            .get_receiver("detector")
            .expect("receiver")
            .get_messages(10)
            .expect("drain");
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0].payload[..], b"kept");
        assert_eq!(broker.inner.used_bytes(), 0);
    }

    #[test]
    fn repeated_creation_failure_is_counted_and_retried() {
        let (bus, broker, store) = flaky_setup();
        broker.producer_failures.store(2, Ordering::SeqCst);
        store.replace(RoutingTable::new().with_route("camera", ["detector"]));
        bus.update();

        let monitor = HealthMonitor::new(bus.clone());
        assert_eq!(monitor.tick().failures, 1);
        assert!(bus.get_publisher("camera").is_none());
        assert_eq!(monitor.tick().publishers_repaired, vec!["camera".to_string()]);
    }
}
