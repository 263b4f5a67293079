use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use fabric_broker::Producer;
use parking_lot::RwLock;
use tracing::debug;

use super::BusError;
use crate::id_generator::MessageIdGenerator;
use crate::message::Message;
use crate::routing::Route;

/// Send side of a routed element.
#[derive(Debug)]
pub struct Publisher {
    element_id: String,
    route: RwLock<Route>,
    producer: Producer,
    published: AtomicU64,
}

impl Publisher {
    pub(crate) fn new(element_id: String, route: Route, producer: Producer, published: u64) -> Self {
        Self {
            element_id,
            route: RwLock::new(route),
            producer,
            published: AtomicU64::new(published),
        }
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn route(&self) -> Route {
        self.route.read().clone()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub(crate) fn update_route(&self, route: Route) {
        *self.route.write() = route;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.producer.is_closed()
    }

    pub(crate) fn close(&self) {
        self.producer.close();
    }

    /// Stamps `message` with a fresh id and timestamp and sends it to every
    /// receiver of the current route. Returns the message as delivered.
    pub fn publish(
        &self,
        mut message: Message,
        ids: &MessageIdGenerator,
    ) -> Result<Message, BusError> {
        message.id = ids.next_id();
        message.timestamp = Utc::now().timestamp_millis();
        message.publisher = self.element_id.clone();

        let encoded = message.encode()?;
        let route = self.route();
        let delivered = self.producer.send(route.receivers(), encoded)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            element_id = %self.element_id,
            message_id = %message.id,
            delivered,
            "message published"
        );
        Ok(message)
    }
}
