use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fabric_broker::Consumer;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::BusError;
use crate::message::Message;

/// Where real-time receivers hand off consumed messages.
pub trait RealtimeSink: Send + Sync {
    /// Returns `false` when the message could not be handed to a live
    /// connection.
    fn deliver(&self, receiver_id: &str, message: &Message) -> bool;

    /// Whether a live connection is waiting for `receiver_id`. Receivers
    /// created for such an identity start in real-time mode.
    fn has_session(&self, _receiver_id: &str) -> bool {
        false
    }
}

/// Sink used when no real-time transport is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl RealtimeSink for DiscardSink {
    fn deliver(&self, _receiver_id: &str, _message: &Message) -> bool {
        false
    }
}

/// Receive side of a subscribed element.
pub struct Receiver {
    element_id: String,
    consumer: Consumer,
    realtime: AtomicBool,
    pump: Mutex<Option<CancellationToken>>,
    sink: Arc<dyn RealtimeSink>,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("element_id", &self.element_id)
            .field("realtime", &self.is_realtime())
            .finish()
    }
}

impl Receiver {
    pub(crate) fn new(
        element_id: String,
        consumer: Consumer,
        sink: Arc<dyn RealtimeSink>,
        realtime: bool,
    ) -> Self {
        let receiver = Self {
            element_id,
            consumer,
            realtime: AtomicBool::new(false),
            pump: Mutex::new(None),
            sink,
        };
        if realtime {
            receiver.enable_realtime();
        }
        receiver
    }

    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.consumer.is_closed()
    }

    /// Drains up to `max` buffered messages. Undecodable payloads are logged
    /// and skipped.
    pub fn get_messages(&self, max: usize) -> Result<Vec<Message>, BusError> {
        let mut messages = Vec::new();
        while messages.len() < max {
            let Some(raw) = self.consumer.try_recv()? else {
                break;
            };
            match Message::decode(&raw) {
                Ok(message) => messages.push(message),
                Err(err) => warn!(
                    element_id = %self.element_id,
                    error = %err,
                    "dropping undecodable message"
                ),
            }
        }
        Ok(messages)
    }

    /// Starts forwarding every consumed message to the real-time sink.
    pub fn enable_realtime(&self) {
        let mut pump = self.pump.lock();
        self.realtime.store(true, Ordering::SeqCst);
        if pump.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                element_id = %self.element_id,
                "no async runtime, real-time pump not started"
            );
            return;
        };

        let token = CancellationToken::new();
        let consumer = self.consumer.clone();
        let sink = Arc::clone(&self.sink);
        let element_id = self.element_id.clone();
        runtime.spawn(run_pump(element_id, consumer, sink, token.clone()));
        *pump = Some(token);
    }

    /// Stops the pump; messages buffer for polling again.
    pub fn disable_realtime(&self) {
        let mut pump = self.pump.lock();
        self.realtime.store(false, Ordering::SeqCst);
        if let Some(token) = pump.take() {
            token.cancel();
        }
    }

    pub(crate) fn close(&self) {
        if let Some(token) = self.pump.lock().take() {
            token.cancel();
        }
        self.consumer.close();
    }
}

async fn run_pump(
    element_id: String,
    consumer: Consumer,
    sink: Arc<dyn RealtimeSink>,
    token: CancellationToken,
) {
    debug!(element_id = %element_id, "real-time pump started");
    loop {
        let raw = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = consumer.recv() => match next {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(element_id = %element_id, error = %err, "real-time pump source closed");
                    break;
                }
            },
        };
        match Message::decode(&raw) {
            Ok(message) => {
                if !sink.deliver(&element_id, &message) {
                    warn!(
                        element_id = %element_id,
                        message_id = %message.id,
                        "real-time delivery failed"
                    );
                }
            }
            Err(err) => warn!(
                element_id = %element_id,
                error = %err,
                "dropping undecodable message"
            ),
        }
    }
    debug!(element_id = %element_id, "real-time pump stopped");
}
