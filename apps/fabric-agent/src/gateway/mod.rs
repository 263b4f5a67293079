//! Real-time delivery: one WebSocket session per element identity, server
//! pushes tracked until acknowledged.

pub mod frame;
pub mod socket;

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage};
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::RealtimeSink;
use crate::message::Message;
use crate::status::{AgentStatus, ModuleKind};
use crate::supervisor::{Module, ModuleActivity};

const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ack_timeout: Duration,
    pub ack_max_attempts: u32,
    pub sweep_interval: Duration,
    pub max_pending_acks: usize,
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            ack_max_attempts: 3,
            sweep_interval: Duration::from_secs(1),
            max_pending_acks: 256,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

#[derive(Debug)]
struct PendingAck {
    message_id: String,
    frame: Bytes,
    attempts: u32,
    sent_at: Instant,
}

struct Session {
    connection_id: u64,
    sender: mpsc::Sender<WsMessage>,
    pending: Mutex<VecDeque<PendingAck>>,
}

/// Handed to the connection task that owns the socket.
pub struct SessionRegistration {
    pub connection_id: u64,
    pub sender: mpsc::Sender<WsMessage>,
    pub receiver: mpsc::Receiver<WsMessage>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    pub dropped: usize,
}

#[derive(Clone)]
pub struct RealtimeGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    sessions: DashMap<String, Arc<Session>>,
    next_connection: AtomicU64,
    status: Arc<AgentStatus>,
    config: GatewayConfig,
}

impl RealtimeGateway {
    pub fn new(status: Arc<AgentStatus>, config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                sessions: DashMap::new(),
                next_connection: AtomicU64::new(1),
                status,
                config,
            }),
        }
    }

    /// Opens a session for `element_id`. An existing session for the same
    /// identity is told to close and replaced.
    pub fn register(&self, element_id: &str) -> SessionRegistration {
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_buffer);
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            connection_id,
            sender: tx.clone(),
            pending: Mutex::new(VecDeque::new()),
        });

        if let Some(previous) = self
            .inner
            .sessions
            .insert(element_id.to_string(), session)
        {
            info!(
                element_id = %element_id,
                replaced_connection = previous.connection_id,
                "closing superseded real-time connection"
            );
            let _ = previous.sender.try_send(WsMessage::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::Borrowed("replaced by a newer connection"),
            })));
        }
        self.publish_session_count();

        SessionRegistration {
            connection_id,
            sender: tx,
            receiver: rx,
        }
    }

    /// Removes the session only if it still belongs to `connection_id`.
    /// Returns whether it did.
    pub fn unregister(&self, element_id: &str, connection_id: u64) -> bool {
        let removed = self
            .inner
            .sessions
            .remove_if(element_id, |_, session| session.connection_id == connection_id)
            .is_some();
        if removed {
            self.publish_session_count();
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_connected(&self, element_id: &str) -> bool {
        self.inner.sessions.contains_key(element_id)
    }

    pub fn pending_count(&self, element_id: &str) -> usize {
        self.session(element_id)
            .map(|session| session.pending.lock().len())
            .unwrap_or(0)
    }

    /// Pushes `message` to the live session of `receiver_id` and tracks it
    /// until acknowledged.
    pub fn send_realtime_message(&self, receiver_id: &str, message: &Message) -> bool {
        let Some(session) = self.session(receiver_id) else {
            warn!(element_id = %receiver_id, "no active real-time socket");
            counter!("fabric_realtime_push_dropped_total", 1, "reason" => "no_session");
            return false;
        };
        let frame = match frame::encode_message_frame(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(element_id = %receiver_id, error = %err, "unable to frame message");
                counter!("fabric_realtime_push_dropped_total", 1, "reason" => "encode");
                return false;
            }
        };

        {
            let mut pending = session.pending.lock();
            if pending.len() >= self.inner.config.max_pending_acks {
                if let Some(evicted) = pending.pop_front() {
                    warn!(
                        element_id = %receiver_id,
                        message_id = %evicted.message_id,
                        "pending ack buffer full, dropping oldest"
                    );
                    counter!("fabric_realtime_push_dropped_total", 1, "reason" => "pending_full");
                }
            }
            pending.push_back(PendingAck {
                message_id: message.id.clone(),
                frame: frame.clone(),
                attempts: 1,
                sent_at: Instant::now(),
            });
        }

        match session.sender.try_send(WsMessage::Binary(frame.to_vec())) {
            Ok(()) => true,
            Err(err) => {
                session
                    .pending
                    .lock()
                    .retain(|entry| entry.message_id != message.id);
                let reason = match err {
                    TrySendError::Full(_) => "backpressure",
                    TrySendError::Closed(_) => "closed",
                };
                warn!(element_id = %receiver_id, message_id = %message.id, reason, "real-time push dropped");
                counter!("fabric_realtime_push_dropped_total", 1, "reason" => reason);
                false
            }
        }
    }

    /// Clears an outstanding push of the given connection. `None` clears the
    /// oldest one.
    pub fn acknowledge(&self, element_id: &str, connection_id: u64, message_id: Option<&str>) -> bool {
        let Some(session) = self.session(element_id) else {
            return false;
        };
        if session.connection_id != connection_id {
            return false;
        }
        let mut pending = session.pending.lock();
        let position = match message_id {
            Some(id) => pending.iter().position(|entry| entry.message_id == id),
            None if pending.is_empty() => None,
            None => Some(0),
        };
        match position.and_then(|index| pending.remove(index)) {
            Some(entry) => {
                debug!(element_id = %element_id, message_id = %entry.message_id, "push acknowledged");
                true
            }
            None => false,
        }
    }

    /// Resends pushes older than the ack timeout and gives up on those that
    /// have used every attempt.
    pub fn sweep_pending(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let config = &self.inner.config;
        for entry in self.inner.sessions.iter() {
            let element_id = entry.key();
            let session = entry.value();
            let mut pending = session.pending.lock();
            pending.retain_mut(|push| {
                if now.saturating_duration_since(push.sent_at) < config.ack_timeout {
                    return true;
                }
                if push.attempts >= config.ack_max_attempts {
                    warn!(
                        element_id = %element_id,
                        message_id = %push.message_id,
                        attempts = push.attempts,
                        "real-time push never acknowledged, giving up"
                    );
                    counter!("fabric_realtime_push_dropped_total", 1, "reason" => "unacknowledged");
                    report.dropped += 1;
                    return false;
                }
                push.attempts += 1;
                push.sent_at = now;
                if session
                    .sender
                    .try_send(WsMessage::Binary(push.frame.to_vec()))
                    .is_ok()
                {
                    counter!("fabric_realtime_push_resent_total", 1);
                    report.resent += 1;
                }
                true
            });
        }
        report
    }

    fn session(&self, element_id: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(element_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn publish_session_count(&self) {
        self.inner
            .status
            .set_open_realtime_sessions(self.inner.sessions.len());
    }
}

impl RealtimeSink for RealtimeGateway {
    fn deliver(&self, receiver_id: &str, message: &Message) -> bool {
        self.send_realtime_message(receiver_id, message)
    }

    fn has_session(&self, receiver_id: &str) -> bool {
        self.is_connected(receiver_id)
    }
}

#[async_trait]
impl Module for RealtimeGateway {
    fn kind(&self) -> ModuleKind {
        ModuleKind::LocalApi
    }

    async fn run(&self, activity: Arc<ModuleActivity>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep_pending(Instant::now());
                    if report != SweepReport::default() {
                        debug!(resent = report.resent, dropped = report.dropped, "pending acks swept");
                    }
                    activity.heartbeat(ModuleKind::LocalApi);
                }
            }
        }
    }
}
