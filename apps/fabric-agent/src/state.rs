use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::bus::MessageBus;
use crate::gateway::RealtimeGateway;
use crate::routing::RouteTableStore;
use crate::status::AgentStatus;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    bus: MessageBus,
    gateway: RealtimeGateway,
    routes: Arc<RouteTableStore>,
    status: Arc<AgentStatus>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        bus: MessageBus,
        gateway: RealtimeGateway,
        routes: Arc<RouteTableStore>,
        status: Arc<AgentStatus>,
    ) -> Self {
        Self {
            start: Instant::now(),
            bus,
            gateway,
            routes,
            status,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn gateway(&self) -> &RealtimeGateway {
        &self.gateway
    }

    pub fn routes(&self) -> &RouteTableStore {
        &self.routes
    }

    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
