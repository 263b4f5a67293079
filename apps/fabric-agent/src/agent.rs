use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use fabric_broker::EmbeddedBroker;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusError, MessageBus};
use crate::config::AgentConfig;
use crate::gateway::RealtimeGateway;
use crate::routes;
use crate::routing::RouteTableStore;
use crate::state::AppState;
use crate::status::AgentStatus;
use crate::supervisor::{ModuleActivity, Supervisor};

/// Wired-up agent: message bus, real-time gateway and their supervisor.
pub struct Agent {
    state: AppState,
    supervisor: Supervisor,
}

impl Agent {
    /// Builds every component and starts the message bus.
    pub fn start(config: &AgentConfig, routes: RouteTableStore) -> Result<Self, BusError> {
        let status = Arc::new(AgentStatus::new());
        let routes = Arc::new(routes);
        let broker = Arc::new(EmbeddedBroker::new(config.bus.memory_limit_bytes));
        let gateway = RealtimeGateway::new(Arc::clone(&status), config.gateway.clone());
        let bus = MessageBus::new(
            broker,
            routes.clone(),
            Arc::new(gateway.clone()),
            Arc::clone(&status),
            config.bus.clone(),
        );
        bus.start()?;

        let supervisor = Supervisor::new(
            Arc::new(ModuleActivity::new()),
            Arc::clone(&status),
            config.supervisor.clone(),
        )
        .with_module(Arc::new(bus.clone()))
        .with_module(Arc::new(gateway.clone()));

        Ok(Self {
            state: AppState::new(bus, gateway, routes, status),
            supervisor,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state = self.state.with_metrics(handle);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    /// Serves the local API and runs the supervised modules until `shutdown`
    /// fires, then stops the message bus.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();
        let Agent { state, supervisor } = self;
        let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

        let local_addr = listener.local_addr().context("listener has no local address")?;
        info!(%local_addr, "local api listening");

        let server = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .context("server shutdown with error");

        shutdown.cancel();
        if let Err(err) = supervisor_task.await {
            warn!(error = %err, "supervisor task failed");
        }
        state.bus().stop();
        server
    }
}
