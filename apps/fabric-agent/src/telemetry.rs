use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    /// Installs the Prometheus recorder and the tracing subscriber. `RUST_LOG`
    /// wins over `default_filter`.
    pub fn init(default_filter: &str) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
