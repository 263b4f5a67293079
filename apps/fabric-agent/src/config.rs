use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::bus::BusConfig;
use crate::gateway::GatewayConfig;
use crate::supervisor::SupervisorConfig;

const MAX_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(
    name = "fabric-agent",
    author,
    version,
    about = "Edge agent runtime: local message bus and real-time delivery"
)]
pub struct Cli {
    /// Address the local API listens on.
    #[arg(long, env = "FABRIC_LISTEN_ADDR", default_value = "127.0.0.1:54321")]
    pub listen_addr: String,

    /// Tracing filter used when RUST_LOG is unset.
    #[arg(long, env = "FABRIC_LOG", default_value = "info")]
    pub log_filter: String,

    /// JSON routing table loaded at startup.
    #[arg(long, env = "FABRIC_ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    #[arg(long, env = "FABRIC_BROKER_MEMORY_LIMIT_MB", default_value_t = 64)]
    pub broker_memory_limit_mb: usize,

    #[arg(long, env = "FABRIC_HEALTH_CHECK_INTERVAL_MS", default_value_t = 5_000)]
    pub health_check_interval_ms: u64,

    #[arg(long, env = "FABRIC_SPEED_INTERVAL_SECS", default_value_t = 60)]
    pub speed_interval_secs: u64,

    #[arg(long, env = "FABRIC_SUPERVISOR_INTERVAL_SECS", default_value_t = 2)]
    pub supervisor_interval_secs: u64,

    /// Heartbeat age after which a module is restarted.
    #[arg(long, env = "FABRIC_DEAD_MODULE_SECS", default_value_t = 10)]
    pub dead_module_secs: u64,

    #[arg(long, env = "FABRIC_ACK_TIMEOUT_MS", default_value_t = 5_000)]
    pub ack_timeout_ms: u64,

    #[arg(long, env = "FABRIC_ACK_MAX_ATTEMPTS", default_value_t = 3)]
    pub ack_max_attempts: u32,

    #[arg(long, env = "FABRIC_ACK_SWEEP_INTERVAL_MS", default_value_t = 1_000)]
    pub ack_sweep_interval_ms: u64,

    #[arg(long, env = "FABRIC_MAX_PENDING_ACKS", default_value_t = 256)]
    pub max_pending_acks: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "FABRIC_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub routes_file: Option<PathBuf>,
    pub bus: BusConfig,
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorConfig,
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 54321)),
            log_filter: "info".into(),
            routes_file: None,
            bus: BusConfig::default(),
            gateway: GatewayConfig::default(),
            supervisor: SupervisorConfig::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<Cli> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.health_check_interval_ms > 0, "health check interval must be non-zero");
        ensure!(cli.speed_interval_secs > 0, "speed interval must be non-zero");
        ensure!(cli.supervisor_interval_secs > 0, "supervisor interval must be non-zero");
        ensure!(cli.ack_sweep_interval_ms > 0, "ack sweep interval must be non-zero");
        ensure!(cli.ack_max_attempts > 0, "ack attempts must be non-zero");
        ensure!(cli.max_pending_acks > 0, "pending ack buffer must be non-zero");

        // Modules heartbeat once per tick of their own loop.
        let health_check_interval = Duration::from_millis(cli.health_check_interval_ms);
        let sweep_interval = Duration::from_millis(cli.ack_sweep_interval_ms);
        let dead_module_age = Duration::from_secs(cli.dead_module_secs);
        ensure!(
            health_check_interval < MAX_HEALTH_CHECK_INTERVAL,
            "health check interval must be under {:?}",
            MAX_HEALTH_CHECK_INTERVAL
        );
        ensure!(
            health_check_interval < dead_module_age,
            "health check interval must be shorter than the dead module age"
        );
        ensure!(
            sweep_interval < dead_module_age,
            "ack sweep interval must be shorter than the dead module age"
        );

        Ok(AgentConfig {
            listen_addr,
            log_filter: cli.log_filter,
            routes_file: cli.routes_file,
            bus: BusConfig {
                memory_limit_bytes: cli.broker_memory_limit_mb.saturating_mul(1024 * 1024),
                health_check_interval,
                speed_interval: Duration::from_secs(cli.speed_interval_secs),
            },
            gateway: GatewayConfig {
                ack_timeout: Duration::from_millis(cli.ack_timeout_ms),
                ack_max_attempts: cli.ack_max_attempts,
                sweep_interval,
                max_pending_acks: cli.max_pending_acks,
                ..GatewayConfig::default()
            },
            supervisor: SupervisorConfig {
                check_interval: Duration::from_secs(cli.supervisor_interval_secs),
                dead_module_age,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
