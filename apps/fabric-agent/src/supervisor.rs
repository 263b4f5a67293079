use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::status::{AgentStatus, ModuleKind, ModuleState};

/// Last-active timestamps written by each module on its own cadence.
#[derive(Debug, Default)]
pub struct ModuleActivity {
    last_active: DashMap<ModuleKind, i64>,
}

impl ModuleActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat(&self, module: ModuleKind) {
        self.touch(module, Utc::now().timestamp_millis());
    }

    pub fn touch(&self, module: ModuleKind, millis: i64) {
        self.last_active.insert(module, millis);
    }

    pub fn last_active(&self, module: ModuleKind) -> Option<i64> {
        self.last_active.get(&module).map(|entry| *entry.value())
    }
}

/// A long-running component whose liveness the supervisor watches.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn kind(&self) -> ModuleKind;

    /// Runs until `shutdown` is cancelled. Implementations heartbeat
    /// `activity` while healthy.
    async fn run(&self, activity: Arc<ModuleActivity>, shutdown: CancellationToken);
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    pub dead_module_age: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            dead_module_age: Duration::from_secs(10),
        }
    }
}

struct Supervised {
    module: Arc<dyn Module>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    modules: Vec<Arc<dyn Module>>,
    activity: Arc<ModuleActivity>,
    status: Arc<AgentStatus>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        activity: Arc<ModuleActivity>,
        status: Arc<AgentStatus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            modules: Vec::new(),
            activity,
            status,
            config,
        }
    }

    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn activity(&self) -> Arc<ModuleActivity> {
        Arc::clone(&self.activity)
    }

    /// Spawns every module and watches them until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut supervised: HashMap<ModuleKind, Supervised> = HashMap::new();
        for module in &self.modules {
            let running = self.spawn(Arc::clone(module), &shutdown);
            supervised.insert(module.kind(), running);
        }
        info!(modules = supervised.len(), "supervisor started");

        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check(&mut supervised, &shutdown),
            }
        }

        for (kind, running) in supervised {
            running.token.cancel();
            if let Err(err) = running.handle.await {
                if err.is_panic() {
                    error!(module = %kind, "module panicked during shutdown");
                }
            }
            self.status.set_module_state(kind, ModuleState::Stopped);
        }
        info!("supervisor stopped");
    }

    fn check(&self, supervised: &mut HashMap<ModuleKind, Supervised>, shutdown: &CancellationToken) {
        let now = Utc::now().timestamp_millis();
        let dead_after = self.config.dead_module_age.as_millis() as i64;

        for (kind, running) in supervised.iter_mut() {
            let finished = running.handle.is_finished();
            let stale = self
                .activity
                .last_active(*kind)
                .map(|last| now - last > dead_after)
                .unwrap_or(true);

            if !finished && !stale {
                debug!(module = %kind, "module alive");
                continue;
            }

            error!(module = %kind, finished, stale, "module is not responding, restarting");
            running.token.cancel();
            running.handle.abort();
            self.status.record_module_restart(*kind);
            *running = self.spawn(Arc::clone(&running.module), shutdown);
        }
    }

    fn spawn(&self, module: Arc<dyn Module>, shutdown: &CancellationToken) -> Supervised {
        let kind = module.kind();
        let token = shutdown.child_token();
        self.activity.heartbeat(kind);
        self.status.set_module_state(kind, ModuleState::Running);

        let activity = Arc::clone(&self.activity);
        let task_module = Arc::clone(&module);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            task_module.run(activity, task_token).await;
        });

        Supervised {
            module,
            token,
            handle,
        }
    }
}
