//! Observable status published by the agent's modules.
//!
//! Every setter also feeds the matching `metrics` gauge or counter, so the
//! same values are visible through `/v2/status` and `/metrics`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    MessageBus,
    LocalApi,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::MessageBus => "message_bus",
            ModuleKind::LocalApi => "local_api",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleStatus {
    pub state: ModuleState,
    pub restarts: u64,
}

#[derive(Debug, Default)]
pub struct AgentStatus {
    processed_messages: AtomicU64,
    average_speed: RwLock<f64>,
    published_per_element: DashMap<String, u64>,
    open_realtime_sessions: AtomicUsize,
    modules: DashMap<ModuleKind, ModuleStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub processed_messages: u64,
    pub average_speed: f64,
    pub published_per_element: BTreeMap<String, u64>,
    pub open_realtime_sessions: usize,
    pub modules: BTreeMap<ModuleKind, ModuleStatus>,
}

impl AgentStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self, element_id: &str) {
        self.processed_messages.fetch_add(1, Ordering::Relaxed);
        *self
            .published_per_element
            .entry(element_id.to_string())
            .or_insert(0) += 1;
        counter!("fabric_message_bus_processed_total", 1);
        counter!(
            "fabric_element_published_total",
            1,
            "element_id" => element_id.to_string()
        );
    }

    pub fn processed_messages(&self) -> u64 {
        self.processed_messages.load(Ordering::Relaxed)
    }

    pub fn published_by(&self, element_id: &str) -> Option<u64> {
        self.published_per_element
            .get(element_id)
            .map(|entry| *entry.value())
    }

    /// Keeps a counter for exactly the given identities: unknown ones are
    /// dropped, new ones start at zero.
    pub fn retain_elements<'a, I>(&self, elements: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let keep: Vec<&String> = elements.into_iter().collect();
        self.published_per_element
            .retain(|element, _| keep.iter().any(|kept| *kept == element));
        for element in keep {
            self.published_per_element
                .entry(element.clone())
                .or_insert(0);
        }
    }

    pub fn set_average_speed(&self, speed: f64) {
        *self.average_speed.write() = speed;
        gauge!("fabric_message_bus_average_speed", speed);
    }

    pub fn average_speed(&self) -> f64 {
        *self.average_speed.read()
    }

    pub fn set_open_realtime_sessions(&self, count: usize) {
        self.open_realtime_sessions.store(count, Ordering::Relaxed);
        gauge!("fabric_realtime_sessions_open", count as f64);
    }

    pub fn open_realtime_sessions(&self) -> usize {
        self.open_realtime_sessions.load(Ordering::Relaxed)
    }

    pub fn set_module_state(&self, module: ModuleKind, state: ModuleState) {
        self.modules
            .entry(module)
            .and_modify(|status| status.state = state)
            .or_insert(ModuleStatus { state, restarts: 0 });
        let running = if state == ModuleState::Running { 1.0 } else { 0.0 };
        gauge!("fabric_module_running", running, "module" => module.as_str());
    }

    pub fn record_module_restart(&self, module: ModuleKind) {
        self.modules
            .entry(module)
            .and_modify(|status| status.restarts += 1)
            .or_insert(ModuleStatus {
                state: ModuleState::Starting,
                restarts: 1,
            });
        counter!("fabric_module_restarts_total", 1, "module" => module.as_str());
    }

    pub fn module(&self, module: ModuleKind) -> Option<ModuleStatus> {
        self.modules.get(&module).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            processed_messages: self.processed_messages(),
            average_speed: self.average_speed(),
            published_per_element: self
                .published_per_element
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            open_realtime_sessions: self.open_realtime_sessions(),
            modules: self
                .modules
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_counters_follow_retained_elements() {
        let status = AgentStatus::new();
        status.record_published("camera");
        status.record_published("camera");
        status.record_published("gone");

        let keep = ["camera".to_string(), "detector".to_string()];
        status.retain_elements(keep.iter());

        assert_eq!(status.published_by("camera"), Some(2));
        assert_eq!(status.published_by("detector"), Some(0));
        assert_eq!(status.published_by("gone"), None);
        assert_eq!(status.processed_messages(), 3);
    }

    #[test]
    fn module_restarts_accumulate_across_state_changes() {
        let status = AgentStatus::new();
        status.set_module_state(ModuleKind::MessageBus, ModuleState::Running);
        status.record_module_restart(ModuleKind::MessageBus);
        status.set_module_state(ModuleKind::MessageBus, ModuleState::Running);

        let module = status.module(ModuleKind::MessageBus).expect("tracked");
        assert_eq!(module.state, ModuleState::Running);
        assert_eq!(module.restarts, 1);
    }

    #[test]
    fn snapshot_serializes_module_names() {
        let status = AgentStatus::new();
        status.set_module_state(ModuleKind::LocalApi, ModuleState::Stopped);
        status.set_open_realtime_sessions(2);
        let json = serde_json::to_value(status.snapshot()).expect("json");
        assert_eq!(json["modules"]["local_api"]["state"], "stopped");
        assert_eq!(json["open_realtime_sessions"], 2);
    }
}
