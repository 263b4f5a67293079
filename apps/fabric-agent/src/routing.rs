//! Routing input supplied by the element manager.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeSet<String>", into = "BTreeSet<String>")]
pub struct Route {
    receivers: BTreeSet<String>,
}

impl From<BTreeSet<String>> for Route {
    fn from(receivers: BTreeSet<String>) -> Self {
        Self::new(receivers)
    }
}

impl From<Route> for BTreeSet<String> {
    fn from(route: Route) -> Self {
        route.receivers
    }
}

impl Route {
    pub fn new<I, S>(receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            receivers: receivers
                .into_iter()
                .map(Into::into)
                .filter(|receiver: &String| !receiver.trim().is_empty())
                .collect(),
        }
    }

    pub fn receivers(&self) -> &BTreeSet<String> {
        &self.receivers
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// Publisher identity to route. Routes without receivers are dropped on
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Route>", into = "BTreeMap<String, Route>")]
pub struct RoutingTable {
    routes: BTreeMap<String, Route>,
}

impl From<BTreeMap<String, Route>> for RoutingTable {
    fn from(routes: BTreeMap<String, Route>) -> Self {
        routes.into_iter().collect()
    }
}

impl From<RoutingTable> for BTreeMap<String, Route> {
    fn from(table: RoutingTable) -> Self {
        table.routes
    }
}

impl FromIterator<(String, Route)> for RoutingTable {
    fn from_iter<T: IntoIterator<Item = (String, Route)>>(iter: T) -> Self {
        Self {
            routes: iter
                .into_iter()
                .filter(|(publisher, route)| !publisher.trim().is_empty() && !route.is_empty())
                .collect(),
        }
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route<I, S>(mut self, publisher: impl Into<String>, receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let publisher = publisher.into();
        let route = Route::new(receivers);
        if route.is_empty() {
            self.routes.remove(&publisher);
        } else {
            self.routes.insert(publisher, route);
        }
        self
    }

    pub fn route(&self, publisher: &str) -> Option<&Route> {
        self.routes.get(publisher)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&String, &Route)> {
        self.routes.iter()
    }

    pub fn publishers(&self) -> BTreeSet<String> {
        self.routes.keys().cloned().collect()
    }

    pub fn receivers(&self) -> BTreeSet<String> {
        self.routes
            .values()
            .flat_map(|route| route.receivers().iter().cloned())
            .collect()
    }

    /// Every identity that appears in the table, as publisher or receiver.
    pub fn elements(&self) -> BTreeSet<String> {
        let mut elements = self.publishers();
        elements.extend(self.receivers());
        elements
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum RouteSourceError {
    #[error("failed to read routing table: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid routing table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Boundary to the element manager, which owns the topology.
pub trait RouteSource: Send + Sync {
    fn routes(&self) -> RoutingTable;
}

/// Routing table held in memory and replaced wholesale by the element
/// manager hook.
#[derive(Debug, Default)]
pub struct RouteTableStore {
    table: RwLock<RoutingTable>,
}

impl RouteTableStore {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }

    /// Loads a JSON object of `publisher -> [receivers]`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RouteSourceError> {
        let raw = std::fs::read_to_string(path)?;
        let table: RoutingTable = serde_json::from_str(&raw)?;
        Ok(Self::new(table))
    }

    pub fn replace(&self, table: RoutingTable) {
        *self.table.write() = table;
    }
}

impl RouteSource for RouteTableStore {
    fn routes(&self) -> RoutingTable {
        self.table.read().clone()
    }
}
