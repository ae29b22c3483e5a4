//! Proxy routing table and request-path helpers.
//!
//! The table maps a service name to its live network target. Writers (the
//! lifecycle code and rollout strategies) serialize on a single mutex and
//! publish a whole new map; readers clone the current map pointer and never
//! wait on a writer's critical section.

mod middleware;
mod router;

pub use middleware::{HeaderMiddleware, PathFilterMiddleware};
pub use router::{ProxyRouter, RouteDecision};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Network address of a service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteTarget {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RouteTarget {
    /// Create a target
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A routing table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Current target
    pub target: RouteTarget,
    /// When the entry was written
    pub updated_at: DateTime<Utc>,
}

type Routes = HashMap<String, Arc<RouteEntry>>;

/// Shared service-name to target mapping
#[derive(Debug, Default)]
pub struct RoutingTable {
    current: RwLock<Arc<Routes>>,
    writer: Mutex<()>,
}

impl RoutingTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entry for `service`
    pub fn get(&self, service: &str) -> Option<Arc<RouteEntry>> {
        self.snapshot().get(service).cloned()
    }

    /// Current target for `service`
    pub fn target(&self, service: &str) -> Option<RouteTarget> {
        self.get(service).map(|entry| entry.target.clone())
    }

    /// Immutable view of the whole table at this instant
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<RouteEntry>>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of routed services
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no service is routed
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Point `service` at `target`, returning the replaced entry
    pub fn set(&self, service: &str, target: RouteTarget) -> Option<RouteEntry> {
        debug!(service, to = %target, "Updating route");
        let entry = RouteEntry {
            target,
            updated_at: Utc::now(),
        };
        self.update(|routes| routes.insert(service.to_string(), Arc::new(entry)))
    }

    /// Remove the entry for `service`, returning it
    pub fn remove(&self, service: &str) -> Option<RouteEntry> {
        debug!(service, "Removing route");
        self.update(|routes| routes.remove(service))
    }

    /// Put back an entry captured earlier, exactly as it was
    ///
    /// `None` removes the entry, which restores a service that had no route.
    pub fn restore(&self, service: &str, previous: Option<RouteEntry>) -> Option<RouteEntry> {
        debug!(service, restored = previous.is_some(), "Restoring route");
        self.update(|routes| match previous {
            Some(entry) => routes.insert(service.to_string(), Arc::new(entry)),
            None => routes.remove(service),
        })
    }

    /// The single write primitive: copy, modify, publish
    fn update<F>(&self, change: F) -> Option<RouteEntry>
    where
        F: FnOnce(&mut Routes) -> Option<Arc<RouteEntry>>,
    {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut routes = (*self.snapshot()).clone();
        let previous = change(&mut routes);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(routes);
        previous.map(|entry| (*entry).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let table = RoutingTable::new();
        assert!(table.is_empty());

        assert_eq!(table.set("web", RouteTarget::new("127.0.0.1", 8080)), None);
        assert_eq!(table.target("web"), Some(RouteTarget::new("127.0.0.1", 8080)));

        let previous = table.set("web", RouteTarget::new("127.0.0.1", 8081)).unwrap();
        assert_eq!(previous.target.port, 8080);

        let removed = table.remove("web").unwrap();
        assert_eq!(removed.target.port, 8081);
        assert!(table.get("web").is_none());
        assert!(table.remove("web").is_none());
    }

    #[test]
    fn test_restore_is_exact() {
        let table = RoutingTable::new();
        table.set("web", RouteTarget::new("10.0.0.1", 80));
        let before = table.get("web").map(|e| (*e).clone());

        table.set("web", RouteTarget::new("10.0.0.2", 80));
        table.restore("web", before.clone());

        assert_eq!(table.get("web").map(|e| (*e).clone()), before);

        table.restore("api", None);
        assert!(table.get("api").is_none());
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let table = RoutingTable::new();
        table.set("web", RouteTarget::new("10.0.0.1", 80));

        let snapshot = table.snapshot();
        table.set("web", RouteTarget::new("10.0.0.2", 80));
        table.set("api", RouteTarget::new("10.0.0.3", 80));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["web"].target.host, "10.0.0.1");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_concurrent_writers_never_tear_entries() {
        let table = Arc::new(RoutingTable::new());
        let writers: Vec<_> = (0..4u16)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for n in 0..200u16 {
                        // host and port always agree for a consistent entry
                        let port = i * 1000 + n;
                        table.set("web", RouteTarget::new(format!("h{}", port), port));
                    }
                })
            })
            .collect();

        let reader = {
            let table = table.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(entry) = table.get("web") {
                        assert_eq!(entry.target.host, format!("h{}", entry.target.port));
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert!(table.get("web").is_some());
    }
}
