//! Runtime state of managed services.
//!
//! [`ServiceRuntime`] is the orchestrator's believed state for one service.
//! [`reconcile`] is the pure comparison of that belief against what the
//! runner reports.

use crate::{
    Error, Result,
    capabilities::ProcessHandle,
    observability::LifecycleEvent,
    proxy::RouteTarget,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No instance exists
    Stopped,
    /// Instance started, waiting for health
    Starting,
    /// Instance healthy and routed
    Running,
    /// Instance exists but failed its health gate or a later probe
    Unhealthy,
    /// Instance is being shut down
    Stopping,
}

impl ServiceState {
    /// Whether moving to `next` is a legal lifecycle edge
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Unhealthy)
                | (Starting, Stopping)
                | (Starting, Stopped)
                | (Running, Starting)
                | (Running, Unhealthy)
                | (Running, Stopping)
                | (Running, Stopped)
                | (Unhealthy, Starting)
                | (Unhealthy, Running)
                | (Unhealthy, Stopping)
                | (Unhealthy, Stopped)
                | (Stopping, Unhealthy)
                | (Stopping, Stopped)
        )
    }

    /// Whether an instance is believed to exist
    pub fn has_instance(self) -> bool {
        !matches!(self, ServiceState::Stopped)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Last health observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMark {
    /// Verdict of the last probe round
    pub healthy: bool,
    /// When it was taken
    pub at: DateTime<Utc>,
}

/// Mutable per-service state owned by the orchestrator
#[derive(Debug, Clone)]
pub struct ServiceRuntime {
    /// Service name
    pub name: String,
    /// Current lifecycle state
    pub state: ServiceState,
    /// Handle of the live instance
    pub handle: Option<ProcessHandle>,
    /// Version tag of the live (or last) instance
    pub version: String,
    /// Last health verdict
    pub last_health: Option<HealthMark>,
    /// When the current state was entered
    pub since: DateTime<Utc>,
    /// Strategy-owned data that survives between rollouts
    pub rollout_metadata: HashMap<String, String>,
    history: VecDeque<LifecycleEvent>,
    history_len: usize,
}

impl ServiceRuntime {
    /// Fresh runtime in the Stopped state
    pub fn new(name: impl Into<String>, version: impl Into<String>, history_len: usize) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::Stopped,
            handle: None,
            version: version.into(),
            last_health: None,
            since: Utc::now(),
            rollout_metadata: HashMap::new(),
            history: VecDeque::new(),
            history_len,
        }
    }

    /// Move to `next`, rejecting illegal edges
    pub fn transition(&mut self, next: ServiceState, operation: &'static str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState {
                service: self.name.clone(),
                state: self.state,
                operation,
            });
        }
        self.state = next;
        self.since = Utc::now();
        if next == ServiceState::Stopped {
            self.handle = None;
            self.last_health = None;
        }
        Ok(())
    }

    /// Record a health verdict
    pub fn mark_health(&mut self, healthy: bool) {
        self.last_health = Some(HealthMark {
            healthy,
            at: Utc::now(),
        });
    }

    /// Keep a lifecycle event for status queries
    pub fn record(&mut self, event: LifecycleEvent) {
        if self.history_len == 0 {
            return;
        }
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    /// Recent lifecycle events, oldest first
    pub fn history(&self) -> impl Iterator<Item = &LifecycleEvent> {
        self.history.iter()
    }

    /// Point-in-time view for callers
    pub fn snapshot(&self, target: Option<RouteTarget>) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.name.clone(),
            state: self.state,
            healthy: self.last_health.map(|h| h.healthy),
            target,
            handle: self.handle.clone(),
            version: self.version.clone(),
            recent_events: self.history.iter().cloned().collect(),
        }
    }
}

/// Status of one service as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// Service name
    pub name: String,
    /// Lifecycle state
    pub state: ServiceState,
    /// Last health verdict, if any probe ran
    pub healthy: Option<bool>,
    /// Current routing target
    pub target: Option<RouteTarget>,
    /// Live instance handle
    pub handle: Option<ProcessHandle>,
    /// Version tag
    pub version: String,
    /// Most recent lifecycle events, oldest first
    pub recent_events: Vec<LifecycleEvent>,
}

impl ServiceSnapshot {
    /// Snapshot of a service with no instance
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::Stopped,
            healthy: None,
            target: None,
            handle: None,
            version: String::new(),
            recent_events: Vec::new(),
        }
    }
}

/// What the runner reports about an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// `is_running` returned true
    Running,
    /// `is_running` returned false, or there is no handle to ask about
    NotRunning,
}

impl From<bool> for Observation {
    fn from(running: bool) -> Self {
        if running {
            Observation::Running
        } else {
            Observation::NotRunning
        }
    }
}

/// Outcome of comparing believed and observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Belief matches ground truth (or an operation owns the state)
    InSync,
    /// Belief was wrong and must be corrected
    Corrected {
        /// Believed state
        from: ServiceState,
        /// Corrected state
        to: ServiceState,
    },
}

impl Reconciliation {
    /// Whether drift was found
    pub fn is_drift(&self) -> bool {
        matches!(self, Reconciliation::Corrected { .. })
    }
}

/// Compare the believed state with the runner's observation
///
/// Only settled states with an instance are judged. Starting and Stopping
/// belong to an in-flight operation, and a Stopped service has nothing to
/// observe.
pub fn reconcile(believed: ServiceState, observed: Observation) -> Reconciliation {
    match (believed, observed) {
        (ServiceState::Running | ServiceState::Unhealthy, Observation::NotRunning) => {
            Reconciliation::Corrected {
                from: believed,
                to: ServiceState::Stopped,
            }
        }
        _ => Reconciliation::InSync,
    }
}
