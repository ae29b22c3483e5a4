//! Rollout strategies and the values they operate on.
//!
//! A strategy never touches runners or the routing table directly. It plans
//! a list of [`RolloutStep`]s and executes each through [`RolloutOps`],
//! which the orchestrator binds to one service.

mod blue_green;
mod recreate;

pub use blue_green::{BlueGreenState, BlueGreenStrategy, Color};
pub use recreate::RecreateStrategy;

use crate::{
    Result,
    capabilities::ProcessHandle,
    proxy::{RouteEntry, RouteTarget},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Label of the instance that was live when the rollout began
pub const OLD_LABEL: &str = "old";
/// Label of the replacement instance for strategies without colors
pub const NEW_LABEL: &str = "new";

/// One step of a rollout plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStep {
    /// Start the new version
    StartNew,
    /// Wait for the new instance's health gate
    WaitHealthy,
    /// Point the routing table at the new instance
    SwitchTraffic,
    /// Stop the previously live instance
    StopOld,
    /// Persist strategy state for the next rollout
    Finalize,
}

impl std::fmt::Display for RolloutStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RolloutStep::StartNew => "start-new",
            RolloutStep::WaitHealthy => "wait-healthy",
            RolloutStep::SwitchTraffic => "switch-traffic",
            RolloutStep::StopOld => "stop-old",
            RolloutStep::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Outcome of an executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step
    pub step: RolloutStep,
    /// What it did
    pub detail: String,
}

impl StepResult {
    /// Completed step with a description
    pub fn done(step: RolloutStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
        }
    }
}

/// Mutable state of one rollout
#[derive(Debug, Clone)]
pub struct RolloutContext {
    /// Service being rolled out
    pub service: String,
    /// Version live before the rollout
    pub old_version: String,
    /// Version being rolled out
    pub new_version: String,
    /// Strategy configuration
    pub config: Value,
    /// Instances by label
    pub instances: HashMap<String, ProcessHandle>,
    /// Label of the instance currently serving, if any
    pub live: Option<String>,
    /// Routing entry captured before the first step
    pub previous_route: Option<RouteEntry>,
    /// Strategy state carried between rollouts
    pub metadata: HashMap<String, String>,
}

impl RolloutContext {
    /// Context for replacing `current` (labelled [`OLD_LABEL`])
    pub fn new(
        service: impl Into<String>,
        old_version: impl Into<String>,
        new_version: impl Into<String>,
        current: ProcessHandle,
    ) -> Self {
        Self {
            service: service.into(),
            old_version: old_version.into(),
            new_version: new_version.into(),
            config: Value::Null,
            instances: HashMap::from([(OLD_LABEL.to_string(), current)]),
            live: Some(OLD_LABEL.to_string()),
            previous_route: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the strategy configuration
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Set the routing entry to restore on rollback
    pub fn with_previous_route(mut self, previous: Option<RouteEntry>) -> Self {
        self.previous_route = previous;
        self
    }

    /// Seed the persisted strategy state
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Handle of the instance labelled `label`
    pub fn instance(&self, label: &str) -> Option<&ProcessHandle> {
        self.instances.get(label)
    }

    /// Re-label an instance
    pub fn relabel(&mut self, from: &str, to: &str) {
        if let Some(handle) = self.instances.remove(from) {
            self.instances.insert(to.to_string(), handle);
            if self.live.as_deref() == Some(from) {
                self.live = Some(to.to_string());
            }
        }
    }

    /// Handle of the instance currently serving
    pub fn live_handle(&self) -> Option<&ProcessHandle> {
        self.live.as_deref().and_then(|label| self.instances.get(label))
    }
}

/// Operations a strategy may perform on the service being rolled out
#[async_trait]
pub trait RolloutOps: Send + Sync {
    /// Start an instance of `version` under `label`, serving on `target`
    async fn start_instance(
        &self,
        label: &str,
        version: &str,
        target: Option<RouteTarget>,
    ) -> Result<ProcessHandle>;

    /// Block until the instance passes its health gate
    async fn wait_healthy(&self, label: &str, handle: &ProcessHandle) -> Result<()>;

    /// Stop an instance and wait for confirmation
    async fn stop_instance(&self, handle: &ProcessHandle) -> Result<()>;

    /// Atomically point the service's route at `target`, returning the old entry
    fn switch_traffic(&self, target: RouteTarget) -> Option<RouteEntry>;

    /// Remove the service's route, returning the old entry
    fn withdraw_traffic(&self) -> Option<RouteEntry>;

    /// Put back a previously captured entry exactly
    fn restore_traffic(&self, previous: Option<RouteEntry>);

    /// The service's configured endpoint
    fn default_target(&self) -> Option<RouteTarget>;
}

/// Summary returned by a successful rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutReport {
    /// Service name
    pub service: String,
    /// Strategy id
    pub strategy: String,
    /// Version replaced
    pub old_version: String,
    /// Version now live
    pub new_version: String,
    /// Executed steps in order
    pub steps: Vec<StepResult>,
    /// Routing target after the rollout
    pub target: Option<RouteTarget>,
    /// Persisted strategy state
    pub metadata: HashMap<String, String>,
}
