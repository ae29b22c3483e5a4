//! Service configuration types.
//!
//! The orchestrator consumes an already-resolved set of [`ServiceConfig`]
//! values. Capability-specific settings stay opaque JSON blobs that only the
//! named capability interprets.

use crate::proxy::RouteTarget;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Reference to a registered capability plus its configuration blob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRef {
    /// Registry identifier (e.g. `"docker"`, `"http"`)
    pub id: String,
    /// Capability-specific configuration
    #[serde(default)]
    pub config: Value,
}

impl CapabilityRef {
    /// Create a new capability reference
    pub fn new(id: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }

    /// Reference without configuration
    pub fn bare(id: impl Into<String>) -> Self {
        Self::new(id, Value::Null)
    }
}

/// Dependency on another service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "DependencyRepr")]
pub struct Dependency {
    /// Name of the service depended upon
    pub service: String,
    /// Dependents may start even if this dependency fails to reach Running
    #[serde(default)]
    pub best_effort: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Name(String),
    Full {
        service: String,
        #[serde(default)]
        best_effort: bool,
    },
}

impl From<DependencyRepr> for Dependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Name(service) => Dependency {
                service,
                best_effort: false,
            },
            DependencyRepr::Full {
                service,
                best_effort,
            } => Dependency {
                service,
                best_effort,
            },
        }
    }
}

impl Dependency {
    /// Hard dependency that must reach Running first
    pub fn required(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            best_effort: false,
        }
    }

    /// Dependency whose failure only produces a warning
    pub fn best_effort(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            best_effort: true,
        }
    }
}

/// One entry of a service's health check list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    /// Health check capability id
    pub id: String,
    /// Check-specific configuration
    #[serde(default)]
    pub config: Value,
    /// Per-check timeout; exceeding it counts as unhealthy
    #[serde(default = "default_check_timeout_ms")]
    pub timeout_ms: u64,
}

impl HealthCheckSpec {
    /// Create a health check entry with the default timeout
    pub fn new(id: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            config,
            timeout_ms: default_check_timeout_ms(),
        }
    }

    /// Override the per-check timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Per-check timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_check_timeout_ms() -> u64 {
    5_000
}

/// Polling parameters for health-gated waits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthGate {
    /// Delay between health polls
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Deadline for becoming healthy
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthGate {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_gate_timeout_ms(),
        }
    }
}

impl HealthGate {
    /// Delay between polls
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Deadline for the whole wait
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_gate_timeout_ms() -> u64 {
    60_000
}

/// What to do when a hook fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Halt the operation
    #[default]
    Abort,
    /// Log and continue
    Warn,
}

/// A lifecycle hook executed through a runner's `run_hook`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookConfig {
    /// Runner capability id that executes the hook
    pub runner: String,
    /// Runner-specific hook configuration
    #[serde(default)]
    pub config: Value,
    /// Failure policy
    #[serde(default)]
    pub policy: FailurePolicy,
}

impl HookConfig {
    /// Create a hook with the given policy
    pub fn new(runner: impl Into<String>, config: Value, policy: FailurePolicy) -> Self {
        Self {
            runner: runner.into(),
            config,
            policy,
        }
    }
}

/// Hooks around the start and stop transitions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LifecycleHooks {
    /// Run before the runner starts the instance
    #[serde(default)]
    pub pre_up: Vec<HookConfig>,
    /// Run after the instance became healthy
    #[serde(default)]
    pub post_up: Vec<HookConfig>,
    /// Run before the instance is stopped
    #[serde(default)]
    pub pre_down: Vec<HookConfig>,
    /// Run after the runner confirmed termination
    #[serde(default)]
    pub post_down: Vec<HookConfig>,
}

impl LifecycleHooks {
    /// Iterate every hook
    pub fn all(&self) -> impl Iterator<Item = &HookConfig> {
        self.pre_up
            .iter()
            .chain(&self.post_up)
            .chain(&self.pre_down)
            .chain(&self.post_down)
    }
}

/// Configuration for a service managed by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Unique service name
    pub name: String,
    /// Version tag of the configured build
    #[serde(default = "default_version")]
    pub version: String,
    /// Services this service depends on
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Runner that executes the service
    pub runner: CapabilityRef,
    /// Health checks, all of which must pass
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    /// Environment providers, merged in order
    #[serde(default)]
    pub env: Vec<CapabilityRef>,
    /// Service-local variables applied after all providers
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
    /// Proxy middleware chain, applied in order
    #[serde(default)]
    pub middleware: Vec<CapabilityRef>,
    /// Rollout strategy
    #[serde(default = "default_rollout")]
    pub rollout: CapabilityRef,
    /// Lifecycle hooks
    #[serde(default)]
    pub hooks: LifecycleHooks,
    /// Health gate used during start and rollout
    #[serde(default)]
    pub health_gate: HealthGate,
    /// Default network target published in the routing table
    #[serde(default)]
    pub endpoint: Option<RouteTarget>,
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_rollout() -> CapabilityRef {
    CapabilityRef::bare("recreate")
}

impl ServiceConfig {
    /// Create a config with defaults for everything but the runner
    pub fn new(name: impl Into<String>, runner: CapabilityRef) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            dependencies: Vec::new(),
            runner,
            health_checks: Vec::new(),
            env: Vec::new(),
            env_overrides: HashMap::new(),
            middleware: Vec::new(),
            rollout: default_rollout(),
            hooks: LifecycleHooks::default(),
            health_gate: HealthGate::default(),
            endpoint: None,
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Add a health check
    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_checks.push(check);
        self
    }

    /// Set the default endpoint
    pub fn with_endpoint(mut self, endpoint: RouteTarget) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Set the rollout strategy
    pub fn with_rollout(mut self, rollout: CapabilityRef) -> Self {
        self.rollout = rollout;
        self
    }

    /// Set the health gate
    pub fn with_health_gate(mut self, gate: HealthGate) -> Self {
        self.health_gate = gate;
        self
    }

    /// Set the version tag
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Names of the services this one depends on
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.service.as_str())
    }
}

/// Orchestrator-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSettings {
    /// Period of the background reconciliation loop
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Per-sink event queue capacity; overflow drops events
    #[serde(default = "default_sink_capacity")]
    pub sink_queue_capacity: usize,
    /// Lifecycle events kept per service for status queries
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// How long to wait for a runner to confirm termination
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            sink_queue_capacity: default_sink_capacity(),
            history_len: default_history_len(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl OrchestratorSettings {
    /// Period of the reconciliation loop
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Stop confirmation deadline
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn default_reconcile_interval_ms() -> u64 {
    5_000
}

fn default_sink_capacity() -> usize {
    1_024
}

fn default_history_len() -> usize {
    5
}

fn default_stop_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_config_yaml_defaults() {
        let yaml = r#"
name: api
runner:
  id: process
  config:
    command: ./api
dependencies:
  - db
  - service: cache
    best_effort: true
health_checks:
  - id: http
    config:
      path: /health
"#;
        let config: ServiceConfig = serde_yaml::from_str(yaml).expect("Failed to deserialize");

        assert_eq!(config.version, "latest");
        assert_eq!(config.rollout, CapabilityRef::bare("recreate"));
        assert_eq!(
            config.dependencies,
            vec![Dependency::required("db"), Dependency::best_effort("cache")]
        );
        assert_eq!(config.health_checks[0].timeout_ms, 5_000);
        assert_eq!(config.health_gate, HealthGate::default());
        assert!(config.endpoint.is_none());
    }

    #[test]
    fn test_hook_policy_serialization() {
        let hook = HookConfig::new("script", json!({ "script": "echo hi" }), FailurePolicy::Warn);
        let yaml = serde_yaml::to_string(&hook).expect("Failed to serialize");
        assert!(yaml.contains("policy: warn"));

        let parsed: HookConfig = serde_yaml::from_str("runner: script").expect("Failed to parse");
        assert_eq!(parsed.policy, FailurePolicy::Abort);
    }

    #[test]
    fn test_lifecycle_hooks_all() {
        let hook = HookConfig::new("process", Value::Null, FailurePolicy::Abort);
        let hooks = LifecycleHooks {
            pre_up: vec![hook.clone()],
            post_down: vec![hook.clone(), hook],
            ..Default::default()
        };
        assert_eq!(hooks.all().count(), 3);
    }

    #[test]
    fn test_settings_defaults() {
        let settings: OrchestratorSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings, OrchestratorSettings::default());
        assert_eq!(settings.history_len, 5);
    }
}
