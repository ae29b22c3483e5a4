//! Capability interfaces and the values that cross them.
//!
//! A capability is a narrow interface implemented by interchangeable
//! plugins. The orchestrator only ever talks to execution backends, health
//! probes, secret stores and proxies through these traits.

mod registry;
mod traits;

pub use registry::{Capability, CapabilityCategory, CapabilityRegistry, CapabilityRegistryBuilder};
pub use traits::{
    EnvProvider, HealthCheck, ObservabilitySink, ProxyMiddleware, RolloutStrategy, Runner,
};

use crate::proxy::RouteTarget;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Metadata key a runner sets to publish the instance's host
pub const HOST_KEY: &str = "host";
/// Metadata key a runner sets to publish the instance's port
pub const PORT_KEY: &str = "port";

/// Opaque handle to an instance produced by a runner
///
/// Identity is the `(runner_id, instance_id)` pair; metadata does not take
/// part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Runner-assigned instance identifier (pid, container id, ...)
    pub instance_id: String,
    /// Id of the runner that produced this handle
    pub runner_id: String,
    /// Small string-keyed metadata bag
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProcessHandle {
    /// Create a new handle
    pub fn new(runner_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            runner_id: runner_id.into(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Publish a network target in the metadata bag
    pub fn with_target(self, target: &RouteTarget) -> Self {
        self.with_metadata(HOST_KEY, target.host.clone())
            .with_metadata(PORT_KEY, target.port.to_string())
    }

    /// Network target published by the runner, if any
    pub fn target(&self) -> Option<RouteTarget> {
        let host = self.metadata.get(HOST_KEY)?;
        let port = self.metadata.get(PORT_KEY)?.parse().ok()?;
        Some(RouteTarget::new(host.clone(), port))
    }
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.runner_id == other.runner_id && self.instance_id == other.instance_id
    }
}

impl Eq for ProcessHandle {}

impl Hash for ProcessHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.runner_id.hash(state);
        self.instance_id.hash(state);
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.runner_id, self.instance_id)
    }
}

/// Information handed to capabilities about the instance being operated on
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Service name
    pub service: String,
    /// Instance label ("primary", "blue", "green", "old", "new")
    pub instance: String,
    /// Version tag being run
    pub version: String,
    /// Network target the instance should serve on
    pub target: Option<RouteTarget>,
    /// Handle of the running instance, when one exists
    pub handle: Option<ProcessHandle>,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl RuntimeContext {
    /// Context for an instance of `service`
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
            ..Default::default()
        }
    }

    /// Set the version tag
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the requested target
    pub fn with_target(mut self, target: Option<RouteTarget>) -> Self {
        self.target = target;
        self
    }

    /// Attach a running instance; its published target wins over the requested one
    pub fn with_handle(mut self, handle: ProcessHandle) -> Self {
        if let Some(target) = handle.target() {
            self.target = Some(target);
        }
        self.handle = Some(handle);
        self
    }
}

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResult {
    /// Whether the check passed
    pub healthy: bool,
    /// Optional human-readable message
    pub message: Option<String>,
    /// Time the check took
    pub response_time_ms: u64,
    /// Check-specific details
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl HealthResult {
    /// Passing result
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            response_time_ms: 0,
            details: HashMap::new(),
        }
    }

    /// Failing result with a reason
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            response_time_ms: 0,
            details: HashMap::new(),
        }
    }

    /// Record how long the check took
    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = elapsed.as_millis() as u64;
        self
    }

    /// Add a detail entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Exit status of a hook run to completion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, absent when killed by a signal
    pub code: Option<i32>,
}

impl ExitStatus {
    /// Status with the given code
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Whether the hook succeeded
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Request seen by proxy middleware
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProxyRequest {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Request body
    pub body: Vec<u8>,
}

impl ProxyRequest {
    /// Request with the given method and path
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Response seen by proxy middleware
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProxyResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Vec<u8>,
}

impl ProxyResponse {
    /// Response with a status and plain-text body
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }
}

/// Outcome of a middleware's request processing
#[derive(Debug, Clone, PartialEq)]
pub enum MiddlewareAction {
    /// Pass the (possibly modified) request down the chain
    Continue(ProxyRequest),
    /// Answer immediately without reaching the service
    ShortCircuit(ProxyResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_identity_ignores_metadata() {
        let a = ProcessHandle::new("process", "42").with_metadata("pid", "42");
        let b = ProcessHandle::new("process", "42");
        let c = ProcessHandle::new("docker", "42");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "process:42");
    }

    #[test]
    fn test_handle_target_roundtrip() {
        let target = RouteTarget::new("10.0.0.5", 8081);
        let handle = ProcessHandle::new("docker", "abc").with_target(&target);
        assert_eq!(handle.target(), Some(target));

        let bad = ProcessHandle::new("docker", "abc").with_metadata(PORT_KEY, "not-a-port");
        assert_eq!(bad.target(), None);
    }

    #[test]
    fn test_runtime_context_prefers_published_target() {
        let requested = RouteTarget::new("127.0.0.1", 8080);
        let published = RouteTarget::new("172.17.0.3", 80);
        let ctx = RuntimeContext::new("api", "primary")
            .with_target(Some(requested))
            .with_handle(ProcessHandle::new("docker", "c1").with_target(&published));

        assert_eq!(ctx.target, Some(published));
    }

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::from_code(0).success());
        assert!(!ExitStatus::from_code(2).success());
        assert!(!ExitStatus { code: None }.success());
    }
}
