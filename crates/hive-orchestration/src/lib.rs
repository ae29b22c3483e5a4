//! # Hive orchestration
//!
//! Service orchestration core for the Hive subsystem.
//!
//! This crate starts, stops, health-gates and rolls out a set of named
//! services. Every service is backed by pluggable capabilities (runners,
//! health checks, environment providers, proxy middleware, observability
//! sinks and rollout strategies) looked up by string id in a
//! [`CapabilityRegistry`] that is validated before anything starts.
//!
//! ## Example
//!
//! ```no_run
//! use hive_orchestration::{
//!     CapabilityRef, CapabilityRegistry, OrchestratorSettings, ServiceConfig,
//!     ServiceOrchestrator,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> hive_orchestration::Result<()> {
//! let spawner = hive_runtime::default_spawner();
//! let registry = CapabilityRegistry::with_builtins(spawner.clone()).build();
//!
//! let web = ServiceConfig::new(
//!     "web",
//!     CapabilityRef::new("process", json!({ "command": "python3", "args": ["-m", "http.server", "8080"] })),
//! );
//!
//! let orchestrator =
//!     ServiceOrchestrator::new(vec![web], registry, OrchestratorSettings::default(), spawner)?;
//! let snapshot = orchestrator.start("web").await?;
//! println!("{} is {}", snapshot.name, snapshot.state);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod capabilities;
mod config;
mod context;
mod dependency;
mod env;
mod health;
mod monitor;
mod observability;
mod orchestrator;
mod proxy;
mod rollout;
mod runners;
mod state;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use capabilities::{
    Capability, CapabilityCategory, CapabilityRegistry, CapabilityRegistryBuilder, EnvProvider,
    ExitStatus, HealthCheck, HealthResult, MiddlewareAction, ObservabilitySink, ProcessHandle,
    ProxyMiddleware, ProxyRequest, ProxyResponse, RolloutStrategy, Runner, RuntimeContext,
};
pub use config::{
    CapabilityRef, Dependency, FailurePolicy, HealthCheckSpec, HealthGate, HookConfig,
    LifecycleHooks, OrchestratorSettings, ServiceConfig,
};
pub use context::OrchestrationContext;
pub use dependency::DependencyGraph;
pub use env::{EnvironmentResolver, FileEnvProvider, HostEnvProvider, StaticEnvProvider};
pub use health::{
    CommandHealthCheck, HealthChecker, HealthVerdict, HttpHealthCheck, TcpHealthCheck,
};
pub use observability::{
    EventCollector, HealthCheckEvent, JsonLinesSink, LifecycleEvent, LogEvent, LogLevel,
    MemorySink, MetricEvent, ObservabilityEvent, TracingSink,
};
pub use orchestrator::ServiceOrchestrator;
pub use proxy::{
    HeaderMiddleware, PathFilterMiddleware, ProxyRouter, RouteDecision, RouteEntry, RouteTarget,
    RoutingTable,
};
pub use rollout::{
    BlueGreenState, BlueGreenStrategy, Color, NEW_LABEL, OLD_LABEL, RecreateStrategy,
    RolloutContext, RolloutOps, RolloutReport, RolloutStep, StepResult,
};
pub use runners::{DockerRunner, ProcessRunner, ScriptRunner};
pub use state::{
    HealthMark, Observation, Reconciliation, ServiceRuntime, ServiceSnapshot, ServiceState,
    reconcile,
};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A capability id is not registered in its category
    #[error("Unknown {category} capability: {id}")]
    UnknownCapability {
        /// Capability category searched
        category: CapabilityCategory,
        /// Missing identifier
        id: String,
    },

    /// The declared dependencies contain a cycle
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A dependency names a service that is not configured
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    MissingDependency {
        /// Declaring service
        service: String,
        /// Missing dependency name
        dependency: String,
    },

    /// A dependency did not reach Running, so its dependent was not started
    #[error("Service '{service}' was not started: dependency '{dependency}' failed: {reason}")]
    DependencyFailed {
        /// Dependent service
        service: String,
        /// Failed dependency
        dependency: String,
        /// Why the dependency failed
        reason: String,
    },

    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the service's current state
    #[error("Cannot {operation} service '{service}' while it is {state}")]
    InvalidState {
        /// Service name
        service: String,
        /// Current state
        state: ServiceState,
        /// Requested operation
        operation: &'static str,
    },

    /// Runner capability failure
    #[error("Runner error: {0}")]
    Runner(String),

    /// Lifecycle hook failure
    #[error("Hook '{hook}' failed for service '{service}': {message}")]
    Hook {
        /// Service name
        service: String,
        /// Hook phase
        hook: &'static str,
        /// Failure description
        message: String,
    },

    /// Health gate deadline passed before the instance became healthy
    #[error("Service '{service}' did not become healthy within {timeout_ms}ms")]
    HealthTimeout {
        /// Service name
        service: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Health check error
    #[error("Health check error: {0}")]
    HealthCheck(String),

    /// Environment provider failure
    #[error("Environment provider error: {0}")]
    Env(String),

    /// Operation was cancelled by a concurrent stop
    #[error("Start of service '{0}' was cancelled")]
    Cancelled(String),

    /// Rollout step failure (rolled back)
    #[error("Rollout error: {0}")]
    Rollout(String),

    /// Rollback itself failed; traffic state is unknown
    #[error("Rollback of service '{service}' failed, routing state is unknown: {message}")]
    RollbackFailed {
        /// Service name
        service: String,
        /// Failure description
        message: String,
    },

    /// A state-changing operation failed; carries the resulting snapshot
    #[error("{operation} of service '{}' failed (now {}): {source}", .snapshot.name, .snapshot.state)]
    Operation {
        /// Operation name
        operation: &'static str,
        /// Runtime snapshot after the failure
        snapshot: Box<ServiceSnapshot>,
        /// Underlying error
        source: Box<Error>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// The innermost error, looking through [`Error::Operation`] wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Snapshot attached to a failed operation, if any
    pub fn snapshot(&self) -> Option<&ServiceSnapshot> {
        match self {
            Error::Operation { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }

    /// Whether this error is fatal for the whole orchestrator run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::UnknownCapability { .. }
                | Error::DependencyCycle(_)
                | Error::MissingDependency { .. }
                | Error::RollbackFailed { .. }
        )
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
