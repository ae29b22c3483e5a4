//! Registry for capability implementations
//!
//! Maps `(category, id)` pairs to live implementations. The registry is
//! assembled once through [`CapabilityRegistryBuilder`] and is immutable
//! afterwards, so lookups need no locking.

use super::{EnvProvider, HealthCheck, ObservabilitySink, ProxyMiddleware, RolloutStrategy, Runner};
use crate::{
    Error, Result,
    env::{FileEnvProvider, HostEnvProvider, StaticEnvProvider},
    health::{CommandHealthCheck, HttpHealthCheck, TcpHealthCheck},
    observability::TracingSink,
    proxy::{HeaderMiddleware, PathFilterMiddleware},
    rollout::{BlueGreenStrategy, RecreateStrategy},
    runners::{DockerRunner, ProcessRunner, ScriptRunner},
};
use hive_runtime::Spawner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// The six capability categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    /// Starts and stops instances
    Runner,
    /// Probes instance health
    HealthCheck,
    /// Supplies environment variables
    EnvProvider,
    /// Filters proxied traffic
    ProxyMiddleware,
    /// Receives observability events
    ObservabilitySink,
    /// Replaces running instances
    RolloutStrategy,
}

impl std::fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CapabilityCategory::Runner => "runner",
            CapabilityCategory::HealthCheck => "health check",
            CapabilityCategory::EnvProvider => "env provider",
            CapabilityCategory::ProxyMiddleware => "proxy middleware",
            CapabilityCategory::ObservabilitySink => "observability sink",
            CapabilityCategory::RolloutStrategy => "rollout strategy",
        };
        f.write_str(name)
    }
}

/// A live implementation of one capability
#[derive(Clone)]
pub enum Capability {
    /// Runner implementation
    Runner(Arc<dyn Runner>),
    /// Health check implementation
    HealthCheck(Arc<dyn HealthCheck>),
    /// Environment provider implementation
    EnvProvider(Arc<dyn EnvProvider>),
    /// Proxy middleware implementation
    ProxyMiddleware(Arc<dyn ProxyMiddleware>),
    /// Observability sink implementation
    ObservabilitySink(Arc<dyn ObservabilitySink>),
    /// Rollout strategy implementation
    RolloutStrategy(Arc<dyn RolloutStrategy>),
}

impl Capability {
    /// Category this implementation belongs to
    pub fn category(&self) -> CapabilityCategory {
        match self {
            Capability::Runner(_) => CapabilityCategory::Runner,
            Capability::HealthCheck(_) => CapabilityCategory::HealthCheck,
            Capability::EnvProvider(_) => CapabilityCategory::EnvProvider,
            Capability::ProxyMiddleware(_) => CapabilityCategory::ProxyMiddleware,
            Capability::ObservabilitySink(_) => CapabilityCategory::ObservabilitySink,
            Capability::RolloutStrategy(_) => CapabilityCategory::RolloutStrategy,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capability({})", self.category())
    }
}

#[derive(Default, Clone)]
struct Tables {
    runners: HashMap<String, Arc<dyn Runner>>,
    health_checks: HashMap<String, Arc<dyn HealthCheck>>,
    env_providers: HashMap<String, Arc<dyn EnvProvider>>,
    middleware: HashMap<String, Arc<dyn ProxyMiddleware>>,
    sinks: HashMap<String, Arc<dyn ObservabilitySink>>,
    rollout_strategies: HashMap<String, Arc<dyn RolloutStrategy>>,
}

/// Collects capability registrations at startup
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    tables: Tables,
}

impl CapabilityRegistryBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation under `id`; a later registration replaces an earlier one
    pub fn register(mut self, id: impl Into<String>, capability: Capability) -> Self {
        let id = id.into();
        debug!("Registering {} capability '{}'", capability.category(), id);

        let t = &mut self.tables;
        match capability {
            Capability::Runner(c) => {
                t.runners.insert(id, c);
            }
            Capability::HealthCheck(c) => {
                t.health_checks.insert(id, c);
            }
            Capability::EnvProvider(c) => {
                t.env_providers.insert(id, c);
            }
            Capability::ProxyMiddleware(c) => {
                t.middleware.insert(id, c);
            }
            Capability::ObservabilitySink(c) => {
                t.sinks.insert(id, c);
            }
            Capability::RolloutStrategy(c) => {
                t.rollout_strategies.insert(id, c);
            }
        }
        self
    }

    /// Register a runner
    pub fn runner(self, id: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.register(id, Capability::Runner(runner))
    }

    /// Register a health check
    pub fn health_check(self, id: impl Into<String>, check: Arc<dyn HealthCheck>) -> Self {
        self.register(id, Capability::HealthCheck(check))
    }

    /// Register an environment provider
    pub fn env_provider(self, id: impl Into<String>, provider: Arc<dyn EnvProvider>) -> Self {
        self.register(id, Capability::EnvProvider(provider))
    }

    /// Register a proxy middleware
    pub fn middleware(self, id: impl Into<String>, middleware: Arc<dyn ProxyMiddleware>) -> Self {
        self.register(id, Capability::ProxyMiddleware(middleware))
    }

    /// Register an observability sink
    pub fn sink(self, id: impl Into<String>, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.register(id, Capability::ObservabilitySink(sink))
    }

    /// Register a rollout strategy
    pub fn rollout_strategy(
        self,
        id: impl Into<String>,
        strategy: Arc<dyn RolloutStrategy>,
    ) -> Self {
        self.register(id, Capability::RolloutStrategy(strategy))
    }

    /// Freeze the registrations
    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            tables: self.tables,
        }
    }
}

/// Immutable registry of capability implementations
#[derive(Clone)]
pub struct CapabilityRegistry {
    tables: Tables,
}

impl CapabilityRegistry {
    /// Builder with no registrations
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    /// Builder pre-populated with the built-in implementations
    pub fn with_builtins(spawner: Arc<dyn Spawner>) -> CapabilityRegistryBuilder {
        let process = Arc::new(ProcessRunner::new(spawner));

        CapabilityRegistryBuilder::new()
            .runner("process", process.clone())
            .runner("script", Arc::new(ScriptRunner::new(process)))
            .runner("docker", Arc::new(DockerRunner::new()))
            .health_check("tcp", Arc::new(TcpHealthCheck))
            .health_check("http", Arc::new(HttpHealthCheck))
            .health_check("command", Arc::new(CommandHealthCheck))
            .env_provider("static", Arc::new(StaticEnvProvider))
            .env_provider("host", Arc::new(HostEnvProvider))
            .env_provider("file", Arc::new(FileEnvProvider))
            .middleware("headers", Arc::new(HeaderMiddleware))
            .middleware("path-filter", Arc::new(PathFilterMiddleware))
            .sink("tracing", Arc::new(TracingSink))
            .rollout_strategy("recreate", Arc::new(RecreateStrategy))
            .rollout_strategy("blue-green", Arc::new(BlueGreenStrategy))
    }

    /// Look up any capability
    pub fn get(&self, category: CapabilityCategory, id: &str) -> Result<Capability> {
        let t = &self.tables;
        let found = match category {
            CapabilityCategory::Runner => t.runners.get(id).cloned().map(Capability::Runner),
            CapabilityCategory::HealthCheck => {
                t.health_checks.get(id).cloned().map(Capability::HealthCheck)
            }
            CapabilityCategory::EnvProvider => {
                t.env_providers.get(id).cloned().map(Capability::EnvProvider)
            }
            CapabilityCategory::ProxyMiddleware => {
                t.middleware.get(id).cloned().map(Capability::ProxyMiddleware)
            }
            CapabilityCategory::ObservabilitySink => {
                t.sinks.get(id).cloned().map(Capability::ObservabilitySink)
            }
            CapabilityCategory::RolloutStrategy => t
                .rollout_strategies
                .get(id)
                .cloned()
                .map(Capability::RolloutStrategy),
        };
        found.ok_or_else(|| unknown(category, id))
    }

    /// Whether `id` is registered in `category`
    pub fn contains(&self, category: CapabilityCategory, id: &str) -> bool {
        self.get(category, id).is_ok()
    }

    /// Look up a runner
    pub fn runner(&self, id: &str) -> Result<Arc<dyn Runner>> {
        lookup(&self.tables.runners, CapabilityCategory::Runner, id)
    }

    /// Look up a health check
    pub fn health_check(&self, id: &str) -> Result<Arc<dyn HealthCheck>> {
        lookup(&self.tables.health_checks, CapabilityCategory::HealthCheck, id)
    }

    /// Look up an environment provider
    pub fn env_provider(&self, id: &str) -> Result<Arc<dyn EnvProvider>> {
        lookup(&self.tables.env_providers, CapabilityCategory::EnvProvider, id)
    }

    /// Look up a proxy middleware
    pub fn middleware(&self, id: &str) -> Result<Arc<dyn ProxyMiddleware>> {
        lookup(&self.tables.middleware, CapabilityCategory::ProxyMiddleware, id)
    }

    /// Look up an observability sink
    pub fn sink(&self, id: &str) -> Result<Arc<dyn ObservabilitySink>> {
        lookup(&self.tables.sinks, CapabilityCategory::ObservabilitySink, id)
    }

    /// Look up a rollout strategy
    pub fn rollout_strategy(&self, id: &str) -> Result<Arc<dyn RolloutStrategy>> {
        lookup(
            &self.tables.rollout_strategies,
            CapabilityCategory::RolloutStrategy,
            id,
        )
    }

    /// Every registered sink, sorted by id
    pub fn sinks(&self) -> Vec<(String, Arc<dyn ObservabilitySink>)> {
        let mut sinks: Vec<_> = self
            .tables
            .sinks
            .iter()
            .map(|(id, sink)| (id.clone(), sink.clone()))
            .collect();
        sinks.sort_by(|a, b| a.0.cmp(&b.0));
        sinks
    }

    /// Registered ids in a category, sorted
    pub fn list(&self, category: CapabilityCategory) -> Vec<String> {
        let t = &self.tables;
        let mut ids: Vec<String> = match category {
            CapabilityCategory::Runner => t.runners.keys().cloned().collect(),
            CapabilityCategory::HealthCheck => t.health_checks.keys().cloned().collect(),
            CapabilityCategory::EnvProvider => t.env_providers.keys().cloned().collect(),
            CapabilityCategory::ProxyMiddleware => t.middleware.keys().cloned().collect(),
            CapabilityCategory::ObservabilitySink => t.sinks.keys().cloned().collect(),
            CapabilityCategory::RolloutStrategy => t.rollout_strategies.keys().cloned().collect(),
        };
        ids.sort();
        ids
    }
}

fn lookup<T: ?Sized>(
    table: &HashMap<String, Arc<T>>,
    category: CapabilityCategory,
    id: &str,
) -> Result<Arc<T>> {
    table.get(id).cloned().ok_or_else(|| unknown(category, id))
}

fn unknown(category: CapabilityCategory, id: &str) -> Error {
    Error::UnknownCapability {
        category,
        id: id.to_string(),
    }
}
