//! Shared fixtures for the orchestration integration tests

#![allow(dead_code)]

use hive_orchestration::testing::{CallLog, FakeRunner, RotatingEnvProvider, ScriptedHealthCheck};
use hive_orchestration::{
    CapabilityRef, CapabilityRegistry, HealthCheckSpec, HealthGate, MemorySink,
    OrchestratorSettings, RouteTarget, ServiceConfig, ServiceOrchestrator,
};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route tracing output through the test harness; `RUST_LOG` selects levels
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub orchestrator: ServiceOrchestrator,
    pub runner: Arc<FakeRunner>,
    pub health: Arc<ScriptedHealthCheck>,
    pub sink: Arc<MemorySink>,
    pub secrets: Arc<RotatingEnvProvider>,
    pub log: Arc<CallLog>,
}

impl Harness {
    pub fn new(configs: Vec<ServiceConfig>) -> Self {
        Self::with_health(configs, ScriptedHealthCheck::always(true))
    }

    pub fn with_health(configs: Vec<ServiceConfig>, health: ScriptedHealthCheck) -> Self {
        Self::try_new(configs, health).expect("valid configuration")
    }

    pub fn try_new(
        configs: Vec<ServiceConfig>,
        health: ScriptedHealthCheck,
    ) -> hive_orchestration::Result<Self> {
        init_tracing();
        let log = CallLog::new();
        let runner = Arc::new(FakeRunner::with_log(log.clone()));
        let health = Arc::new(health.with_log(log.clone()));
        let sink = Arc::new(MemorySink::new(1024));
        let secrets = Arc::new(RotatingEnvProvider::new("DB_PASSWORD", "initial"));
        let spawner = hive_runtime::default_spawner();

        let registry = CapabilityRegistry::with_builtins(spawner.clone())
            .runner("fake", runner.clone())
            .health_check("scripted", health.clone())
            .sink("memory", sink.clone())
            .env_provider("secrets", secrets.clone())
            .build();
        let settings = OrchestratorSettings {
            stop_timeout_ms: 1_000,
            reconcile_interval_ms: 60_000,
            ..OrchestratorSettings::default()
        };
        let orchestrator = ServiceOrchestrator::new(configs, registry, settings, spawner)?;

        Ok(Self {
            orchestrator,
            runner,
            health,
            sink,
            secrets,
            log,
        })
    }

    /// Warnings delivered to the memory sink so far
    pub async fn warnings(&self) -> usize {
        self.orchestrator
            .events()
            .flush()
            .await
            .expect("flush events");
        self.sink.warnings().len()
    }
}

pub fn gate() -> HealthGate {
    HealthGate {
        interval_ms: 5,
        timeout_ms: 200,
    }
}

/// Service on the fake runner with one scripted health check
pub fn service(name: &str, port: u16) -> ServiceConfig {
    ServiceConfig::new(name, CapabilityRef::bare("fake"))
        .with_health_check(HealthCheckSpec::new("scripted", Value::Null))
        .with_health_gate(gate())
        .with_endpoint(RouteTarget::new("127.0.0.1", port))
}
