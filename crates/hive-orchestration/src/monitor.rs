//! Background reconciliation and health monitoring
//!
//! The reconciler periodically compares every service's believed state with
//! its runner and re-probes settled instances. A service busy with another
//! operation is skipped for that pass.

use crate::{
    Result,
    capabilities::RuntimeContext,
    observability::ObservabilityEvent,
    orchestrator::{Inner, ManagedService, PRIMARY, ServiceOrchestrator},
    state::{ServiceSnapshot, ServiceState},
};
use chrono::Utc;
use futures::future::join_all;
use hive_runtime::sleep;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

impl ServiceOrchestrator {
    /// Start the periodic reconciler on the context's spawner
    ///
    /// The loop holds the orchestrator weakly and exits once every handle
    /// has been dropped.
    pub fn spawn_reconciler(&self) {
        let interval = self.inner.context.settings.reconcile_interval();
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .context
            .spawn(Box::pin(reconcile_loop(weak, interval)));
    }

    /// Run one reconciliation pass now, probing health regardless of age
    pub async fn monitor_once(&self) {
        self.inner.monitor_pass(true).await;
    }

    /// Probe one service's health now and apply the verdict
    pub async fn probe_health(&self, name: &str) -> Result<ServiceSnapshot> {
        let service = self
            .inner
            .services
            .get(name)
            .ok_or_else(|| crate::Error::ServiceNotFound(name.to_string()))?;
        let _guard = service.op_lock.lock().await;
        self.inner.monitor_service(service, true).await;
        Ok(self.inner.snapshot(service))
    }
}

async fn reconcile_loop(weak: Weak<Inner>, interval: Duration) {
    debug!("Reconciler started, interval {}ms", interval.as_millis());
    loop {
        sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.monitor_pass(false).await;
    }
    debug!("Reconciler stopped");
}

impl Inner {
    pub(crate) async fn monitor_pass(&self, force: bool) {
        join_all(self.services.values().map(|service| async move {
            let Some(_guard) = service.op_lock.try_lock() else {
                trace!(service = %service.name(), "Busy, skipping reconciliation");
                return;
            };
            self.monitor_service(service, force).await;
        }))
        .await;
    }

    /// Reconcile then re-probe; the caller holds the operation lock
    pub(crate) async fn monitor_service(&self, service: &ManagedService, force: bool) {
        if self.reconcile_locked(service).await.is_drift() {
            return;
        }

        let (state, handle, version, last_health) = {
            let runtime = service.runtime();
            (
                runtime.state,
                runtime.handle.clone(),
                runtime.version.clone(),
                runtime.last_health,
            )
        };
        let handle = match (state, handle) {
            (ServiceState::Running | ServiceState::Unhealthy, Some(handle)) => handle,
            _ => return,
        };
        if service.health.is_empty() {
            return;
        }
        if !force {
            let fresh = last_health.is_some_and(|mark| {
                (Utc::now() - mark.at)
                    .to_std()
                    .map_or(true, |age| age < service.config.health_gate.interval())
            });
            if fresh {
                return;
            }
        }

        let name = service.name();
        let ctx = RuntimeContext::new(name, PRIMARY)
            .with_version(version)
            .with_target(service.instance_target(&handle))
            .with_handle(handle);
        let verdict = service.health.probe(&ctx, &self.context.events).await;

        match (state, verdict.healthy) {
            (ServiceState::Running, false) => {
                self.context.routing.remove(name);
                let transition = {
                    let mut runtime = service.runtime_mut();
                    runtime.mark_health(false);
                    runtime.transition(ServiceState::Unhealthy, "monitor")
                };
                if let Err(e) = transition {
                    error!(service = %name, "Cannot mark service unhealthy: {}", e);
                    return;
                }
                let reason = verdict
                    .failure_summary()
                    .unwrap_or_else(|| "health check failed".to_string());
                let message = format!("Became unhealthy, route withdrawn: {}", reason);
                warn!(service = %name, "{}", message);
                self.context
                    .events
                    .emit(ObservabilityEvent::warning(name, message.clone()));
                self.record(service, message);
            }
            (ServiceState::Unhealthy, true) => {
                if let Some(target) = ctx.target.clone() {
                    self.context.routing.set(name, target);
                }
                let transition = {
                    let mut runtime = service.runtime_mut();
                    runtime.mark_health(true);
                    runtime.transition(ServiceState::Running, "monitor")
                };
                if let Err(e) = transition {
                    error!(service = %name, "Cannot mark service running: {}", e);
                    return;
                }
                self.record(service, "Health restored");
            }
            (_, healthy) => service.runtime_mut().mark_health(healthy),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CapabilityRef, HealthCheckSpec, HealthGate, OrchestratorSettings, ServiceConfig};
    use crate::proxy::RouteTarget;
    use crate::testing::{FakeRunner, ScriptedHealthCheck};
    use crate::{CapabilityRegistry, ServiceOrchestrator, ServiceState};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn orchestrator(
        runner: Arc<FakeRunner>,
        health: Arc<ScriptedHealthCheck>,
        reconcile_interval_ms: u64,
    ) -> ServiceOrchestrator {
        let config = ServiceConfig::new("api", CapabilityRef::bare("fake"))
            .with_health_check(HealthCheckSpec::new("scripted", Value::Null))
            .with_health_gate(HealthGate {
                interval_ms: 5,
                timeout_ms: 200,
            })
            .with_endpoint(RouteTarget::new("127.0.0.1", 7000));
        let registry = CapabilityRegistry::with_builtins(hive_runtime::default_spawner())
            .runner("fake", runner)
            .health_check("scripted", health)
            .build();
        let settings = OrchestratorSettings {
            reconcile_interval_ms,
            ..OrchestratorSettings::default()
        };
        ServiceOrchestrator::new(vec![config], registry, settings, hive_runtime::default_spawner())
            .unwrap()
    }

    #[smol_potat::test]
    async fn test_unhealthy_running_service_loses_route() {
        let runner = Arc::new(FakeRunner::new());
        let health = Arc::new(ScriptedHealthCheck::always(true));
        let orchestrator = orchestrator(runner, health.clone(), 60_000);
        orchestrator.start("api").await.unwrap();

        health.set_healthy(false);
        let snapshot = orchestrator.probe_health("api").await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Unhealthy);
        assert!(snapshot.target.is_none());

        health.set_healthy(true);
        let snapshot = orchestrator.probe_health("api").await.unwrap();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.target, Some(RouteTarget::new("127.0.0.1", 7000)));
    }

    #[smol_potat::test]
    async fn test_reconciler_corrects_killed_instance() {
        let runner = Arc::new(FakeRunner::new());
        let health = Arc::new(ScriptedHealthCheck::always(true));
        let orchestrator = orchestrator(runner.clone(), health, 20);
        let handle = orchestrator.start("api").await.unwrap().handle.unwrap();

        orchestrator.spawn_reconciler();
        runner.kill(&handle);

        let mut state = ServiceState::Running;
        for _ in 0..100 {
            smol::Timer::after(Duration::from_millis(10)).await;
            state = orchestrator.get_status("api").unwrap().state;
            if state == ServiceState::Stopped {
                break;
            }
        }
        assert_eq!(state, ServiceState::Stopped);
        assert!(orchestrator.routing_table().is_empty());
    }

    #[smol_potat::test]
    async fn test_monitor_once_on_stopped_services_is_quiet() {
        let runner = Arc::new(FakeRunner::new());
        let health = Arc::new(ScriptedHealthCheck::always(true));
        let orchestrator = orchestrator(runner, health.clone(), 60_000);

        orchestrator.monitor_once().await;
        assert_eq!(health.calls(), 0);
        assert_eq!(orchestrator.get_status("api").unwrap().state, ServiceState::Stopped);
    }
}
