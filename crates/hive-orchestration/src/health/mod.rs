//! Health checking for service instances.
//!
//! A [`HealthChecker`] binds a service's configured check list to the
//! registered implementations once, then aggregates every check into a
//! single verdict. All checks must pass; a check that errors or exceeds its
//! timeout counts as unhealthy without cutting the others short.

mod checks;

pub use checks::{CommandHealthCheck, HttpHealthCheck, TcpHealthCheck};

use crate::{
    Error, Result,
    capabilities::{CapabilityRegistry, HealthCheck, HealthResult, RuntimeContext},
    config::{HealthCheckSpec, HealthGate},
    observability::{EventCollector, ObservabilityEvent},
};
use futures::future::join_all;
use hive_runtime::{sleep, timeout};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Aggregated outcome of one round of health checks
#[derive(Debug, Clone, PartialEq)]
pub struct HealthVerdict {
    /// True when every check passed (vacuously true with no checks)
    pub healthy: bool,
    /// Individual results keyed by check id, in configured order
    pub results: Vec<(String, HealthResult)>,
}

impl HealthVerdict {
    fn from_results(results: Vec<(String, HealthResult)>) -> Self {
        Self {
            healthy: results.iter().all(|(_, r)| r.healthy),
            results,
        }
    }

    /// First failure message, for logs and errors
    pub fn failure_summary(&self) -> Option<String> {
        self.results
            .iter()
            .find(|(_, r)| !r.healthy)
            .map(|(id, r)| format!("{}: {}", id, r.message.as_deref().unwrap_or("unhealthy")))
    }
}

/// Health checker bound to one service's check list
pub struct HealthChecker {
    service: String,
    checks: Vec<(HealthCheckSpec, Arc<dyn HealthCheck>)>,
}

impl HealthChecker {
    /// Resolve every configured check against the registry
    pub fn resolve(
        service: impl Into<String>,
        specs: &[HealthCheckSpec],
        registry: &CapabilityRegistry,
    ) -> Result<Self> {
        let checks = specs
            .iter()
            .map(|spec| Ok((spec.clone(), registry.health_check(&spec.id)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            service: service.into(),
            checks,
        })
    }

    /// Whether no checks are configured
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check once, concurrently, and compute the verdict
    pub async fn check(&self, ctx: &RuntimeContext) -> HealthVerdict {
        let probes = self.checks.iter().map(|(spec, check)| async move {
            let started = Instant::now();
            let result = match timeout(spec.timeout(), check.check(&spec.config, ctx)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => HealthResult::unhealthy(e.to_string()),
                Err(elapsed) => HealthResult::unhealthy(elapsed.to_string()),
            };
            let result = if result.response_time_ms == 0 {
                result.with_response_time(started.elapsed())
            } else {
                result
            };
            (spec.id.clone(), result)
        });

        HealthVerdict::from_results(join_all(probes).await)
    }

    /// Run one round and publish a health event per check
    pub async fn probe(&self, ctx: &RuntimeContext, events: &EventCollector) -> HealthVerdict {
        let verdict = self.check(ctx).await;
        for (id, result) in &verdict.results {
            events.emit(ObservabilityEvent::health(&self.service, id, result.clone()));
        }
        verdict
    }

    /// Poll until healthy or until the gate's deadline passes
    ///
    /// With no configured checks this returns immediately without probing.
    pub async fn wait_until_healthy(
        &self,
        ctx: &RuntimeContext,
        gate: &HealthGate,
        events: &EventCollector,
    ) -> Result<HealthVerdict> {
        if self.is_empty() {
            debug!(service = %self.service, "No health checks configured");
            return Ok(HealthVerdict::from_results(Vec::new()));
        }

        let deadline = Instant::now() + gate.timeout();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let verdict = self.probe(ctx, events).await;
            if verdict.healthy {
                info!(service = %self.service, attempts, "Service is healthy");
                return Ok(verdict);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    service = %self.service,
                    attempts,
                    "Health gate timed out: {}",
                    verdict.failure_summary().unwrap_or_default()
                );
                return Err(Error::HealthTimeout {
                    service: self.service.clone(),
                    timeout_ms: gate.timeout_ms,
                });
            }

            debug!(
                service = %self.service,
                attempts,
                "Not healthy yet: {}",
                verdict.failure_summary().unwrap_or_default()
            );
            sleep(gate.interval().min(deadline - now)).await;
        }
    }
}
