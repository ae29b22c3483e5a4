//! The six capability traits.
//!
//! Each category is a separate trait object so the registry can hand out
//! typed implementations instead of dispatching on strings at call sites.

use super::{
    ExitStatus, HealthResult, MiddlewareAction, ProcessHandle, ProxyRequest, ProxyResponse,
    RuntimeContext,
};
use crate::{
    Error, Result,
    observability::ObservabilityEvent,
    proxy::RouteTarget,
    rollout::{RolloutContext, RolloutOps, RolloutStep, StepResult},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Starts, stops and inspects service instances
///
/// Implementations own whatever bookkeeping the backend needs; the
/// orchestrator only keeps the returned [`ProcessHandle`].
#[async_trait]
pub trait Runner: Send + Sync {
    /// Start a new instance of `name`
    async fn start(
        &self,
        name: &str,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle>;

    /// Stop an instance and wait until the backend confirms termination
    async fn stop(&self, handle: &ProcessHandle) -> Result<()>;

    /// Ground truth about whether the instance is alive
    async fn is_running(&self, handle: &ProcessHandle) -> bool;

    /// Most recent output lines, oldest first
    async fn logs(&self, handle: &ProcessHandle, max_lines: usize) -> Result<Vec<String>>;

    /// Run a lifecycle hook to completion
    async fn run_hook(
        &self,
        _config: &Value,
        _env: &HashMap<String, String>,
        _ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        Err(Error::Runner("this runner does not execute hooks".to_string()))
    }

    /// Whether [`Runner::run_hook`] is implemented
    fn supports_hooks(&self) -> bool {
        false
    }
}

/// Probes a running instance
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Run the check once
    async fn check(&self, config: &Value, ctx: &RuntimeContext) -> Result<HealthResult>;
}

/// Supplies environment variables
#[async_trait]
pub trait EnvProvider: Send + Sync {
    /// Load variables
    async fn load(&self, config: &Value) -> Result<HashMap<String, String>>;

    /// Reload variables, for hot-reloadable secrets
    async fn refresh(&self, config: &Value) -> Result<HashMap<String, String>> {
        self.load(config).await
    }
}

/// Request/response filter on the proxy path
#[async_trait]
pub trait ProxyMiddleware: Send + Sync {
    /// Inspect or rewrite a request, or answer it directly
    async fn process_request(&self, config: &Value, request: ProxyRequest)
    -> Result<MiddlewareAction>;

    /// Inspect or rewrite a response
    async fn process_response(&self, _config: &Value, response: ProxyResponse) -> Result<ProxyResponse> {
        Ok(response)
    }
}

/// Receives observability events from the collector
#[async_trait]
pub trait ObservabilitySink: Send + Sync {
    /// Handle one event
    async fn handle(&self, event: &ObservabilityEvent);

    /// Persist anything buffered
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Plans and executes the replacement of a running instance
#[async_trait]
pub trait RolloutStrategy: Send + Sync {
    /// Ordered steps for a rollout with the given strategy config
    fn plan(&self, config: &Value) -> Result<Vec<RolloutStep>>;

    /// Execute one planned step
    async fn execute_step(
        &self,
        step: RolloutStep,
        ctx: &mut RolloutContext,
        ops: &dyn RolloutOps,
    ) -> Result<StepResult>;

    /// Undo a partially executed rollout; must restore the pre-rollout route
    async fn rollback(&self, ctx: &mut RolloutContext, ops: &dyn RolloutOps) -> Result<()>;

    /// Where a freshly launched regular instance serves
    ///
    /// Strategies that move a service between targets answer from the
    /// rollout metadata; the default is the service endpoint.
    fn live_target(
        &self,
        _config: &Value,
        _metadata: &HashMap<String, String>,
        endpoint: Option<RouteTarget>,
    ) -> Result<Option<RouteTarget>> {
        Ok(endpoint)
    }
}
