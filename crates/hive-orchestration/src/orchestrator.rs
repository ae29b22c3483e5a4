//! Service orchestrator
//!
//! Owns the runtime state of every configured service and drives the
//! capability implementations through start, stop, restart, reconcile and
//! rollout. Each service has an async operation lock so that at most one
//! state-changing operation runs per service, while independent services
//! proceed concurrently.
//!
//! Lifecycle per service:
//!
//! ```text
//! Stopped -> Starting -> Running | Unhealthy -> Stopping -> Stopped
//!               ^            |
//!               +- restart --+
//! ```

use crate::{
    Error, Result,
    capabilities::{CapabilityRegistry, ProcessHandle, RolloutStrategy, Runner, RuntimeContext},
    config::{FailurePolicy, HookConfig, OrchestratorSettings, ServiceConfig},
    context::OrchestrationContext,
    dependency::DependencyGraph,
    env::EnvironmentResolver,
    health::HealthChecker,
    observability::{EventCollector, LifecycleEvent, LogLevel, ObservabilityEvent},
    proxy::{ProxyRouter, RouteEntry, RouteTarget, RoutingTable},
    rollout::{RolloutContext, RolloutOps, RolloutReport},
    state::{Observation, Reconciliation, ServiceRuntime, ServiceSnapshot, ServiceState, reconcile},
};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use futures::future::{Either, join_all, select};
use futures::lock::Mutex as AsyncMutex;
use hive_runtime::{Spawner, timeout};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Instance label of a service's regular (non-rollout) instance
pub(crate) const PRIMARY: &str = "primary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookPhase {
    PreUp,
    PostUp,
    PreDown,
    PostDown,
}

impl HookPhase {
    fn name(self) -> &'static str {
        match self {
            HookPhase::PreUp => "pre_up",
            HookPhase::PostUp => "post_up",
            HookPhase::PreDown => "pre_down",
            HookPhase::PostDown => "post_down",
        }
    }
}

struct BoundHook {
    config: HookConfig,
    runner: Arc<dyn Runner>,
}

#[derive(Default)]
struct BoundHooks {
    pre_up: Vec<BoundHook>,
    post_up: Vec<BoundHook>,
    pre_down: Vec<BoundHook>,
    post_down: Vec<BoundHook>,
}

impl BoundHooks {
    fn get(&self, phase: HookPhase) -> &[BoundHook] {
        match phase {
            HookPhase::PreUp => &self.pre_up,
            HookPhase::PostUp => &self.post_up,
            HookPhase::PreDown => &self.pre_down,
            HookPhase::PostDown => &self.post_down,
        }
    }
}

fn bind_hooks(hooks: &[HookConfig], registry: &CapabilityRegistry) -> Result<Vec<BoundHook>> {
    hooks
        .iter()
        .map(|hook| {
            let runner = registry.runner(&hook.runner)?;
            if !runner.supports_hooks() {
                return Err(Error::InvalidConfig(format!(
                    "runner '{}' cannot execute lifecycle hooks",
                    hook.runner
                )));
            }
            Ok(BoundHook {
                config: hook.clone(),
                runner,
            })
        })
        .collect()
}

/// An in-flight start that a concurrent stop may cancel
///
/// Closing `cancel` aborts the attempt at its next phase boundary; `done`
/// closes once the attempt has returned.
struct StartAttempt {
    cancel: Sender<()>,
    done: Receiver<()>,
}

/// A configured service bound to its capability implementations
pub(crate) struct ManagedService {
    pub(crate) config: ServiceConfig,
    pub(crate) runner: Arc<dyn Runner>,
    pub(crate) health: HealthChecker,
    env: EnvironmentResolver,
    hooks: BoundHooks,
    rollout: Arc<dyn RolloutStrategy>,
    runtime: RwLock<ServiceRuntime>,
    pub(crate) op_lock: AsyncMutex<()>,
    attempt: Mutex<Option<StartAttempt>>,
}

impl ManagedService {
    /// Resolve every capability the service names, failing on the first unknown id
    fn bind(config: ServiceConfig, registry: &CapabilityRegistry, history_len: usize) -> Result<Self> {
        let runner = registry.runner(&config.runner.id)?;
        let health = HealthChecker::resolve(&config.name, &config.health_checks, registry)?;
        let env = EnvironmentResolver::resolve(&config.name, &config.env, &config.env_overrides, registry)?;
        let rollout = registry.rollout_strategy(&config.rollout.id)?;
        rollout
            .plan(&config.rollout.config)
            .and_then(|_| {
                rollout.live_target(&config.rollout.config, &HashMap::new(), config.endpoint.clone())
            })
            .map_err(|e| {
                Error::InvalidConfig(format!(
                    "service '{}' has an invalid '{}' rollout: {}",
                    config.name, config.rollout.id, e
                ))
            })?;
        let hooks = BoundHooks {
            pre_up: bind_hooks(&config.hooks.pre_up, registry)?,
            post_up: bind_hooks(&config.hooks.post_up, registry)?,
            pre_down: bind_hooks(&config.hooks.pre_down, registry)?,
            post_down: bind_hooks(&config.hooks.post_down, registry)?,
        };
        let runtime = ServiceRuntime::new(&config.name, &config.version, history_len);

        Ok(Self {
            config,
            runner,
            health,
            env,
            hooks,
            rollout,
            runtime: RwLock::new(runtime),
            op_lock: AsyncMutex::new(()),
            attempt: Mutex::new(None),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn runtime(&self) -> RwLockReadGuard<'_, ServiceRuntime> {
        self.runtime.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn runtime_mut(&self) -> RwLockWriteGuard<'_, ServiceRuntime> {
        self.runtime.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ServiceState {
        self.runtime().state
    }

    /// Where a newly launched regular instance serves
    ///
    /// After a blue-green rollout this is the active color, not the endpoint.
    fn launch_target(&self) -> Result<Option<RouteTarget>> {
        let metadata = self.runtime().rollout_metadata.clone();
        self.rollout
            .live_target(&self.config.rollout.config, &metadata, self.config.endpoint.clone())
    }

    /// Where an existing instance serves
    pub(crate) fn instance_target(&self, handle: &ProcessHandle) -> Option<RouteTarget> {
        handle.target().or_else(|| self.config.endpoint.clone())
    }

    fn begin_attempt(&self) -> (Receiver<()>, Sender<()>) {
        let (cancel_tx, cancel_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        *self.attempt.lock().unwrap_or_else(PoisonError::into_inner) = Some(StartAttempt {
            cancel: cancel_tx,
            done: done_rx,
        });
        (cancel_rx, done_tx)
    }

    fn end_attempt(&self, done: Sender<()>) {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(done);
    }

    fn has_attempt(&self) -> bool {
        self.attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Race `work` against cancellation of the current start attempt
async fn cancellable<T>(
    service: &str,
    cancel: &Receiver<()>,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let work = pin!(work);
    let cancelled = pin!(cancel.recv());
    match select(work, cancelled).await {
        Either::Left((outcome, _)) => outcome,
        Either::Right(_) => Err(Error::Cancelled(service.to_string())),
    }
}

/// Shared orchestrator state; the reconciler holds it weakly
pub(crate) struct Inner {
    pub(crate) context: OrchestrationContext,
    graph: DependencyGraph,
    pub(crate) services: BTreeMap<String, ManagedService>,
    router: ProxyRouter,
}

/// Top-level coordinator for a set of services
///
/// Cheap to clone; clones share the same services and routing table.
#[derive(Clone)]
pub struct ServiceOrchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl ServiceOrchestrator {
    /// Validate the configuration and bind every capability
    ///
    /// Dependency cycles, references to unconfigured services and unknown
    /// capability ids are all reported here, before anything starts.
    pub fn new(
        configs: Vec<ServiceConfig>,
        registry: CapabilityRegistry,
        settings: OrchestratorSettings,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        let graph = DependencyGraph::from_configs(&configs)?;
        let order = graph.topological_sort()?;
        debug!("Start order: {:?}", order);

        let context = OrchestrationContext::new(registry, settings, spawner);
        let router = ProxyRouter::new(context.routing.clone(), &context.registry, &configs)?;

        let mut services = BTreeMap::new();
        for config in configs {
            let service = ManagedService::bind(config, &context.registry, context.settings.history_len)?;
            services.insert(service.name().to_string(), service);
        }
        info!("Orchestrator ready with {} services", services.len());

        Ok(Self {
            inner: Arc::new(Inner {
                context,
                graph,
                services,
                router,
            }),
        })
    }

    /// Start a service, starting its unstarted dependencies first
    pub async fn start(&self, name: &str) -> Result<ServiceSnapshot> {
        self.inner.start(name).await
    }

    /// Stop a running or unhealthy service
    ///
    /// A start still in progress is cancelled; if it already produced an
    /// instance, that instance is stopped.
    pub async fn stop(&self, name: &str) -> Result<ServiceSnapshot> {
        let service = self.inner.service(name)?;
        self.inner.stop_service(service).await
    }

    /// Replace a service's instance, going straight from Running to Starting
    pub async fn restart(&self, name: &str) -> Result<ServiceSnapshot> {
        self.inner.restart(name).await
    }

    /// Compare believed state with the runner and correct drift
    pub async fn reconcile(&self, name: &str) -> Result<Reconciliation> {
        let service = self.inner.service(name)?;
        let _guard = service.op_lock.lock().await;
        Ok(self.inner.reconcile_locked(service).await)
    }

    /// Reconcile every service
    pub async fn reconcile_all(&self) -> BTreeMap<String, Reconciliation> {
        let mut outcomes = BTreeMap::new();
        for (name, service) in &self.inner.services {
            let _guard = service.op_lock.lock().await;
            outcomes.insert(name.clone(), self.inner.reconcile_locked(service).await);
        }
        outcomes
    }

    /// Start every service, level by level
    ///
    /// Services whose required dependencies failed are skipped. Returns the
    /// first failure in start order once every level was attempted.
    pub async fn start_all(&self) -> Result<Vec<ServiceSnapshot>> {
        let members: BTreeSet<String> = self.inner.services.keys().cloned().collect();
        let mut failed = self.inner.start_members(&members).await?;
        for name in self.inner.graph.topological_sort()? {
            if let Some(e) = failed.remove(&name) {
                return Err(e);
            }
        }
        Ok(self.status())
    }

    /// Stop every service in reverse dependency order
    pub async fn stop_all(&self) -> Result<Vec<ServiceSnapshot>> {
        let mut first_error = None;
        for level in self.inner.graph.levels()?.iter().rev() {
            let batch: Vec<&ManagedService> = level
                .iter()
                .filter_map(|name| self.inner.services.get(name))
                .filter(|s| s.state().has_instance() || s.has_attempt())
                .collect();
            let outcomes = join_all(batch.iter().map(|s| self.inner.stop_service(s))).await;
            for outcome in outcomes {
                if let Err(e) = outcome {
                    warn!("Failed to stop service during shutdown: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(self.status()),
        }
    }

    /// Roll a running service out to `new_version` with its configured strategy
    ///
    /// On any step failure the strategy rolls back and the step's error is
    /// returned; if the rollback fails too, [`Error::RollbackFailed`] is.
    pub async fn rollout(&self, name: &str, new_version: impl Into<String>) -> Result<RolloutReport> {
        self.inner.rollout(name, new_version.into()).await
    }

    /// Status of every service, in start order
    pub fn status(&self) -> Vec<ServiceSnapshot> {
        let order = self
            .inner
            .graph
            .topological_sort()
            .unwrap_or_else(|_| self.inner.services.keys().cloned().collect());
        order
            .iter()
            .filter_map(|name| self.inner.services.get(name))
            .map(|s| self.inner.snapshot(s))
            .collect()
    }

    /// Status of one service
    pub fn get_status(&self, name: &str) -> Result<ServiceSnapshot> {
        Ok(self.inner.snapshot(self.inner.service(name)?))
    }

    /// Recent output of a service's live instance
    pub async fn logs(&self, name: &str, max_lines: usize) -> Result<Vec<String>> {
        let service = self.inner.service(name)?;
        let handle = service.runtime().handle.clone();
        match handle {
            Some(handle) => service.runner.logs(&handle, max_lines).await,
            None => Ok(Vec::new()),
        }
    }

    /// Strategy state persisted between rollouts
    pub fn rollout_metadata(&self, name: &str) -> Result<HashMap<String, String>> {
        Ok(self.inner.service(name)?.runtime().rollout_metadata.clone())
    }

    /// The live routing table
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.inner.context.routing
    }

    /// Request-path helper bound to the routing table
    pub fn router(&self) -> &ProxyRouter {
        &self.inner.router
    }

    /// The observability collector
    pub fn events(&self) -> &Arc<EventCollector> {
        &self.inner.context.events
    }

    /// Shared collaborators
    pub fn context(&self) -> &OrchestrationContext {
        &self.inner.context
    }

    /// The resolved dependency graph
    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }
}

impl Inner {
    fn service(&self, name: &str) -> Result<&ManagedService> {
        self.services
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    pub(crate) fn snapshot(&self, service: &ManagedService) -> ServiceSnapshot {
        let target = self.context.routing.target(service.name());
        service.runtime().snapshot(target)
    }

    fn failed(&self, service: &ManagedService, operation: &'static str, source: Error) -> Error {
        Error::Operation {
            operation,
            snapshot: Box::new(self.snapshot(service)),
            source: Box::new(source),
        }
    }

    fn invalid(service: &ManagedService, state: ServiceState, operation: &'static str) -> Error {
        Error::InvalidState {
            service: service.name().to_string(),
            state,
            operation,
        }
    }

    /// Keep a lifecycle event in the service's history and publish it
    pub(crate) fn record(&self, service: &ManagedService, message: impl Into<String>) {
        let event = {
            let mut runtime = service.runtime_mut();
            let event = LifecycleEvent::new(&runtime.name, runtime.state, message);
            runtime.record(event.clone());
            event
        };
        info!(service = %event.service, state = %event.state, "{}", event.message);
        self.context.events.emit(event);
    }

    fn warn_event(&self, service: &ManagedService, message: String) {
        warn!(service = %service.name(), "{}", message);
        self.context.events.emit(ObservabilityEvent::warning(service.name(), message));
    }

    /// First required dependency of `service` in `failed`
    ///
    /// Failed best-effort dependencies only produce a warning.
    fn blocked_by(&self, service: &ManagedService, failed: &BTreeMap<String, Error>) -> Option<String> {
        for dependency in &service.config.dependencies {
            if !failed.contains_key(&dependency.service) {
                continue;
            }
            if !dependency.best_effort {
                return Some(dependency.service.clone());
            }
            self.warn_event(
                service,
                format!(
                    "Best-effort dependency '{}' failed, starting anyway",
                    dependency.service
                ),
            );
        }
        None
    }

    fn dependency_failed(
        &self,
        service: &ManagedService,
        dependency: String,
        failed: &BTreeMap<String, Error>,
    ) -> Error {
        let reason = failed
            .get(&dependency)
            .map(|e| e.root().to_string())
            .unwrap_or_default();
        self.failed(
            service,
            "start",
            Error::DependencyFailed {
                service: service.name().to_string(),
                dependency,
                reason,
            },
        )
    }

    /// Start `members` level by level, siblings concurrently
    ///
    /// Returns the services that did not reach Running, with their errors.
    async fn start_members(&self, members: &BTreeSet<String>) -> Result<BTreeMap<String, Error>> {
        let mut failed: BTreeMap<String, Error> = BTreeMap::new();

        for level in self.graph.levels()? {
            let mut batch = Vec::new();
            for name in level.iter().filter(|n| members.contains(*n)) {
                let service = self.service(name)?;
                match self.blocked_by(service, &failed) {
                    Some(dependency) => {
                        let error = self.dependency_failed(service, dependency, &failed);
                        warn!(service = %name, "Not starting: {}", error);
                        failed.insert(name.clone(), error);
                    }
                    None => batch.push(service),
                }
            }
            if batch.is_empty() {
                continue;
            }

            debug!(
                "Starting {} services in parallel: {:?}",
                batch.len(),
                batch.iter().map(|s| s.name()).collect::<Vec<_>>()
            );
            let outcomes = join_all(batch.iter().map(|s| self.start_service(s, true))).await;
            for (service, outcome) in batch.into_iter().zip(outcomes) {
                if let Err(e) = outcome {
                    warn!(service = %service.name(), "Failed to start: {}", e);
                    failed.insert(service.name().to_string(), e);
                }
            }
        }
        Ok(failed)
    }

    async fn start(&self, name: &str) -> Result<ServiceSnapshot> {
        let service = self.service(name)?;
        {
            let _guard = service.op_lock.lock().await;
            self.reconcile_locked(service).await;
            let state = service.state();
            if state != ServiceState::Stopped {
                return Err(self.failed(service, "start", Self::invalid(service, state, "start")));
            }
        }

        let members: BTreeSet<String> = self.graph.dependencies_of(name).into_iter().collect();
        if !members.is_empty() {
            info!(service = %name, "Starting dependencies {:?}", members);
            let failed = self
                .start_members(&members)
                .await
                .map_err(|e| self.failed(service, "start", e))?;
            if let Some(dependency) = self.blocked_by(service, &failed) {
                return Err(self.dependency_failed(service, dependency, &failed));
            }
        }

        self.start_service(service, false).await
    }

    /// Start one service whose dependencies are already settled
    async fn start_service(&self, service: &ManagedService, tolerate_running: bool) -> Result<ServiceSnapshot> {
        let _guard = service.op_lock.lock().await;
        self.reconcile_locked(service).await;
        match service.state() {
            ServiceState::Stopped => {}
            ServiceState::Running if tolerate_running => return Ok(self.snapshot(service)),
            state => {
                return Err(self.failed(service, "start", Self::invalid(service, state, "start")));
            }
        }

        let (cancel, done) = service.begin_attempt();
        let outcome = self.launch(service, &cancel, false).await;
        service.end_attempt(done);

        match outcome {
            Ok(()) => Ok(self.snapshot(service)),
            Err(e) => Err(self.failed(service, "start", e)),
        }
    }

    /// Environment, pre-up hooks, runner start, health gate, route, post-up hooks
    ///
    /// Entered in Stopped (start) or in Starting without a handle (restart).
    /// `refresh_env` asks providers to re-read their sources.
    async fn launch(&self, service: &ManagedService, cancel: &Receiver<()>, refresh_env: bool) -> Result<()> {
        let name = service.name();
        let version = service.runtime().version.clone();
        let base = RuntimeContext::new(name, PRIMARY)
            .with_version(version)
            .with_target(service.launch_target()?);

        info!(service = %name, runner = %service.config.runner.id, "Starting service '{}'", name);
        let env = if refresh_env {
            cancellable(name, cancel, service.env.refresh()).await?
        } else {
            cancellable(name, cancel, service.env.load()).await?
        };
        cancellable(name, cancel, self.run_hooks(service, HookPhase::PreUp, &env, &base)).await?;

        let handle = cancellable(
            name,
            cancel,
            service.runner.start(name, &service.config.runner.config, &env, &base),
        )
        .await?;
        {
            let mut runtime = service.runtime_mut();
            if runtime.state != ServiceState::Starting {
                runtime.transition(ServiceState::Starting, "start")?;
            }
            runtime.handle = Some(handle.clone());
        }
        self.record(service, format!("Instance {} started", handle));

        let ctx = base.with_handle(handle.clone());
        let gate = cancellable(
            name,
            cancel,
            service
                .health
                .wait_until_healthy(&ctx, &service.config.health_gate, &self.context.events),
        )
        .await;
        match gate {
            Ok(_) => {}
            Err(Error::Cancelled(_)) => {
                self.abort_start(service, &handle).await;
                return Err(Error::Cancelled(name.to_string()));
            }
            Err(e) => {
                {
                    let mut runtime = service.runtime_mut();
                    runtime.mark_health(false);
                    runtime.transition(ServiceState::Unhealthy, "start")?;
                }
                self.record(service, format!("Health gate failed, leaving instance up: {}", e));
                return Err(e);
            }
        }

        let target = ctx.target.clone();
        if let Some(target) = &target {
            self.context.routing.set(name, target.clone());
        }
        {
            let mut runtime = service.runtime_mut();
            runtime.mark_health(true);
            runtime.transition(ServiceState::Running, "start")?;
        }
        match &target {
            Some(target) => self.record(service, format!("Running, routed to {}", target)),
            None => self.record(service, "Running"),
        }

        self.run_hooks(service, HookPhase::PostUp, &env, &ctx).await
    }

    /// Stop the instance of a start that was cancelled mid-way
    async fn abort_start(&self, service: &ManagedService, handle: &ProcessHandle) {
        warn!(service = %service.name(), "Start cancelled, stopping {}", handle);
        let outcome = self.stop_instance(service, handle).await;
        let transition = {
            let mut runtime = service.runtime_mut();
            match &outcome {
                Ok(()) => runtime.transition(ServiceState::Stopped, "stop"),
                Err(_) => {
                    runtime.mark_health(false);
                    runtime.transition(ServiceState::Unhealthy, "stop")
                }
            }
        };
        if let Err(e) = transition {
            error!(service = %service.name(), "Cannot settle cancelled start: {}", e);
        }
        match outcome {
            Ok(()) => self.record(service, "Start cancelled, instance stopped"),
            Err(e) => self.record(service, format!("Start cancelled, instance could not be stopped: {}", e)),
        }
    }

    /// Cancel an in-flight start and wait for it to return
    async fn cancel_start(&self, service: &ManagedService) -> bool {
        let attempt = service
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| (a.cancel.clone(), a.done.clone()));
        let Some((cancel, done)) = attempt else {
            return false;
        };

        info!(service = %service.name(), "Cancelling in-flight start");
        cancel.close();
        // closes when the attempt drops its sender
        let _ = done.recv().await;
        true
    }

    async fn stop_service(&self, service: &ManagedService) -> Result<ServiceSnapshot> {
        let cancelled = self.cancel_start(service).await;
        let _guard = service.op_lock.lock().await;
        let drift = self.reconcile_locked(service).await.is_drift();

        match service.state() {
            ServiceState::Running | ServiceState::Unhealthy => {}
            ServiceState::Stopped if cancelled || drift => return Ok(self.snapshot(service)),
            state => return Err(self.failed(service, "stop", Self::invalid(service, state, "stop"))),
        }

        match self.shutdown(service).await {
            Ok(()) => Ok(self.snapshot(service)),
            Err(e) => Err(self.failed(service, "stop", e)),
        }
    }

    /// Pre-down hooks, route removal, runner stop, post-down hooks
    async fn shutdown(&self, service: &ManagedService) -> Result<()> {
        let name = service.name();
        let (handle, version) = {
            let runtime = service.runtime();
            (runtime.handle.clone(), runtime.version.clone())
        };
        let Some(handle) = handle else {
            self.context.routing.remove(name);
            service.runtime_mut().transition(ServiceState::Stopped, "stop")?;
            self.record(service, "Stopped (no instance)");
            return Ok(());
        };

        let ctx = RuntimeContext::new(name, PRIMARY)
            .with_version(version)
            .with_target(service.instance_target(&handle))
            .with_handle(handle.clone());
        let env = self.hook_env(service, &[HookPhase::PreDown, HookPhase::PostDown]).await;
        self.run_hooks(service, HookPhase::PreDown, &env, &ctx).await?;

        service.runtime_mut().transition(ServiceState::Stopping, "stop")?;
        self.record(service, format!("Stopping {}", handle));
        self.context.routing.remove(name);

        if let Err(e) = self.stop_instance(service, &handle).await {
            if service.runner.is_running(&handle).await {
                {
                    let mut runtime = service.runtime_mut();
                    runtime.mark_health(false);
                    runtime.transition(ServiceState::Unhealthy, "stop")?;
                }
                self.record(service, format!("Stop failed, instance still running: {}", e));
                return Err(e);
            }
            warn!(service = %name, "Runner reported a stop error but the instance is gone: {}", e);
        }

        let hooks = self.run_hooks(service, HookPhase::PostDown, &env, &ctx).await;
        service.runtime_mut().transition(ServiceState::Stopped, "stop")?;
        self.record(service, "Stopped");
        hooks
    }

    /// Runner stop bounded by the configured confirmation timeout
    async fn stop_instance(&self, service: &ManagedService, handle: &ProcessHandle) -> Result<()> {
        let limit = self.context.settings.stop_timeout();
        match timeout(limit, service.runner.stop(handle)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Runner(format!(
                "{} did not confirm termination within {}ms",
                handle,
                limit.as_millis()
            ))),
        }
    }

    async fn restart(&self, name: &str) -> Result<ServiceSnapshot> {
        let service = self.service(name)?;
        let guard = service.op_lock.lock().await;
        self.reconcile_locked(service).await;

        match service.state() {
            ServiceState::Running | ServiceState::Unhealthy => {}
            ServiceState::Stopped => {
                drop(guard);
                return self.start(name).await;
            }
            state => {
                return Err(self.failed(service, "restart", Self::invalid(service, state, "restart")));
            }
        }

        let (cancel, done) = service.begin_attempt();
        let outcome = self.replace_instance(service, &cancel).await;
        service.end_attempt(done);

        // a restart that lost its old instance without gaining a new one
        let orphaned = {
            let mut runtime = service.runtime_mut();
            let orphaned = runtime.state == ServiceState::Starting && runtime.handle.is_none();
            if orphaned {
                runtime.transition(ServiceState::Stopped, "restart")?;
            }
            orphaned
        };
        if orphaned {
            self.record(service, "Restart failed before a new instance started");
        }
        drop(guard);

        match outcome {
            Ok(()) => Ok(self.snapshot(service)),
            Err(e) => Err(self.failed(service, "restart", e)),
        }
    }

    async fn replace_instance(&self, service: &ManagedService, cancel: &Receiver<()>) -> Result<()> {
        let name = service.name();
        let (handle, version) = {
            let runtime = service.runtime();
            (runtime.handle.clone(), runtime.version.clone())
        };
        let mut ctx = RuntimeContext::new(name, PRIMARY).with_version(version);
        if let Some(handle) = &handle {
            ctx = ctx
                .with_target(service.instance_target(handle))
                .with_handle(handle.clone());
        }

        let env = self.hook_env(service, &[HookPhase::PreDown, HookPhase::PostDown]).await;
        self.run_hooks(service, HookPhase::PreDown, &env, &ctx).await?;

        self.context.routing.remove(name);
        service.runtime_mut().transition(ServiceState::Starting, "restart")?;
        self.record(service, "Restarting");

        if let Some(handle) = &handle {
            if let Err(e) = self.stop_instance(service, handle).await {
                if service.runner.is_running(handle).await {
                    {
                        let mut runtime = service.runtime_mut();
                        runtime.mark_health(false);
                        runtime.transition(ServiceState::Unhealthy, "restart")?;
                    }
                    self.record(service, format!("Restart aborted, old instance still running: {}", e));
                    return Err(e);
                }
            }
        }
        service.runtime_mut().handle = None;
        self.run_hooks(service, HookPhase::PostDown, &env, &ctx).await?;

        self.launch(service, cancel, true).await
    }

    /// Environment for hooks of `phases`; empty when none are configured
    async fn hook_env(&self, service: &ManagedService, phases: &[HookPhase]) -> HashMap<String, String> {
        if phases.iter().all(|p| service.hooks.get(*p).is_empty()) {
            return HashMap::new();
        }
        match service.env.load().await {
            Ok(env) => env,
            Err(e) => {
                warn!(service = %service.name(), "Running hooks without environment: {}", e);
                HashMap::new()
            }
        }
    }

    async fn run_hooks(
        &self,
        service: &ManagedService,
        phase: HookPhase,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<()> {
        let name = service.name();
        for bound in service.hooks.get(phase) {
            debug!(service = %name, hook = phase.name(), runner = %bound.config.runner, "Running hook");
            let failure = match bound.runner.run_hook(&bound.config.config, env, ctx).await {
                Ok(status) if status.success() => None,
                Ok(status) => Some(match status.code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                }),
                Err(e) => Some(e.to_string()),
            };
            let Some(message) = failure else {
                continue;
            };

            match bound.config.policy {
                FailurePolicy::Abort => {
                    warn!(service = %name, hook = phase.name(), "Hook failed, aborting: {}", message);
                    return Err(Error::Hook {
                        service: name.to_string(),
                        hook: phase.name(),
                        message,
                    });
                }
                FailurePolicy::Warn => {
                    self.warn_event(service, format!("{} hook failed: {}", phase.name(), message));
                }
            }
        }
        Ok(())
    }

    /// Reconcile one service; the caller holds its operation lock
    pub(crate) async fn reconcile_locked(&self, service: &ManagedService) -> Reconciliation {
        let (state, handle) = {
            let runtime = service.runtime();
            (runtime.state, runtime.handle.clone())
        };
        if !matches!(state, ServiceState::Running | ServiceState::Unhealthy) {
            return Reconciliation::InSync;
        }

        let observed = match &handle {
            Some(handle) => Observation::from(service.runner.is_running(handle).await),
            None => Observation::NotRunning,
        };
        let outcome = reconcile(state, observed);
        if let Reconciliation::Corrected { from, to } = outcome {
            self.context.routing.remove(service.name());
            if let Err(e) = service.runtime_mut().transition(to, "reconcile") {
                error!(service = %service.name(), "Cannot apply reconciliation: {}", e);
                return outcome;
            }
            self.warn_event(
                service,
                format!("Believed {} but the instance is gone, corrected to {}", from, to),
            );
            self.record(service, format!("Reconciled from {}", from));
        }
        outcome
    }

    async fn rollout(&self, name: &str, new_version: String) -> Result<RolloutReport> {
        let service = self.service(name)?;
        let _guard = service.op_lock.lock().await;
        self.reconcile_locked(service).await;

        let (state, handle, old_version, metadata) = {
            let runtime = service.runtime();
            (
                runtime.state,
                runtime.handle.clone(),
                runtime.version.clone(),
                runtime.rollout_metadata.clone(),
            )
        };
        let handle = match (state, handle) {
            (ServiceState::Running | ServiceState::Unhealthy, Some(handle)) => handle,
            (state, _) => {
                return Err(self.failed(service, "rollout", Self::invalid(service, state, "roll out")));
            }
        };

        let strategy = &service.config.rollout;
        let plan = service
            .rollout
            .plan(&strategy.config)
            .map_err(|e| self.failed(service, "rollout", e))?;
        let mut ctx = RolloutContext::new(name, old_version.clone(), new_version.clone(), handle)
            .with_config(strategy.config.clone())
            .with_previous_route(self.context.routing.get(name).map(|e| (*e).clone()))
            .with_metadata(metadata);
        let ops = ServiceOps {
            inner: self,
            service,
        };

        self.record(
            service,
            format!("Rolling out {} -> {} ({})", old_version, new_version, strategy.id),
        );
        let mut steps = Vec::with_capacity(plan.len());
        let mut failure = None;
        for step in plan {
            debug!(service = %name, %step, "Executing rollout step");
            match service.rollout.execute_step(step, &mut ctx, &ops).await {
                Ok(result) => {
                    info!(service = %name, %step, "{}", result.detail);
                    steps.push(result);
                }
                Err(e) => {
                    failure = Some((step, e));
                    break;
                }
            }
        }

        let Some((step, cause)) = failure else {
            let live = ctx.live_handle().cloned();
            let settled = {
                let mut runtime = service.runtime_mut();
                runtime.version = new_version.clone();
                runtime.rollout_metadata = ctx.metadata.clone();
                match live {
                    Some(handle) => {
                        runtime.handle = Some(handle);
                        runtime.mark_health(true);
                        if runtime.state == ServiceState::Unhealthy {
                            runtime.transition(ServiceState::Running, "roll out")
                        } else {
                            Ok(())
                        }
                    }
                    None => runtime.transition(ServiceState::Stopped, "roll out"),
                }
            };
            settled.map_err(|e| self.failed(service, "rollout", e))?;
            self.record(service, format!("Rolled out {}", new_version));
            self.context.events.emit(ObservabilityEvent::metric(
                "rollouts_completed",
                1.0,
                [("service", name), ("strategy", strategy.id.as_str())],
            ));

            return Ok(RolloutReport {
                service: name.to_string(),
                strategy: strategy.id.clone(),
                old_version,
                new_version,
                steps,
                target: self.context.routing.target(name),
                metadata: ctx.metadata,
            });
        };

        warn!(service = %name, %step, "Rollout step failed, rolling back: {}", cause);
        let rollback = service.rollout.rollback(&mut ctx, &ops).await;
        self.adopt_live(service, &ctx);

        match rollback {
            Ok(()) => {
                self.record(
                    service,
                    format!("Rollout to {} rolled back after {} failed", new_version, step),
                );
                Err(self.failed(service, "rollout", cause))
            }
            Err(e) => {
                let message = format!("{} (rolling back after {} failed: {})", e, step, cause);
                error!(service = %name, "Rollback failed: {}", message);
                self.context.events.emit(ObservabilityEvent::log(
                    LogLevel::Error,
                    Some(name),
                    format!("Rollback failed, routing state is unknown: {}", message),
                ));
                Err(self.failed(
                    service,
                    "rollout",
                    Error::RollbackFailed {
                        service: name.to_string(),
                        message,
                    },
                ))
            }
        }
    }

    /// Point the runtime at whatever instance the strategy left serving
    fn adopt_live(&self, service: &ManagedService, ctx: &RolloutContext) {
        let live = ctx.live_handle().cloned();
        let mut runtime = service.runtime_mut();
        match live {
            Some(handle) => runtime.handle = Some(handle),
            None => {
                if let Err(e) = runtime.transition(ServiceState::Stopped, "roll out") {
                    error!(service = %service.name(), "Cannot settle after rollback: {}", e);
                }
            }
        }
    }
}

/// [`RolloutOps`] bound to one service
struct ServiceOps<'a> {
    inner: &'a Inner,
    service: &'a ManagedService,
}

#[async_trait]
impl RolloutOps for ServiceOps<'_> {
    async fn start_instance(
        &self,
        label: &str,
        version: &str,
        target: Option<RouteTarget>,
    ) -> Result<ProcessHandle> {
        let name = self.service.name();
        let env = self.service.env.refresh().await?;
        let ctx = RuntimeContext::new(name, label)
            .with_version(version)
            .with_target(target);

        info!(service = %name, instance = label, "Starting {} instance of {}", label, version);
        let handle = self
            .service
            .runner
            .start(name, &self.service.config.runner.config, &env, &ctx)
            .await?;
        self.inner.context.events.emit(ObservabilityEvent::log(
            LogLevel::Info,
            Some(name),
            format!("{} instance {} started", label, handle),
        ));
        Ok(handle)
    }

    async fn wait_healthy(&self, label: &str, handle: &ProcessHandle) -> Result<()> {
        let ctx = RuntimeContext::new(self.service.name(), label)
            .with_target(self.service.instance_target(handle))
            .with_handle(handle.clone());
        self.service
            .health
            .wait_until_healthy(&ctx, &self.service.config.health_gate, &self.inner.context.events)
            .await
            .map(|_| ())
    }

    async fn stop_instance(&self, handle: &ProcessHandle) -> Result<()> {
        info!(service = %self.service.name(), "Stopping {}", handle);
        self.inner.stop_instance(self.service, handle).await
    }

    fn switch_traffic(&self, target: RouteTarget) -> Option<RouteEntry> {
        info!(service = %self.service.name(), to = %target, "Switching traffic");
        self.inner.context.routing.set(self.service.name(), target)
    }

    fn withdraw_traffic(&self) -> Option<RouteEntry> {
        self.inner.context.routing.remove(self.service.name())
    }

    fn restore_traffic(&self, previous: Option<RouteEntry>) {
        debug!(service = %self.service.name(), "Restoring pre-rollout route");
        self.inner.context.routing.restore(self.service.name(), previous);
    }

    fn default_target(&self) -> Option<RouteTarget> {
        self.service.config.endpoint.clone()
    }
}
