//! Instrumented fake capabilities for tests.
//!
//! Enabled for this crate's own tests and, through the `test-utils` feature,
//! for downstream crates. The fakes record every call in a shared
//! [`CallLog`] so tests can assert on ordering across services.

use crate::{
    Error, Result,
    capabilities::{
        EnvProvider, ExitStatus, HealthCheck, HealthResult, ProcessHandle, Runner, RuntimeContext,
    },
    proxy::{RouteTarget, RoutingTable},
};
use async_trait::async_trait;
use hive_runtime::sleep;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const SERVICE_KEY: &str = "service";

/// Ordered record of calls shared between fakes
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    /// Empty log
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a call
    pub fn record(&self, call: impl Into<String>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.into());
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls whose text starts with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Forget everything recorded
    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[derive(Default)]
struct FakeRunnerState {
    alive: HashSet<String>,
    failing_starts: HashSet<String>,
    failing_stops: HashSet<String>,
    start_delay: Option<Duration>,
    started: Vec<RuntimeContext>,
    started_env: Vec<HashMap<String, String>>,
    routing: Option<Arc<RoutingTable>>,
    routes_during_stop: Vec<(String, Option<RouteTarget>)>,
    hooks: Vec<(String, Value)>,
}

/// In-memory runner
///
/// Records `"{service}.start"`, `"{service}.stop"` and
/// `"{service}.hook"` in its call log. Instances stay alive until stopped
/// or [`kill`](FakeRunner::kill)ed behind the orchestrator's back.
pub struct FakeRunner {
    log: Arc<CallLog>,
    next_id: AtomicU64,
    state: Mutex<FakeRunnerState>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    /// Runner with a private call log
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    /// Runner recording into a shared log
    pub fn with_log(log: Arc<CallLog>) -> Self {
        Self {
            log,
            next_id: AtomicU64::new(1),
            state: Mutex::new(FakeRunnerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeRunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The call log
    pub fn log(&self) -> &Arc<CallLog> {
        &self.log
    }

    /// Make every start of `service` fail
    pub fn fail_starts(&self, service: &str) {
        self.state().failing_starts.insert(service.to_string());
    }

    /// Make every stop of `service` fail
    pub fn fail_stops(&self, service: &str) {
        self.state().failing_stops.insert(service.to_string());
    }

    /// Delay every start by `delay`
    pub fn set_start_delay(&self, delay: Duration) {
        self.state().start_delay = Some(delay);
    }

    /// Terminate an instance without telling the orchestrator
    pub fn kill(&self, handle: &ProcessHandle) {
        self.state().alive.remove(&handle.instance_id);
    }

    /// Whether an instance is alive
    pub fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.state().alive.contains(&handle.instance_id)
    }

    /// Number of live instances
    pub fn alive_count(&self) -> usize {
        self.state().alive.len()
    }

    /// Context of every completed start, in order
    pub fn started(&self) -> Vec<RuntimeContext> {
        self.state().started.clone()
    }

    /// Environment of every completed start, in order
    pub fn started_env(&self) -> Vec<HashMap<String, String>> {
        self.state().started_env.clone()
    }

    /// Record the routing entry of the stopped service during each stop
    pub fn observe_routes_during_stop(&self, routing: Arc<RoutingTable>) {
        self.state().routing = Some(routing);
    }

    /// Routing entries seen from inside `stop`
    pub fn routes_during_stop(&self) -> Vec<(String, Option<RouteTarget>)> {
        self.state().routes_during_stop.clone()
    }

    /// Hooks executed, as (service, config)
    pub fn hooks(&self) -> Vec<(String, Value)> {
        self.state().hooks.clone()
    }
}

fn service_of(handle: &ProcessHandle) -> &str {
    handle
        .metadata
        .get(SERVICE_KEY)
        .map(String::as_str)
        .unwrap_or(handle.instance_id.as_str())
}

#[async_trait]
impl Runner for FakeRunner {
    async fn start(
        &self,
        name: &str,
        _config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle> {
        self.log.record(format!("{}.start", name));
        let delay = self.state().start_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_starts.contains(name) {
            return Err(Error::Runner(format!("{} refused to start", name)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut handle = ProcessHandle::new("fake", format!("{}-{}", name, id))
            .with_metadata(SERVICE_KEY, name)
            .with_metadata("version", ctx.version.clone());
        if let Some(target) = &ctx.target {
            handle = handle.with_target(target);
        }
        state.alive.insert(handle.instance_id.clone());
        state.started.push(ctx.clone());
        state.started_env.push(env.clone());
        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        let service = service_of(handle).to_string();
        self.log.record(format!("{}.stop", service));

        let mut state = self.state();
        if let Some(seen) = state.routing.as_ref().map(|r| r.target(&service)) {
            state.routes_during_stop.push((service.clone(), seen));
        }
        if state.failing_stops.contains(&service) {
            return Err(Error::Runner(format!("{} refused to stop", service)));
        }
        state.alive.remove(&handle.instance_id);
        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.is_alive(handle)
    }

    async fn logs(&self, handle: &ProcessHandle, max_lines: usize) -> Result<Vec<String>> {
        let lines = vec![format!("{} started", handle), format!("{} serving", handle)];
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn run_hook(
        &self,
        config: &Value,
        _env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        self.log.record(format!("{}.hook", ctx.service));
        self.state().hooks.push((ctx.service.clone(), config.clone()));
        let code = config.get("exit").and_then(Value::as_i64).unwrap_or(0);
        Ok(ExitStatus::from_code(code as i32))
    }

    fn supports_hooks(&self) -> bool {
        true
    }
}

struct Script {
    queue: VecDeque<bool>,
    fallback: bool,
}

/// Health check that answers from a script
///
/// Records `"{service}.health"` when given a call log.
pub struct ScriptedHealthCheck {
    script: Mutex<Script>,
    failing_instances: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    log: Option<Arc<CallLog>>,
}

impl ScriptedHealthCheck {
    /// Always answer `healthy`
    pub fn always(healthy: bool) -> Self {
        Self::sequence([healthy])
    }

    /// Answer with each value in turn, then keep repeating the last one
    pub fn sequence(answers: impl IntoIterator<Item = bool>) -> Self {
        let queue: VecDeque<bool> = answers.into_iter().collect();
        let fallback = queue.back().copied().unwrap_or(true);
        Self {
            script: Mutex::new(Script { queue, fallback }),
            failing_instances: Mutex::new(HashSet::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            log: None,
        }
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record calls into a shared log
    pub fn with_log(mut self, log: Arc<CallLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of checks run
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replace the script with a constant answer
    pub fn set_healthy(&self, healthy: bool) {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.queue.clear();
        script.fallback = healthy;
    }

    /// Always report instances labelled `label` as unhealthy
    pub fn fail_instance(&self, label: &str) {
        self.failing_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.to_string());
    }

    fn next_answer(&self) -> bool {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        match script.queue.pop_front() {
            Some(answer) => answer,
            None => script.fallback,
        }
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthCheck {
    async fn check(&self, _config: &Value, ctx: &RuntimeContext) -> Result<HealthResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.record(format!("{}.health", ctx.service));
        }
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }

        let failing = self
            .failing_instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&ctx.instance);
        if failing || !self.next_answer() {
            return Ok(HealthResult::unhealthy(format!("{} is not ready", ctx.instance)));
        }
        Ok(HealthResult::healthy())
    }
}

/// Secret source that providers only re-read on refresh
///
/// `load` answers from a cache filled on first use; `refresh` re-reads the
/// current value set by [`rotate`](RotatingEnvProvider::rotate).
pub struct RotatingEnvProvider {
    key: String,
    source: Mutex<String>,
    cached: Mutex<Option<String>>,
    refreshes: AtomicUsize,
}

impl RotatingEnvProvider {
    /// Provider exposing `key` with an initial value
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: Mutex::new(value.into()),
            cached: Mutex::new(None),
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Change the value at the source
    pub fn rotate(&self, value: impl Into<String>) {
        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = value.into();
    }

    /// Number of refreshes so far
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn read_source(&self) -> String {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EnvProvider for RotatingEnvProvider {
    async fn load(&self, _config: &Value) -> Result<HashMap<String, String>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        let value = cached.get_or_insert_with(|| self.read_source()).clone();
        Ok(HashMap::from([(self.key.clone(), value)]))
    }

    async fn refresh(&self, _config: &Value) -> Result<HashMap<String, String>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let value = self.read_source();
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        Ok(HashMap::from([(self.key.clone(), value)]))
    }
}
