//! Process runner for local service execution.

use super::parse_config;
use crate::{
    Error, Result,
    capabilities::{ExitStatus, ProcessHandle, Runner, RuntimeContext},
};
use async_process::{Child, Command, Stdio};
use async_trait::async_trait;
use futures::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures::lock::Mutex;
use futures::stream::StreamExt;
use hive_runtime::{Spawner, timeout};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_LOG_CAPACITY: usize = 1_000;

/// Configuration blob understood by the process runner
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_grace_ms() -> u64 {
    5_000
}

type OutputBuffer = Arc<std::sync::Mutex<VecDeque<String>>>;

/// Information about a running process
struct ProcessInfo {
    child: Child,
    output: OutputBuffer,
    grace: Duration,
}

/// Runner for local processes
///
/// Stdout and stderr are captured into a bounded ring buffer that backs
/// [`Runner::logs`].
pub struct ProcessRunner {
    spawner: Arc<dyn Spawner>,
    running_processes: Arc<Mutex<HashMap<String, ProcessInfo>>>,
    log_capacity: usize,
}

impl ProcessRunner {
    /// Create a new process runner
    pub fn new(spawner: Arc<dyn Spawner>) -> Self {
        Self {
            spawner,
            running_processes: Arc::new(Mutex::new(HashMap::new())),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Number of tracked processes
    pub async fn running_process_count(&self) -> usize {
        self.running_processes.lock().await.len()
    }

    pub(crate) async fn launch(
        &self,
        runner_id: &str,
        name: &str,
        spec: ProcessSpec,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle> {
        info!("Starting process for service '{}': {}", name, spec.command);
        debug!("Command: {} {}", spec.command, spec.args.join(" "));

        let mut cmd = build_command(&spec, env, ctx);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Runner(format!("failed to spawn '{}': {}", spec.command, e)))?;
        let pid = child.id();

        let output: OutputBuffer = Arc::new(std::sync::Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            self.capture(stdout, output.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture(stderr, output.clone());
        }

        let instance_id = Uuid::new_v4().to_string();
        let mut handle = ProcessHandle::new(runner_id, instance_id.clone())
            .with_metadata("pid", pid.to_string())
            .with_metadata("command", spec.command.clone());
        if let Some(target) = &ctx.target {
            handle = handle.with_target(target);
        }

        info!("Started service '{}' with PID: {}", name, pid);

        self.running_processes.lock().await.insert(
            instance_id,
            ProcessInfo {
                child,
                output,
                grace: Duration::from_millis(spec.stop_grace_ms),
            },
        );

        Ok(handle)
    }

    pub(crate) async fn run_to_completion(
        &self,
        spec: ProcessSpec,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        debug!("Running hook for '{}': {}", ctx.service, spec.command);

        let output = build_command(&spec, env, ctx)
            .output()
            .await
            .map_err(|e| Error::Runner(format!("failed to run '{}': {}", spec.command, e)))?;

        let status = ExitStatus::from(output.status);
        if !status.success() {
            warn!(
                "Hook '{}' exited with {:?}: {}",
                spec.command,
                status.code,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(status)
    }

    fn capture<R>(&self, reader: R, output: OutputBuffer)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capacity = self.log_capacity;
        self.spawner.spawn(Box::pin(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Some(Ok(line)) = lines.next().await {
                let mut buffer = output.lock().unwrap_or_else(PoisonError::into_inner);
                if buffer.len() == capacity {
                    buffer.pop_front();
                }
                buffer.push_back(line);
            }
        }));
    }
}

fn build_command(spec: &ProcessSpec, env: &HashMap<String, String>, ctx: &RuntimeContext) -> Command {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args).envs(env).envs(&spec.env);

    cmd.env("HIVE_SERVICE", &ctx.service)
        .env("HIVE_INSTANCE", &ctx.instance)
        .env("HIVE_VERSION", &ctx.version);
    if let Some(target) = &ctx.target {
        cmd.env("HIVE_HOST", &target.host)
            .env("HIVE_PORT", target.port.to_string());
    }

    if let Some(wd) = &spec.working_dir {
        cmd.current_dir(wd);
    }
    cmd
}

/// Ask the process to exit, escalating to SIGKILL after the grace period
async fn terminate(info: &mut ProcessInfo) -> Result<()> {
    let pid = info.child.id();

    let term = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output()
        .await;
    if let Err(e) = term {
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    match timeout(info.grace, info.child.status()).await {
        Ok(Ok(status)) => {
            debug!("Process {} exited with {:?}", pid, status.code());
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Runner(format!("failed to wait for {}: {}", pid, e))),
        Err(_) => {
            warn!("Process {} ignored SIGTERM, killing", pid);
            if let Err(e) = info.child.kill() {
                warn!("Failed to kill {}: {}", pid, e);
            }
            info.child
                .status()
                .await
                .map(|_| ())
                .map_err(|e| Error::Runner(format!("failed to reap {}: {}", pid, e)))
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn start(
        &self,
        name: &str,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle> {
        let spec: ProcessSpec = parse_config("process", config)?;
        self.launch("process", name, spec, env, ctx).await
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        info!("Stopping process instance {}", handle);

        let info = self
            .running_processes
            .lock()
            .await
            .remove(&handle.instance_id);

        match info {
            Some(mut info) => terminate(&mut info).await,
            None => {
                warn!("No tracked process for {}, assuming it already exited", handle);
                Ok(())
            }
        }
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let mut processes = self.running_processes.lock().await;
        match processes.get_mut(&handle.instance_id) {
            Some(info) => matches!(info.child.try_status(), Ok(None)),
            None => false,
        }
    }

    async fn logs(&self, handle: &ProcessHandle, max_lines: usize) -> Result<Vec<String>> {
        let processes = self.running_processes.lock().await;
        let info = processes
            .get(&handle.instance_id)
            .ok_or_else(|| Error::Runner(format!("unknown process instance {}", handle)))?;

        let buffer = info.output.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = buffer.len().saturating_sub(max_lines);
        Ok(buffer.iter().skip(skip).cloned().collect())
    }

    async fn run_hook(
        &self,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        let spec: ProcessSpec = parse_config("process", config)?;
        self.run_to_completion(spec, env, ctx).await
    }

    fn supports_hooks(&self) -> bool {
        true
    }
}
