//! Script runner: shell scripts executed through the process runner.

use super::{
    parse_config,
    process::{ProcessRunner, ProcessSpec},
};
use crate::{
    Result,
    capabilities::{ExitStatus, ProcessHandle, Runner, RuntimeContext},
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ScriptSpec {
    script: String,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl From<ScriptSpec> for ProcessSpec {
    fn from(spec: ScriptSpec) -> Self {
        ProcessSpec {
            command: spec.shell,
            args: vec!["-c".to_string(), spec.script],
            working_dir: spec.working_dir,
            env: spec.env,
            stop_grace_ms: 5_000,
        }
    }
}

/// Runner for inline shell scripts
///
/// Long-running scripts are tracked by the shared [`ProcessRunner`]; the
/// script runner only translates configuration.
pub struct ScriptRunner {
    process: Arc<ProcessRunner>,
}

impl ScriptRunner {
    /// Create a script runner backed by `process`
    pub fn new(process: Arc<ProcessRunner>) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    async fn start(
        &self,
        name: &str,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle> {
        let spec: ScriptSpec = parse_config("script", config)?;
        self.process
            .launch("script", name, spec.into(), env, ctx)
            .await
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.process.stop(handle).await
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        self.process.is_running(handle).await
    }

    async fn logs(&self, handle: &ProcessHandle, max_lines: usize) -> Result<Vec<String>> {
        self.process.logs(handle, max_lines).await
    }

    async fn run_hook(
        &self,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        let spec: ScriptSpec = parse_config("script", config)?;
        self.process.run_to_completion(spec.into(), env, ctx).await
    }

    fn supports_hooks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner() -> ScriptRunner {
        ScriptRunner::new(Arc::new(ProcessRunner::new(hive_runtime::default_spawner())))
    }

    #[smol_potat::test]
    async fn test_script_hook_sees_env() {
        let runner = runner();
        let ctx = RuntimeContext::new("db", "hook");
        let env = HashMap::from([("EXPECTED".to_string(), "db".to_string())]);

        let status = runner
            .run_hook(
                &json!({ "script": "test \"$HIVE_SERVICE\" = \"$EXPECTED\"" }),
                &env,
                &ctx,
            )
            .await
            .unwrap();
        assert!(status.success());
    }

    #[smol_potat::test]
    async fn test_script_service_lifecycle() {
        let runner = runner();
        let ctx = RuntimeContext::new("loop", "primary");

        let handle = runner
            .start(
                "loop",
                &json!({ "script": "while true; do sleep 1; done" }),
                &HashMap::new(),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(handle.runner_id, "script");
        assert!(runner.is_running(&handle).await);
        runner.stop(&handle).await.unwrap();
        assert!(!runner.is_running(&handle).await);
    }
}
