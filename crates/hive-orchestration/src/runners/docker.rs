//! Docker runner for containerized service execution.
//!
//! Talks to the docker CLI; container internals are never inspected beyond
//! what `docker inspect` reports.

use super::parse_config;
use crate::{
    Error, Result,
    capabilities::{ExitStatus, ProcessHandle, Runner, RuntimeContext},
};
use async_process::{Command, Output};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    image: String,
    #[serde(default)]
    args: Vec<String>,
    /// Port inside the container that the routing target maps onto
    #[serde(default)]
    container_port: Option<u16>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_stop_timeout")]
    stop_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct HookSpec {
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    network: Option<String>,
}

fn default_stop_timeout() -> u64 {
    10
}

/// Runner for Docker containers
pub struct DockerRunner {
    binary: String,
}

impl DockerRunner {
    /// Create a runner using the `docker` binary on PATH
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a different CLI binary (e.g. `podman`)
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Runner(format!("failed to run {}: {}", self.binary, e)))
    }

    async fn docker_ok(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(Error::Runner(format!(
                "{} {} failed: {}",
                self.binary,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn env_args(args: &mut Vec<String>, env: impl IntoIterator<Item = (String, String)>) {
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
}

fn run_args(
    container_name: &str,
    spec: &ContainerSpec,
    env: &HashMap<String, String>,
    ctx: &RuntimeContext,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--label".to_string(),
        format!("hive.service={}", ctx.service),
        "--label".to_string(),
        format!("hive.instance={}", ctx.instance),
    ];

    let mut vars: Vec<(String, String)> = env
        .iter()
        .chain(&spec.env)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    vars.push(("HIVE_SERVICE".to_string(), ctx.service.clone()));
    vars.push(("HIVE_VERSION".to_string(), ctx.version.clone()));
    vars.sort();
    env_args(&mut args, vars);

    if let (Some(target), Some(container_port)) = (&ctx.target, spec.container_port) {
        args.push("-p".to_string());
        args.push(format!("{}:{}", target.port, container_port));
    }
    for volume in &spec.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }

    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

#[async_trait]
impl Runner for DockerRunner {
    async fn start(
        &self,
        name: &str,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ProcessHandle> {
        let spec: ContainerSpec = parse_config("docker", config)?;
        let suffix = Uuid::new_v4().simple().to_string();
        let container_name = format!("hive-{}-{}-{}", name, ctx.instance, &suffix[..8]);

        info!("Starting container '{}' from {}", container_name, spec.image);
        let args = run_args(&container_name, &spec, env, ctx);
        let container_id = self.docker_ok(&args).await?;

        let mut handle = ProcessHandle::new("docker", container_id)
            .with_metadata("container_name", container_name)
            .with_metadata("image", spec.image.clone())
            .with_metadata("stop_timeout_secs", spec.stop_timeout_secs.to_string());
        if let Some(target) = &ctx.target {
            handle = handle.with_target(target);
        }
        Ok(handle)
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        info!("Stopping container {}", handle.instance_id);

        let grace = handle
            .metadata
            .get("stop_timeout_secs")
            .cloned()
            .unwrap_or_else(|| default_stop_timeout().to_string());

        // `docker stop` returns once the container has exited
        self.docker_ok(&[
            "stop".to_string(),
            "-t".to_string(),
            grace,
            handle.instance_id.clone(),
        ])
        .await?;

        if let Err(e) = self
            .docker_ok(&["rm".to_string(), handle.instance_id.clone()])
            .await
        {
            warn!("Failed to remove container {}: {}", handle.instance_id, e);
        }
        Ok(())
    }

    async fn is_running(&self, handle: &ProcessHandle) -> bool {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            handle.instance_id.clone(),
        ];
        match self.docker_ok(&args).await {
            Ok(state) => state == "true",
            Err(e) => {
                debug!("inspect of {} failed: {}", handle.instance_id, e);
                false
            }
        }
    }

    async fn logs(&self, handle: &ProcessHandle, max_lines: usize) -> Result<Vec<String>> {
        let output = self
            .docker(&[
                "logs".to_string(),
                "--tail".to_string(),
                max_lines.to_string(),
                handle.instance_id.clone(),
            ])
            .await?;

        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.split_off(skip))
    }

    async fn run_hook(
        &self,
        config: &Value,
        env: &HashMap<String, String>,
        ctx: &RuntimeContext,
    ) -> Result<ExitStatus> {
        let spec: HookSpec = parse_config("docker", config)?;

        let mut args = vec!["run".to_string(), "--rm".to_string()];
        let mut vars: Vec<(String, String)> =
            env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        vars.push(("HIVE_SERVICE".to_string(), ctx.service.clone()));
        vars.sort();
        env_args(&mut args, vars);
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.push(spec.image);
        args.extend(spec.command);

        let output = self.docker(&args).await?;
        Ok(ExitStatus::from(output.status))
    }

    fn supports_hooks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RouteTarget;
    use serde_json::json;

    #[test]
    fn test_run_args() {
        let spec: ContainerSpec = serde_json::from_value(json!({
            "image": "nginx:1.27",
            "container_port": 80,
            "volumes": ["/data:/usr/share/nginx/html"],
            "env": { "MODE": "prod" }
        }))
        .unwrap();
        let ctx = RuntimeContext::new("web", "green")
            .with_version("v2")
            .with_target(Some(RouteTarget::new("127.0.0.1", 8081)));
        let env = HashMap::from([("TOKEN".to_string(), "secret".to_string())]);

        let args = run_args("hive-web-green-1", &spec, &env, &ctx);

        assert_eq!(&args[..4], &["run", "-d", "--name", "hive-web-green-1"]);
        assert!(args.contains(&"hive.instance=green".to_string()));
        assert!(args.contains(&"MODE=prod".to_string()));
        assert!(args.contains(&"TOKEN=secret".to_string()));
        assert!(args.contains(&"HIVE_VERSION=v2".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "8081:80"]));
        assert!(args.windows(2).any(|w| w == ["-v", "/data:/usr/share/nginx/html"]));
        assert_eq!(args.last().map(String::as_str), Some("nginx:1.27"));
    }

    #[test]
    fn test_no_port_mapping_without_container_port() {
        let spec: ContainerSpec =
            serde_json::from_value(json!({ "image": "redis:7", "args": ["--save", ""] })).unwrap();
        let ctx = RuntimeContext::new("cache", "primary")
            .with_target(Some(RouteTarget::new("127.0.0.1", 6379)));

        let args = run_args("hive-cache", &spec, &HashMap::new(), &ctx);
        assert!(!args.contains(&"-p".to_string()));
        assert_eq!(&args[args.len() - 3..], &["redis:7", "--save", ""]);
    }

    #[smol_potat::test]
    async fn test_missing_binary_is_runner_error() {
        let runner = DockerRunner::with_binary("definitely-not-a-docker-binary");
        let ctx = RuntimeContext::new("web", "primary");
        let err = runner
            .start("web", &json!({ "image": "nginx" }), &HashMap::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Runner(_)));

        let handle = ProcessHandle::new("docker", "abc");
        assert!(!runner.is_running(&handle).await);
    }
}
