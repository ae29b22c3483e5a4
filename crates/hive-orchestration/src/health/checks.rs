//! Built-in health checks.

use crate::{
    Error, Result,
    capabilities::{HealthCheck, HealthResult, RuntimeContext},
    proxy::RouteTarget,
};
use async_net::TcpStream;
use async_process::Command;
use async_trait::async_trait;
use futures::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

fn parse<T: DeserializeOwned + Default>(check: &str, config: &Value) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| Error::InvalidConfig(format!("invalid {} health check config: {}", check, e)))
}

#[derive(Debug, Default, Deserialize)]
struct Endpoint {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

impl Endpoint {
    /// Explicit config wins over the instance's target
    fn resolve(&self, ctx: &RuntimeContext) -> Result<RouteTarget> {
        let fallback = ctx.target.as_ref();
        let host = self
            .host
            .clone()
            .or_else(|| fallback.map(|t| t.host.clone()));
        let port = self.port.or_else(|| fallback.map(|t| t.port));
        match (host, port) {
            (Some(host), Some(port)) => Ok(RouteTarget::new(host, port)),
            _ => Err(Error::HealthCheck(format!(
                "no target to probe for service '{}'",
                ctx.service
            ))),
        }
    }
}

/// Passes when a TCP connection to the target succeeds
pub struct TcpHealthCheck;

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    async fn check(&self, config: &Value, ctx: &RuntimeContext) -> Result<HealthResult> {
        let endpoint: Endpoint = parse("tcp", config)?;
        let target = endpoint.resolve(ctx)?;
        let started = Instant::now();

        let result = match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(_) => HealthResult::healthy(),
            Err(e) => HealthResult::unhealthy(format!("connect to {} failed: {}", target, e)),
        };
        Ok(result
            .with_response_time(started.elapsed())
            .with_detail("target", target.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct HttpSpec {
    host: Option<String>,
    port: Option<u16>,
    path: String,
    min_status: u16,
    max_status: u16,
}

impl Default for HttpSpec {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: "/health".to_string(),
            min_status: 200,
            max_status: 399,
        }
    }
}

/// Passes when `GET path` answers with a status in `min_status..=max_status`
pub struct HttpHealthCheck;

async fn http_status(target: &RouteTarget, path: &str) -> std::io::Result<u16> {
    let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: hive-health/1\r\nConnection: close\r\n\r\n",
        path, target
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut status_line = String::new();
    BufReader::new(stream).read_line(&mut status_line).await?;

    // HTTP/1.1 200 OK
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line: {:?}", status_line.trim()),
            )
        })
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, config: &Value, ctx: &RuntimeContext) -> Result<HealthResult> {
        let spec: HttpSpec = parse("http", config)?;
        let target = Endpoint {
            host: spec.host.clone(),
            port: spec.port,
        }
        .resolve(ctx)?;
        let started = Instant::now();

        debug!("HTTP health check GET http://{}{}", target, spec.path);
        let result = match http_status(&target, &spec.path).await {
            Ok(status) if (spec.min_status..=spec.max_status).contains(&status) => {
                HealthResult::healthy().with_detail("status", status.to_string())
            }
            Ok(status) => HealthResult::unhealthy(format!("unexpected status {}", status))
                .with_detail("status", status.to_string()),
            Err(e) => HealthResult::unhealthy(format!("request to {} failed: {}", target, e)),
        };
        Ok(result.with_response_time(started.elapsed()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CommandSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Passes when a local command exits with status 0
pub struct CommandHealthCheck;

#[async_trait]
impl HealthCheck for CommandHealthCheck {
    async fn check(&self, config: &Value, ctx: &RuntimeContext) -> Result<HealthResult> {
        let spec: CommandSpec = serde_json::from_value(config.clone()).map_err(|e| {
            Error::InvalidConfig(format!("invalid command health check config: {}", e))
        })?;
        let started = Instant::now();

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args).env("HIVE_SERVICE", &ctx.service);
        if let Some(target) = &ctx.target {
            cmd.env("HIVE_HOST", &target.host)
                .env("HIVE_PORT", target.port.to_string());
        }

        let result = match cmd.output().await {
            Ok(output) if output.status.success() => HealthResult::healthy(),
            Ok(output) => HealthResult::unhealthy(format!(
                "exit code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(e) => HealthResult::unhealthy(format!("failed to run {}: {}", spec.command, e)),
        };
        Ok(result.with_response_time(started.elapsed()))
    }
}
