//! Blue-green rollout.
//!
//! The new version starts under the inactive color at its own target. Only
//! after it passes the health gate is the route swapped, in one write, and
//! the old color stopped. The active color is remembered in the rollout
//! metadata for the next rollout.

use super::{OLD_LABEL, RolloutContext, RolloutOps, RolloutStep, StepResult};
use crate::{Error, Result, capabilities::RolloutStrategy, proxy::RouteTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

const ACTIVE_COLOR_KEY: &str = "active_color";
const STARTED_AT_KEY: &str = "new_instance_started_at";
const SWITCHED_KEY: &str = "traffic_switched";

/// Deployment color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Blue (the color of a service's first instance)
    #[default]
    Blue,
    /// Green
    Green,
}

impl Color {
    /// The other color
    pub fn other(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    /// Instance label for this color
    pub fn label(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }

    fn parse(s: &str) -> Option<Color> {
        match s {
            "blue" => Some(Color::Blue),
            "green" => Some(Color::Green),
            _ => None,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BlueGreenConfig {
    host: Option<String>,
    blue_port: Option<u16>,
    green_port: Option<u16>,
}

impl BlueGreenConfig {
    fn parse(config: &Value) -> Result<Self> {
        let parsed: Self = if config.is_null() {
            Self::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| {
                Error::InvalidConfig(format!("invalid blue-green config: {}", e))
            })?
        };
        if parsed.green_port.is_none() {
            return Err(Error::InvalidConfig(
                "blue-green rollout needs a green_port".to_string(),
            ));
        }
        if parsed.blue_port.is_some() && parsed.blue_port == parsed.green_port {
            return Err(Error::InvalidConfig(
                "blue and green must use distinct ports".to_string(),
            ));
        }
        Ok(parsed)
    }
}

/// Per-service blue-green state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueGreenState {
    /// Color currently receiving traffic
    pub active_color: Color,
    /// Where the blue instance serves
    pub blue_target: RouteTarget,
    /// Where the green instance serves
    pub green_target: RouteTarget,
    /// When the most recent new-color instance was started
    pub new_instance_started_at: Option<DateTime<Utc>>,
}

impl BlueGreenState {
    /// Active color recorded in rollout metadata (blue when absent)
    pub fn active_color(metadata: &HashMap<String, String>) -> Color {
        metadata
            .get(ACTIVE_COLOR_KEY)
            .and_then(|c| Color::parse(c))
            .unwrap_or_default()
    }

    fn load(
        metadata: &HashMap<String, String>,
        config: &Value,
        endpoint: Option<RouteTarget>,
    ) -> Result<Self> {
        let config = BlueGreenConfig::parse(config)?;
        let host = config
            .host
            .or_else(|| endpoint.as_ref().map(|t| t.host.clone()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let blue_port = config
            .blue_port
            .or_else(|| endpoint.as_ref().map(|t| t.port))
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "blue-green rollout needs a blue_port or a service endpoint".to_string(),
                )
            })?;
        // green_port presence was checked by parse
        let green_port = config.green_port.unwrap_or_default();
        if blue_port == green_port {
            return Err(Error::InvalidConfig(
                "blue and green must use distinct ports".to_string(),
            ));
        }

        Ok(Self {
            active_color: Self::active_color(metadata),
            blue_target: RouteTarget::new(host.clone(), blue_port),
            green_target: RouteTarget::new(host, green_port),
            new_instance_started_at: metadata
                .get(STARTED_AT_KEY)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
        })
    }

    fn store(&self, metadata: &mut HashMap<String, String>) {
        metadata.insert(ACTIVE_COLOR_KEY.to_string(), self.active_color.to_string());
        if let Some(at) = self.new_instance_started_at {
            metadata.insert(STARTED_AT_KEY.to_string(), at.to_rfc3339());
        }
    }

    /// Target of a color
    pub fn target(&self, color: Color) -> &RouteTarget {
        match color {
            Color::Blue => &self.blue_target,
            Color::Green => &self.green_target,
        }
    }

    /// Target of the color receiving traffic
    pub fn active_target(&self) -> &RouteTarget {
        self.target(self.active_color)
    }

    /// Color that is not receiving traffic
    pub fn inactive_color(&self) -> Color {
        self.active_color.other()
    }
}

/// Start alongside, verify, then swap traffic
pub struct BlueGreenStrategy;

impl BlueGreenStrategy {
    fn state(ctx: &RolloutContext, ops: &dyn RolloutOps) -> Result<BlueGreenState> {
        BlueGreenState::load(&ctx.metadata, &ctx.config, ops.default_target())
    }
}

#[async_trait]
impl RolloutStrategy for BlueGreenStrategy {
    fn plan(&self, config: &Value) -> Result<Vec<RolloutStep>> {
        BlueGreenConfig::parse(config)?;
        Ok(vec![
            RolloutStep::StartNew,
            RolloutStep::WaitHealthy,
            RolloutStep::SwitchTraffic,
            RolloutStep::StopOld,
            RolloutStep::Finalize,
        ])
    }

    async fn execute_step(
        &self,
        step: RolloutStep,
        ctx: &mut RolloutContext,
        ops: &dyn RolloutOps,
    ) -> Result<StepResult> {
        let mut state = Self::state(ctx, ops)?;
        let active = state.active_color;
        let inactive = state.inactive_color();

        match step {
            RolloutStep::StartNew => {
                ctx.relabel(OLD_LABEL, active.label());
                let target = state.target(inactive).clone();
                let handle = ops
                    .start_instance(inactive.label(), &ctx.new_version, Some(target.clone()))
                    .await?;
                info!(service = %ctx.service, color = %inactive, "Started {} at {}", handle, target);
                ctx.instances.insert(inactive.label().to_string(), handle);

                state.new_instance_started_at = Some(Utc::now());
                state.store(&mut ctx.metadata);
                Ok(StepResult::done(
                    step,
                    format!("started {} as {} at {}", ctx.new_version, inactive, target),
                ))
            }
            RolloutStep::WaitHealthy => {
                let handle = ctx.instance(inactive.label()).ok_or_else(|| {
                    Error::Rollout(format!("{} instance was never started", inactive))
                })?;
                ops.wait_healthy(inactive.label(), handle).await?;
                Ok(StepResult::done(step, format!("{} is healthy", inactive)))
            }
            RolloutStep::SwitchTraffic => {
                let target = ctx
                    .instance(inactive.label())
                    .and_then(|h| h.target())
                    .unwrap_or_else(|| state.target(inactive).clone());
                ops.switch_traffic(target.clone());
                ctx.live = Some(inactive.label().to_string());
                ctx.metadata.insert(SWITCHED_KEY.to_string(), "true".to_string());
                Ok(StepResult::done(step, format!("routing to {} ({})", inactive, target)))
            }
            RolloutStep::StopOld => match ctx.instances.remove(active.label()) {
                Some(old) => {
                    if let Err(e) = ops.stop_instance(&old).await {
                        ctx.instances.insert(active.label().to_string(), old);
                        return Err(e);
                    }
                    Ok(StepResult::done(step, format!("stopped {} ({})", active, old)))
                }
                None => Ok(StepResult::done(step, format!("no {} instance to stop", active))),
            },
            RolloutStep::Finalize => {
                state.active_color = inactive;
                state.store(&mut ctx.metadata);
                ctx.metadata.remove(SWITCHED_KEY);
                Ok(StepResult::done(step, format!("{} is now active", inactive)))
            }
        }
    }

    async fn rollback(&self, ctx: &mut RolloutContext, ops: &dyn RolloutOps) -> Result<()> {
        let active = BlueGreenState::active_color(&ctx.metadata);
        let inactive = active.other();

        // Route first: the old color takes traffic again before anything else
        ops.restore_traffic(ctx.previous_route.clone());
        ctx.metadata.remove(SWITCHED_KEY);
        ctx.relabel(OLD_LABEL, active.label());
        ctx.live = ctx.instance(active.label()).map(|_| active.label().to_string());

        if let Some(new) = ctx.instances.remove(inactive.label()) {
            info!(service = %ctx.service, color = %inactive, "Stopping {}", new);
            if let Err(e) = ops.stop_instance(&new).await {
                warn!(service = %ctx.service, "Failed to stop {} instance: {}", inactive, e);
                ctx.instances.insert(inactive.label().to_string(), new);
                return Err(e);
            }
        }
        Ok(())
    }

    fn live_target(
        &self,
        config: &Value,
        metadata: &HashMap<String, String>,
        endpoint: Option<RouteTarget>,
    ) -> Result<Option<RouteTarget>> {
        let state = BlueGreenState::load(metadata, config, endpoint)?;
        Ok(Some(state.active_target().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ProcessHandle;
    use crate::rollout::test_ops::RecordingOps;
    use serde_json::json;

    fn context(ops: &RecordingOps, metadata: HashMap<String, String>) -> RolloutContext {
        let old = ProcessHandle::new("fake", "blue-v1").with_target(&RouteTarget::new("127.0.0.1", 8080));
        ops.routing.set("web", RouteTarget::new("127.0.0.1", 8080));
        RolloutContext::new("web", "v1", "v2", old)
            .with_config(json!({ "green_port": 8081 }))
            .with_previous_route(ops.routing.get("web").map(|e| (*e).clone()))
            .with_metadata(metadata)
    }

    async fn run(ctx: &mut RolloutContext, ops: &RecordingOps) -> Result<()> {
        for step in BlueGreenStrategy.plan(&ctx.config)? {
            if let Err(e) = BlueGreenStrategy.execute_step(step, ctx, ops).await {
                BlueGreenStrategy.rollback(ctx, ops).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    #[test]
    fn test_plan_requires_green_port() {
        assert!(BlueGreenStrategy.plan(&Value::Null).is_err());
        assert!(BlueGreenStrategy
            .plan(&json!({ "blue_port": 80, "green_port": 80 }))
            .is_err());
        assert_eq!(
            BlueGreenStrategy.plan(&json!({ "green_port": 8081 })).unwrap().len(),
            5
        );
    }

    #[test]
    fn test_live_target_follows_active_color() {
        let config = json!({ "green_port": 8081 });
        let endpoint = Some(RouteTarget::new("127.0.0.1", 8080));

        let fresh = BlueGreenStrategy
            .live_target(&config, &HashMap::new(), endpoint.clone())
            .unwrap();
        assert_eq!(fresh, Some(RouteTarget::new("127.0.0.1", 8080)));

        let metadata = HashMap::from([(ACTIVE_COLOR_KEY.to_string(), "green".to_string())]);
        let green = BlueGreenStrategy
            .live_target(&config, &metadata, endpoint)
            .unwrap();
        assert_eq!(green, Some(RouteTarget::new("127.0.0.1", 8081)));

        assert!(BlueGreenStrategy
            .live_target(&config, &HashMap::new(), None)
            .is_err());
    }

    #[smol_potat::test]
    async fn test_successful_swap() {
        let ops = RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080)));
        let mut ctx = context(&ops, HashMap::new());

        run(&mut ctx, &ops).await.unwrap();

        assert_eq!(
            ops.calls(),
            vec![
                "start green v2",
                "wait green",
                "switch 127.0.0.1:8081",
                "stop blue-v1",
            ]
        );
        assert_eq!(BlueGreenState::active_color(&ctx.metadata), Color::Green);
        assert_eq!(ops.routing.target("web"), Some(RouteTarget::new("127.0.0.1", 8081)));
        assert_eq!(ctx.live_handle().map(|h| h.instance_id.as_str()), Some("green-v2"));
        assert!(ctx.metadata.contains_key(STARTED_AT_KEY));
    }

    #[smol_potat::test]
    async fn test_second_rollout_returns_to_blue() {
        let ops = RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080)));
        let metadata = HashMap::from([(ACTIVE_COLOR_KEY.to_string(), "green".to_string())]);
        let mut ctx = context(&ops, metadata);

        run(&mut ctx, &ops).await.unwrap();

        assert!(ops.calls().contains(&"start blue v2".to_string()));
        assert_eq!(BlueGreenState::active_color(&ctx.metadata), Color::Blue);
        assert_eq!(ops.routing.target("web"), Some(RouteTarget::new("127.0.0.1", 8080)));
    }

    #[smol_potat::test]
    async fn test_failed_health_wait_keeps_route() {
        let ops = RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080)));
        ops.unhealthy.lock().unwrap().insert("green".to_string());
        let mut ctx = context(&ops, HashMap::new());
        let before = ops.routing.get("web").map(|e| (*e).clone());

        let err = run(&mut ctx, &ops).await.unwrap_err();
        assert!(matches!(err, Error::HealthTimeout { .. }));

        assert_eq!(ops.routing.get("web").map(|e| (*e).clone()), before);
        assert!(!ops.calls().iter().any(|c| c.starts_with("switch")));
        assert!(ops.calls().contains(&"stop green-v2".to_string()));
        assert_eq!(BlueGreenState::active_color(&ctx.metadata), Color::Blue);
        assert_eq!(ctx.live_handle().map(|h| h.instance_id.as_str()), Some("blue-v1"));
    }

    #[smol_potat::test]
    async fn test_failed_stop_old_restores_route() {
        struct FailingStop(RecordingOps);

        #[async_trait]
        impl RolloutOps for FailingStop {
            async fn start_instance(
                &self,
                label: &str,
                version: &str,
                target: Option<RouteTarget>,
            ) -> Result<crate::capabilities::ProcessHandle> {
                self.0.start_instance(label, version, target).await
            }
            async fn wait_healthy(&self, label: &str, handle: &ProcessHandle) -> Result<()> {
                self.0.wait_healthy(label, handle).await
            }
            async fn stop_instance(&self, handle: &ProcessHandle) -> Result<()> {
                if handle.instance_id == "blue-v1" {
                    return Err(Error::Runner("stop timed out".to_string()));
                }
                self.0.stop_instance(handle).await
            }
            fn switch_traffic(&self, target: RouteTarget) -> Option<crate::proxy::RouteEntry> {
                self.0.switch_traffic(target)
            }
            fn withdraw_traffic(&self) -> Option<crate::proxy::RouteEntry> {
                self.0.withdraw_traffic()
            }
            fn restore_traffic(&self, previous: Option<crate::proxy::RouteEntry>) {
                self.0.restore_traffic(previous)
            }
            fn default_target(&self) -> Option<RouteTarget> {
                self.0.default_target()
            }
        }

        let ops = FailingStop(RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080))));
        let mut ctx = context(&ops.0, HashMap::new());
        let before = ops.0.routing.get("web").map(|e| (*e).clone());

        let mut failed = None;
        for step in BlueGreenStrategy.plan(&ctx.config).unwrap() {
            if BlueGreenStrategy.execute_step(step, &mut ctx, &ops).await.is_err() {
                failed = Some(step);
                BlueGreenStrategy.rollback(&mut ctx, &ops).await.unwrap();
                break;
            }
        }

        assert_eq!(failed, Some(RolloutStep::StopOld));
        assert_eq!(ops.0.routing.get("web").map(|e| (*e).clone()), before);
        assert_eq!(ctx.live_handle().map(|h| h.instance_id.as_str()), Some("blue-v1"));
    }
}
