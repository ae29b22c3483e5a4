//! Recreate: stop the old instance, then start the new one.
//!
//! Traffic is withdrawn between the two, so clients see a gap.

use super::{NEW_LABEL, OLD_LABEL, RolloutContext, RolloutOps, RolloutStep, StepResult};
use crate::{Error, Result, capabilities::RolloutStrategy};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Stop-then-start rollout
pub struct RecreateStrategy;

#[async_trait]
impl RolloutStrategy for RecreateStrategy {
    fn plan(&self, _config: &Value) -> Result<Vec<RolloutStep>> {
        Ok(vec![
            RolloutStep::StopOld,
            RolloutStep::StartNew,
            RolloutStep::WaitHealthy,
            RolloutStep::SwitchTraffic,
        ])
    }

    async fn execute_step(
        &self,
        step: RolloutStep,
        ctx: &mut RolloutContext,
        ops: &dyn RolloutOps,
    ) -> Result<StepResult> {
        match step {
            RolloutStep::StopOld => {
                let old = ctx
                    .instances
                    .remove(OLD_LABEL)
                    .ok_or_else(|| Error::Rollout("no running instance to replace".to_string()))?;
                ops.withdraw_traffic();
                ctx.live = None;
                if let Err(e) = ops.stop_instance(&old).await {
                    // still ours to clean up on rollback
                    ctx.instances.insert(OLD_LABEL.to_string(), old);
                    ctx.live = Some(OLD_LABEL.to_string());
                    return Err(e);
                }
                ctx.metadata.insert("old_stopped".to_string(), "true".to_string());
                Ok(StepResult::done(step, format!("stopped {}", old)))
            }
            RolloutStep::StartNew => {
                let handle = ops
                    .start_instance(NEW_LABEL, &ctx.new_version, ops.default_target())
                    .await?;
                let detail = format!("started {} as {}", ctx.new_version, handle);
                ctx.instances.insert(NEW_LABEL.to_string(), handle);
                Ok(StepResult::done(step, detail))
            }
            RolloutStep::WaitHealthy => {
                let handle = ctx
                    .instance(NEW_LABEL)
                    .ok_or_else(|| Error::Rollout("new instance was never started".to_string()))?;
                ops.wait_healthy(NEW_LABEL, handle).await?;
                ctx.live = Some(NEW_LABEL.to_string());
                Ok(StepResult::done(step, "new instance is healthy"))
            }
            RolloutStep::SwitchTraffic => {
                let target = ctx
                    .instance(NEW_LABEL)
                    .and_then(|h| h.target())
                    .or_else(|| ops.default_target());
                match target {
                    Some(target) => {
                        ops.switch_traffic(target.clone());
                        Ok(StepResult::done(step, format!("routing to {}", target)))
                    }
                    None => Ok(StepResult::done(step, "service has no endpoint to route")),
                }
            }
            RolloutStep::Finalize => {
                ctx.metadata.remove("old_stopped");
                Ok(StepResult::done(step, "nothing to persist"))
            }
        }
    }

    async fn rollback(&self, ctx: &mut RolloutContext, ops: &dyn RolloutOps) -> Result<()> {
        let mut outcome = Ok(());

        if let Some(new) = ctx.instances.remove(NEW_LABEL) {
            info!(service = %ctx.service, "Stopping replacement instance {}", new);
            if let Err(e) = ops.stop_instance(&new).await {
                warn!(service = %ctx.service, "Failed to stop replacement instance: {}", e);
                ctx.instances.insert(NEW_LABEL.to_string(), new);
                outcome = Err(e);
            }
        }
        ctx.live = ctx.instance(OLD_LABEL).map(|_| OLD_LABEL.to_string());

        if ctx.metadata.remove("old_stopped").is_some() && outcome.is_ok() {
            info!(service = %ctx.service, "Restarting previous version {}", ctx.old_version);
            let restarted = async {
                let handle = ops
                    .start_instance(OLD_LABEL, &ctx.old_version, ops.default_target())
                    .await?;
                ops.wait_healthy(OLD_LABEL, &handle).await?;
                Ok::<_, Error>(handle)
            }
            .await;
            match restarted {
                Ok(handle) => {
                    ctx.instances.insert(OLD_LABEL.to_string(), handle);
                    ctx.live = Some(OLD_LABEL.to_string());
                }
                Err(e) => outcome = Err(e),
            }
        }

        ops.restore_traffic(ctx.previous_route.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ProcessHandle;
    use crate::proxy::RouteTarget;
    use crate::rollout::test_ops::RecordingOps;

    fn context(ops: &RecordingOps) -> RolloutContext {
        let old = ProcessHandle::new("fake", "old-v1").with_target(&RouteTarget::new("127.0.0.1", 8080));
        ops.routing.set("web", RouteTarget::new("127.0.0.1", 8080));
        RolloutContext::new("web", "v1", "v2", old)
            .with_previous_route(ops.routing.get("web").map(|e| (*e).clone()))
    }

    async fn run(ctx: &mut RolloutContext, ops: &RecordingOps) -> Result<()> {
        for step in RecreateStrategy.plan(&Value::Null)? {
            if let Err(e) = RecreateStrategy.execute_step(step, ctx, ops).await {
                RecreateStrategy.rollback(ctx, ops).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    #[smol_potat::test]
    async fn test_recreate_order() {
        let ops = RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080)));
        let mut ctx = context(&ops);

        run(&mut ctx, &ops).await.unwrap();

        assert_eq!(
            ops.calls(),
            vec![
                "withdraw",
                "stop old-v1",
                "start new v2",
                "wait new",
                "switch 127.0.0.1:8080",
            ]
        );
        assert_eq!(ctx.live_handle().map(|h| h.instance_id.as_str()), Some("new-v2"));
    }

    #[smol_potat::test]
    async fn test_recreate_rollback_restarts_old_version() {
        let ops = RecordingOps::new(Some(RouteTarget::new("127.0.0.1", 8080)));
        ops.unhealthy.lock().unwrap().insert(NEW_LABEL.to_string());
        let mut ctx = context(&ops);
        let before = ops.routing.get("web").map(|e| (*e).clone());

        let err = run(&mut ctx, &ops).await.unwrap_err();
        assert!(matches!(err, Error::HealthTimeout { .. }));

        let calls = ops.calls();
        assert!(calls.contains(&"stop new-v2".to_string()));
        assert!(calls.contains(&"start old v1".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("restore"));
        assert_eq!(ops.routing.get("web").map(|e| (*e).clone()), before);
        assert_eq!(ctx.live_handle().map(|h| h.instance_id.as_str()), Some("old-v1"));
    }
}
