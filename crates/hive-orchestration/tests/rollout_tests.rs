//! Integration tests for recreate and blue-green rollouts

mod common;

use common::{Harness, service};
use hive_orchestration::{
    BlueGreenState, CapabilityRef, Color, Error, RolloutStep, RouteTarget, ServiceConfig,
    ServiceState,
};
use serde_json::json;

fn blue_green(name: &str) -> ServiceConfig {
    service(name, 8080).with_rollout(CapabilityRef::new(
        "blue-green",
        json!({ "green_port": 8081 }),
    ))
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_blue_green_swaps_to_green() {
    let harness = Harness::new(vec![blue_green("web")]);
    let blue = harness.orchestrator.start("web").await.unwrap().handle.unwrap();
    assert_eq!(
        harness.orchestrator.routing_table().target("web"),
        Some(RouteTarget::new("127.0.0.1", 8080))
    );

    let report = harness.orchestrator.rollout("web", "v2").await.unwrap();

    assert_eq!(report.strategy, "blue-green");
    assert_eq!(report.target, Some(RouteTarget::new("127.0.0.1", 8081)));
    assert_eq!(
        report.steps.iter().map(|s| s.step).collect::<Vec<_>>(),
        vec![
            RolloutStep::StartNew,
            RolloutStep::WaitHealthy,
            RolloutStep::SwitchTraffic,
            RolloutStep::StopOld,
            RolloutStep::Finalize,
        ]
    );

    let metadata = harness.orchestrator.rollout_metadata("web").unwrap();
    assert_eq!(BlueGreenState::active_color(&metadata), Color::Green);
    assert!(!harness.runner.is_alive(&blue));
    assert_eq!(harness.runner.alive_count(), 1);

    let status = harness.orchestrator.get_status("web").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.version, "v2");
    assert_eq!(
        status.handle.and_then(|h| h.target()),
        Some(RouteTarget::new("127.0.0.1", 8081))
    );
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_second_blue_green_rollout_returns_to_blue() {
    let harness = Harness::new(vec![blue_green("web")]);
    harness.orchestrator.start("web").await.unwrap();

    harness.orchestrator.rollout("web", "v2").await.unwrap();
    let report = harness.orchestrator.rollout("web", "v3").await.unwrap();

    assert_eq!(report.old_version, "v2");
    assert_eq!(report.target, Some(RouteTarget::new("127.0.0.1", 8080)));
    let metadata = harness.orchestrator.rollout_metadata("web").unwrap();
    assert_eq!(BlueGreenState::active_color(&metadata), Color::Blue);
    assert_eq!(harness.runner.alive_count(), 1);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_restart_after_green_rollout_stays_on_green() {
    let harness = Harness::new(vec![blue_green("web")]);
    harness.orchestrator.start("web").await.unwrap();
    harness.orchestrator.rollout("web", "v2").await.unwrap();

    let snapshot = harness.orchestrator.restart("web").await.unwrap();

    let green = RouteTarget::new("127.0.0.1", 8081);
    assert_eq!(snapshot.state, ServiceState::Running);
    assert_eq!(snapshot.handle.and_then(|h| h.target()), Some(green.clone()));
    assert_eq!(harness.orchestrator.routing_table().target("web"), Some(green.clone()));

    // the next rollout starts blue beside the live green instance
    let report = harness.orchestrator.rollout("web", "v3").await.unwrap();
    let started = harness.runner.started();
    assert_eq!(
        started.last().and_then(|c| c.target.clone()),
        Some(RouteTarget::new("127.0.0.1", 8080))
    );
    assert_eq!(report.target, Some(RouteTarget::new("127.0.0.1", 8080)));
    let metadata = harness.orchestrator.rollout_metadata("web").unwrap();
    assert_eq!(BlueGreenState::active_color(&metadata), Color::Blue);
    assert_eq!(harness.runner.alive_count(), 1);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_stop_and_start_after_green_rollout_stays_on_green() {
    let harness = Harness::new(vec![blue_green("web")]);
    harness.orchestrator.start("web").await.unwrap();
    harness.orchestrator.rollout("web", "v2").await.unwrap();

    harness.orchestrator.stop("web").await.unwrap();
    let snapshot = harness.orchestrator.start("web").await.unwrap();

    let green = RouteTarget::new("127.0.0.1", 8081);
    assert_eq!(snapshot.version, "v2");
    assert_eq!(snapshot.handle.and_then(|h| h.target()), Some(green.clone()));
    assert_eq!(harness.orchestrator.routing_table().target("web"), Some(green.clone()));

    let live = harness.orchestrator.routing_table().target("web");
    harness.orchestrator.rollout("web", "v3").await.unwrap();
    let started = harness.runner.started();
    assert_ne!(started.last().and_then(|c| c.target.clone()), live);
    assert_eq!(
        harness.orchestrator.routing_table().target("web"),
        Some(RouteTarget::new("127.0.0.1", 8080))
    );
    assert_eq!(harness.runner.alive_count(), 1);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_failed_green_health_keeps_route_unchanged() {
    let harness = Harness::new(vec![blue_green("web")]);
    let blue = harness.orchestrator.start("web").await.unwrap().handle.unwrap();
    let before = harness.orchestrator.routing_table().get("web").unwrap();
    harness.health.fail_instance("green");

    let err = harness.orchestrator.rollout("web", "v2").await.unwrap_err();

    assert!(matches!(err.root(), Error::HealthTimeout { .. }));
    assert!(!err.is_fatal());

    let after = harness.orchestrator.routing_table().get("web").unwrap();
    assert_eq!(*before, *after);

    let status = harness.orchestrator.get_status("web").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.version, "latest");
    assert_eq!(status.handle, Some(blue.clone()));
    assert!(harness.runner.is_alive(&blue));
    assert_eq!(harness.runner.alive_count(), 1);

    let metadata = harness.orchestrator.rollout_metadata("web").unwrap();
    assert_eq!(BlueGreenState::active_color(&metadata), Color::Blue);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_failed_rollback_is_fatal() {
    let harness = Harness::new(vec![blue_green("web")]);
    harness.orchestrator.start("web").await.unwrap();
    harness.health.fail_instance("green");
    harness.runner.fail_stops("web");

    let err = harness.orchestrator.rollout("web", "v2").await.unwrap_err();

    assert!(matches!(err.root(), Error::RollbackFailed { .. }));
    assert!(err.is_fatal());
    // traffic was still put back before the failed cleanup
    assert_eq!(
        harness.orchestrator.routing_table().target("web"),
        Some(RouteTarget::new("127.0.0.1", 8080))
    );
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_recreate_rollout_replaces_instance() {
    let harness = Harness::new(vec![service("api", 9001)]);
    let old = harness.orchestrator.start("api").await.unwrap().handle.unwrap();

    let report = harness.orchestrator.rollout("api", "v2").await.unwrap();

    assert_eq!(report.strategy, "recreate");
    assert_eq!(report.new_version, "v2");
    assert_eq!(report.target, Some(RouteTarget::new("127.0.0.1", 9001)));
    assert!(!harness.runner.is_alive(&old));
    assert_eq!(harness.runner.alive_count(), 1);

    let started = harness.runner.started();
    assert_eq!(started.last().map(|c| c.version.as_str()), Some("v2"));

    let status = harness.orchestrator.get_status("api").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.version, "v2");
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_rollout_requires_running_service() {
    let harness = Harness::new(vec![service("api", 9001)]);

    let err = harness.orchestrator.rollout("api", "v2").await.unwrap_err();

    assert!(matches!(
        err.root(),
        Error::InvalidState {
            state: ServiceState::Stopped,
            ..
        }
    ));
    assert!(harness.runner.started().is_empty());
}

#[test]
fn test_blue_green_without_green_port_is_rejected() {
    let config = service("web", 8080).with_rollout(CapabilityRef::bare("blue-green"));
    let err = Harness::try_new(
        vec![config],
        hive_orchestration::testing::ScriptedHealthCheck::always(true),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidConfig(_)));
}
