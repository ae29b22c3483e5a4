//! Integration tests for dependency-driven start and stop ordering

mod common;

use common::{Harness, service};
use hive_orchestration::testing::ScriptedHealthCheck;
use hive_orchestration::{Dependency, Error, FailurePolicy, HookConfig, ServiceState};
use serde_json::json;
use std::time::{Duration, Instant};

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_dependency_is_healthy_before_dependent_starts() {
    let harness = Harness::new(vec![
        service("a", 9001).depends_on(Dependency::required("b")),
        service("b", 9002),
    ]);

    let snapshot = harness.orchestrator.start("a").await.unwrap();

    assert_eq!(snapshot.state, ServiceState::Running);
    assert_eq!(
        harness.log.calls(),
        vec!["b.start", "b.health", "a.start", "a.health"]
    );
    assert_eq!(
        harness.orchestrator.get_status("b").unwrap().state,
        ServiceState::Running
    );
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_independent_dependencies_start_in_parallel() {
    let harness = Harness::new(vec![
        service("api", 9001)
            .depends_on(Dependency::required("db"))
            .depends_on(Dependency::required("cache")),
        service("db", 9002),
        service("cache", 9003),
    ]);
    let delay = Duration::from_millis(200);
    harness.runner.set_start_delay(delay);

    let started = Instant::now();
    harness.orchestrator.start("api").await.unwrap();
    let elapsed = started.elapsed();

    // two levels: db and cache together, then api
    assert!(elapsed >= delay * 2, "finished too early: {:?}", elapsed);
    assert!(elapsed < delay * 3, "siblings started one after another: {:?}", elapsed);
    assert_eq!(harness.runner.alive_count(), 3);
}

#[test]
fn test_cycle_is_rejected_before_any_start() {
    let err = Harness::try_new(
        vec![
            service("a", 9001).depends_on(Dependency::required("b")),
            service("b", 9002).depends_on(Dependency::required("c")),
            service("c", 9003).depends_on(Dependency::required("a")),
        ],
        ScriptedHealthCheck::always(true),
    )
    .err()
    .unwrap();

    assert!(matches!(err, Error::DependencyCycle(_)));
    assert!(err.to_string().starts_with("Circular dependency detected"));
}

#[test]
fn test_unknown_dependency_is_rejected() {
    let err = Harness::try_new(
        vec![service("a", 9001).depends_on(Dependency::required("ghost"))],
        ScriptedHealthCheck::always(true),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::MissingDependency { .. }));
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_failed_dependency_blocks_dependent() {
    let harness = Harness::new(vec![
        service("api", 9001).depends_on(Dependency::required("db")),
        service("db", 9002),
    ]);
    harness.runner.fail_starts("db");

    let err = harness.orchestrator.start("api").await.unwrap_err();

    match err.root() {
        Error::DependencyFailed {
            service,
            dependency,
            ..
        } => {
            assert_eq!(service, "api");
            assert_eq!(dependency, "db");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.snapshot().unwrap().state, ServiceState::Stopped);
    assert!(harness.log.matching("api.").is_empty());
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_best_effort_dependency_failure_only_warns() {
    let harness = Harness::new(vec![
        service("api", 9001).depends_on(Dependency::best_effort("cache")),
        service("cache", 9002),
    ]);
    harness.runner.fail_starts("cache");

    let snapshot = harness.orchestrator.start("api").await.unwrap();

    assert_eq!(snapshot.state, ServiceState::Running);
    assert_eq!(
        harness.orchestrator.get_status("cache").unwrap().state,
        ServiceState::Stopped
    );
    assert_eq!(harness.warnings().await, 1);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_start_all_and_stop_all_follow_levels() {
    let harness = Harness::new(vec![
        service("web", 9001).depends_on(Dependency::required("api")),
        service("api", 9002).depends_on(Dependency::required("db")),
        service("worker", 9003).depends_on(Dependency::required("db")),
        service("db", 9004),
    ]);

    let status = harness.orchestrator.start_all().await.unwrap();
    assert!(status.iter().all(|s| s.state == ServiceState::Running));
    assert_eq!(status.first().map(|s| s.name.as_str()), Some("db"));
    assert_eq!(status.last().map(|s| s.name.as_str()), Some("web"));

    let starts = harness.log.matching("");
    let position = |call: &str| starts.iter().position(|c| c == call).unwrap();
    assert!(position("db.health") < position("api.start"));
    assert!(position("db.health") < position("worker.start"));
    assert!(position("api.health") < position("web.start"));

    // idempotent for services that are already running
    harness.orchestrator.start_all().await.unwrap();
    assert_eq!(harness.runner.alive_count(), 4);

    harness.log.clear();
    harness.orchestrator.stop_all().await.unwrap();
    let stops = harness.log.calls();
    let position = |call: &str| stops.iter().position(|c| c == call).unwrap();
    assert!(position("web.stop") < position("api.stop"));
    assert!(position("api.stop") < position("db.stop"));
    assert!(position("worker.stop") < position("db.stop"));
    assert_eq!(harness.runner.alive_count(), 0);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_start_all_reports_first_failure_and_skips_dependents() {
    let harness = Harness::new(vec![
        service("api", 9001).depends_on(Dependency::required("db")),
        service("db", 9002),
        service("metrics", 9003),
    ]);
    harness.runner.fail_starts("db");

    let err = harness.orchestrator.start_all().await.unwrap_err();

    assert!(matches!(err.root(), Error::Runner(_)));
    assert_eq!(
        harness.orchestrator.get_status("metrics").unwrap().state,
        ServiceState::Running
    );
    assert_eq!(
        harness.orchestrator.get_status("api").unwrap().state,
        ServiceState::Stopped
    );
    assert!(harness.log.matching("api.").is_empty());
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_hook_policies() {
    let mut config = service("api", 9001);
    config.hooks.pre_up.push(HookConfig::new(
        "fake",
        json!({ "name": "migrate", "exit": 3 }),
        FailurePolicy::Warn,
    ));
    config.hooks.post_up.push(HookConfig::new(
        "fake",
        json!({ "name": "announce" }),
        FailurePolicy::Abort,
    ));
    config.hooks.post_down.push(HookConfig::new(
        "fake",
        json!({ "name": "cleanup" }),
        FailurePolicy::Abort,
    ));
    let harness = Harness::new(vec![config]);

    harness.orchestrator.start("api").await.unwrap();
    assert_eq!(harness.warnings().await, 1);
    assert_eq!(
        harness.log.calls(),
        vec!["api.hook", "api.start", "api.health", "api.hook"]
    );

    harness.orchestrator.stop("api").await.unwrap();
    let names: Vec<String> = harness
        .runner
        .hooks()
        .into_iter()
        .map(|(_, config)| config["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["migrate", "announce", "cleanup"]);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_failing_post_up_abort_leaves_service_running() {
    let mut config = service("api", 9001);
    config.hooks.post_up.push(HookConfig::new(
        "fake",
        json!({ "exit": 1 }),
        FailurePolicy::Abort,
    ));
    let harness = Harness::new(vec![config]);

    let err = harness.orchestrator.start("api").await.unwrap_err();

    assert!(matches!(err.root(), Error::Hook { hook: "post_up", .. }));
    assert_eq!(err.snapshot().unwrap().state, ServiceState::Running);
}
