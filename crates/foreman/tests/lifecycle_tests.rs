//! End-to-end rollout, uninstall and status through the `Orchestrator`.

mod common;

use std::time::Duration;

use serde_json::json;

use common::*;
use foreman::strategy::{RolloutOutcome, Status};
use foreman::{ForemanError, ResourceSpec, Wait};

const RESOURCE: &str = "prod/shop";
const SPEC_PATH: &str = "resources/test/prod/shop.yaml";
const LOCK_KEY: &str = "resources/test/prod/shop.yaml.lock";

fn app() -> serde_json::Value {
    json!({"image": "registry.example/shop:1"})
}

fn stack() -> foreman::Manifest {
    vec![
        statefulset("db").build(),
        service("web"),
        deployment("api", "registry.example/api:1", 3),
    ]
}

// ============================================================================
// Rollout
// ============================================================================

#[test]
fn test_fresh_install_applies_and_persists() {
    let harness = TestHarness::new();
    let report = harness.apply(RESOURCE, web_spec(app()), stack());

    assert_eq!(
        report.applied,
        vec!["StatefulSet-db---0", "Service-web", "Deployment-api"]
    );
    assert!(report.skipped.is_empty());
    assert!(harness.cluster.contains("prod", "Service", "web"));
    assert!(harness.cluster.contains("prod", "Deployment", "api"));

    let names: Vec<String> = harness
        .release("prod", "shop")
        .iter()
        .map(|item| item.name().to_string())
        .collect();
    assert_eq!(names, vec!["db", "web", "api"]);

    let persisted = ResourceSpec::from_yaml(&harness.store.object(SPEC_PATH).unwrap()).unwrap();
    assert_eq!(persisted, web_spec(app()));
    assert!(!harness.store.is_locked(LOCK_KEY));
}

#[test]
fn test_render_values_carry_platform_globals() {
    let harness = TestHarness::new();
    let mut spec = web_spec(app());
    spec.global = Some(json!({"tier": "premium"}));
    harness.apply(RESOURCE, spec, stack());

    let values = harness.templater.rendered_values();
    assert_eq!(values.len(), 1);
    let global = &values[0]["global"];
    assert_eq!(global["namespace"], "prod");
    assert_eq!(global["cluster"], "test");
    assert_eq!(global["name"], "shop");
    assert_eq!(global["domain"], "example.test");
    assert_eq!(global["tier"], "premium");
    assert!(global["ts"].is_i64());
    assert_eq!(values[0]["app"], app());
}

#[test]
fn test_unchanged_rollout_skips_everything() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());
    let applied_before = harness.cluster.applied().len();

    let report = harness.apply(RESOURCE, web_spec(app()), stack());

    assert!(report.applied.is_empty());
    assert_eq!(
        report.skipped,
        vec!["StatefulSet-db---0", "Service-web", "Deployment-api"]
    );
    assert_eq!(harness.cluster.applied().len(), applied_before);
}

#[test]
fn test_only_changed_items_are_applied() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let report = harness.apply(
        RESOURCE,
        web_spec(app()),
        vec![
            statefulset("db").build(),
            service("web"),
            deployment("api", "registry.example/api:2", 3),
        ],
    );

    assert_eq!(report.applied, vec!["Deployment-api"]);
    assert!(!report.rotated);
}

#[test]
fn test_dropped_items_are_removed() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let report = harness.apply(RESOURCE, web_spec(app()), vec![statefulset("db").build()]);

    assert_eq!(report.removed, vec!["Service/web", "Deployment/api"]);
    assert!(!harness.cluster.contains("prod", "Service", "web"));
    assert_eq!(harness.release("prod", "shop").len(), 1);
}

#[test]
fn test_persisted_spec_is_reused() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let mut session = harness.session(RESOURCE);
    let outcome = harness.orchestrator.rollout(&mut session, None).unwrap();
    match outcome {
        RolloutOutcome::Applied(report) => assert!(report.applied.is_empty()),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_invalid_values_are_rejected_before_anything_changes() {
    let harness = TestHarness::new();
    let err = harness
        .rollout(RESOURCE, web_spec(json!({"replicas": "3"})), stack())
        .unwrap_err();

    match err {
        ForemanError::Operation { action, resource, source } => {
            assert_eq!(action, "roll out");
            assert_eq!(resource, RESOURCE);
            assert!(matches!(*source, ForemanError::SchemaViolation { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(harness.store.object(SPEC_PATH).is_none());
    assert!(harness.cluster.applied().is_empty());
    assert!(!harness.store.is_locked(LOCK_KEY));
}

#[test]
fn test_spec_without_asset_is_invalid() {
    let harness = TestHarness::new();
    let spec = ResourceSpec {
        app: app(),
        ..ResourceSpec::default()
    };
    let mut session = harness.session(RESOURCE);
    let err = harness
        .orchestrator
        .rollout(&mut session, Some(spec))
        .unwrap_err();
    assert!(err.to_string().contains("missing asset"));
}

#[test]
fn test_unknown_asset_names_the_strategy_failure() {
    let harness = TestHarness::new();
    let spec = ResourceSpec::new(foreman::AssetRef::new("web", "9.9.9"), app());
    let mut session = harness.session_with(RESOURCE, harness.options().with_dry_run(true));
    let err = harness
        .orchestrator
        .rollout(&mut session, Some(spec))
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("web/9.9.9"));
}

// ============================================================================
// Dry run
// ============================================================================

#[test]
fn test_dry_run_without_release_is_empty() {
    let harness = TestHarness::new();
    let outcome = harness
        .rollout_with(
            RESOURCE,
            harness.options().with_dry_run(true),
            web_spec(app()),
            stack(),
        )
        .unwrap();

    assert_eq!(outcome, RolloutOutcome::DryRun { diff: String::new() });
    assert!(harness.cluster.applied().is_empty());
    assert!(harness.store.object(SPEC_PATH).is_none());
}

#[test]
fn test_dry_run_shows_diff_and_changes_nothing() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());
    let applied_before = harness.cluster.applied();
    let spec_before = harness.store.object(SPEC_PATH);

    let outcome = harness
        .rollout_with(
            RESOURCE,
            harness.options().with_dry_run(true),
            web_spec(json!({"image": "registry.example/shop:2"})),
            vec![
                statefulset("db").build(),
                service("web"),
                deployment("api", "registry.example/api:2", 3),
            ],
        )
        .unwrap();

    let RolloutOutcome::DryRun { diff } = outcome else {
        panic!("expected a dry run");
    };
    let changed = |sign: char, image: &str| {
        diff.lines()
            .any(|line| line.starts_with(sign) && line.contains(image))
    };
    assert!(diff.starts_with("--- release"));
    assert!(changed('-', "registry.example/api:1"));
    assert!(changed('+', "registry.example/api:2"));
    assert_eq!(harness.cluster.applied(), applied_before);
    assert_eq!(harness.store.object(SPEC_PATH), spec_before);
}

// ============================================================================
// Removal persistence
// ============================================================================

#[test]
fn test_failed_removal_stays_in_release() {
    let harness = TestHarness::new();
    let mut manifest = stack();
    manifest.push(config_map("settings", json!({"mode": "fast"})));
    harness.apply(RESOURCE, web_spec(app()), manifest);
    harness.cluster.fail_delete("ConfigMap", "settings");

    let report = harness.apply(RESOURCE, web_spec(app()), stack());
    assert_eq!(report.failed_removals, vec!["ConfigMap/settings"]);
    assert!(harness
        .release("prod", "shop")
        .iter()
        .any(|item| item.kind == "ConfigMap" && item.name() == "settings"));

    // The next run finds it in the prior release and tries again.
    let report = harness.apply(RESOURCE, web_spec(app()), stack());
    assert_eq!(report.failed_removals, vec!["ConfigMap/settings"]);
    let release = harness.release("prod", "shop");
    assert_eq!(
        release.iter().filter(|item| item.name() == "settings").count(),
        1
    );
}

#[test]
fn test_prune_drops_failed_removals() {
    let harness = TestHarness::new();
    let mut manifest = stack();
    manifest.push(config_map("settings", json!({"mode": "fast"})));
    harness.apply(RESOURCE, web_spec(app()), manifest);
    harness.cluster.fail_delete("ConfigMap", "settings");

    let outcome = harness
        .rollout_with(
            RESOURCE,
            harness.options().with_prune(true),
            web_spec(app()),
            stack(),
        )
        .unwrap();
    let RolloutOutcome::Applied(report) = outcome else {
        panic!("expected an applied rollout");
    };
    assert_eq!(report.failed_removals, vec!["ConfigMap/settings"]);
    assert!(!harness
        .release("prod", "shop")
        .iter()
        .any(|item| item.name() == "settings"));
}

#[test]
fn test_failed_instance_removal_is_retried() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), vec![statefulset("db").build()]);
    harness.cluster.fail_delete("StatefulSet", "db---0");

    let report = harness.apply(
        RESOURCE,
        web_spec(app()),
        vec![statefulset("db").service_name("db-v2").build()],
    );
    assert!(report.rotated);
    assert_eq!(report.failed_removals, vec!["StatefulSet/db---0"]);
    let release = harness.release("prod", "shop");
    let names: Vec<&str> = release.iter().map(|item| item.name()).collect();
    assert_eq!(names, vec!["db", "db---0"]);

    let report = harness.apply(
        RESOURCE,
        web_spec(app()),
        vec![statefulset("db").service_name("db-v2").build()],
    );
    assert!(!report.rotated);
    assert_eq!(report.failed_removals, vec!["StatefulSet/db---0"]);
    assert_eq!(harness.statefulsets("prod"), vec!["db---0", "db---1"]);
}

// ============================================================================
// Readiness and deadlines
// ============================================================================

#[test]
fn test_rotation_times_out_when_never_ready() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), vec![statefulset("db").build()]);
    let release_before = harness.releases.raw("prod", "shop");
    harness.cluster.set_ready("StatefulSet", "db---1", 0);

    let options = harness
        .options()
        .with_wait(Wait::Within(Duration::from_millis(50)));
    let err = harness
        .rollout_with(
            RESOURCE,
            options,
            web_spec(app()),
            vec![statefulset("db").service_name("db-v2").build()],
        )
        .unwrap_err();

    match err {
        ForemanError::Operation { source, .. } => {
            assert!(matches!(*source, ForemanError::Timeout { .. }))
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(harness.releases.raw("prod", "shop"), release_before);
    assert!(!harness.store.is_locked(LOCK_KEY));
}

#[test]
fn test_wait_is_skipped_without_rotation() {
    let harness = TestHarness::new();
    harness.cluster.set_ready("Deployment", "api", 0);

    let options = harness
        .options()
        .with_wait(Wait::Within(Duration::from_millis(50)));
    let outcome = harness
        .rollout_with(RESOURCE, options, web_spec(app()), stack())
        .unwrap();
    assert!(matches!(outcome, RolloutOutcome::Applied(_)));
}

#[test]
fn test_rotation_waits_for_readiness() {
    let harness = TestHarness::new();
    harness.apply(
        RESOURCE,
        web_spec(app()),
        vec![statefulset("db").replicas(5).build()],
    );
    // Readiness targets are capped at two pods.
    harness.cluster.set_ready("StatefulSet", "db---1", 2);

    let options = harness
        .options()
        .with_wait(Wait::Within(Duration::from_secs(5)));
    let outcome = harness
        .rollout_with(
            RESOURCE,
            options,
            web_spec(app()),
            vec![statefulset("db").replicas(5).service_name("db-v2").build()],
        )
        .unwrap();
    let RolloutOutcome::Applied(report) = outcome else {
        panic!("expected an applied rollout");
    };
    assert!(report.rotated);
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn test_rollout_waits_for_foreign_lock() {
    let harness = TestHarness::new();
    harness.store.hold_lock(LOCK_KEY, Duration::from_millis(60));

    harness.apply(RESOURCE, web_spec(app()), stack());

    assert!(harness.store.lock_calls() > 2);
    assert!(!harness.store.is_locked(LOCK_KEY));
}

#[test]
fn test_nested_locking_takes_store_lock_once() {
    let harness = TestHarness::new();
    let session = harness.session(RESOURCE);
    let calls_before = harness.store.lock_calls();

    let outer = session.lock().unwrap();
    let inner = session.lock().unwrap();
    assert_eq!(harness.store.lock_calls(), calls_before + 1);
    drop(inner);
    assert!(harness.store.is_locked(LOCK_KEY));
    drop(outer);
    assert!(!harness.store.is_locked(LOCK_KEY));
}

#[test]
fn test_teardown_releases_held_lock() {
    let harness = TestHarness::new();
    let session = harness.session(RESOURCE);
    let guard = session.lock().unwrap();
    std::mem::forget(guard);
    assert!(harness.store.is_locked(LOCK_KEY));

    assert!(session.teardown());
    assert!(!harness.store.is_locked(LOCK_KEY));
    assert!(!session.teardown());
}

#[test]
fn test_asset_is_fetched_once_per_cache() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());
    harness.apply(RESOURCE, web_spec(app()), stack());
    harness.apply("staging/shop", web_spec(app()), stack());

    assert_eq!(harness.store.fetch_calls(), 1);
}

// ============================================================================
// Status
// ============================================================================

#[test]
fn test_status_reports_rotations() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let mut session = harness.session(RESOURCE);
    let status = harness.orchestrator.status(&mut session);
    assert_eq!(
        status,
        Status::Deployed {
            rotations: [("db".to_string(), 0)].into_iter().collect()
        }
    );

    harness.apply(
        RESOURCE,
        web_spec(app()),
        vec![
            statefulset("db").service_name("db-v2").build(),
            service("web"),
            deployment("api", "registry.example/api:1", 3),
        ],
    );
    let status = harness.orchestrator.status(&mut session);
    assert_eq!(
        serde_json::to_value(&status).unwrap(),
        json!({"status": "deployed", "rotations": {"db": 1}})
    );
}

#[test]
fn test_status_of_unknown_resource() {
    let harness = TestHarness::new();
    let mut session = harness.session("prod/ghost");
    let status = harness.orchestrator.status(&mut session);
    assert!(matches!(status, Status::NotFound { .. }));
}

// ============================================================================
// Uninstall
// ============================================================================

#[test]
fn test_uninstall_deletes_everything() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let mut session = harness.session(RESOURCE);
    let report = harness.orchestrator.uninstall(&mut session).unwrap();

    assert_eq!(
        report.deleted,
        vec!["StatefulSet/db---0", "Service/web", "Deployment/api"]
    );
    assert!(report.failed.is_empty());
    assert!(harness.cluster.names("prod", "StatefulSet").is_empty());
    assert!(!harness.releases.contains("prod", "shop"));
    assert!(matches!(
        harness.orchestrator.status(&mut session),
        Status::NotFound { .. }
    ));
}

#[test]
fn test_uninstall_removes_every_instance() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), vec![statefulset("db").build()]);
    harness.cluster.insert(
        "prod",
        foreman::strategy::rename_instance(statefulset("db").build(), "db---3"),
    );

    let mut session = harness.session(RESOURCE);
    let report = harness.orchestrator.uninstall(&mut session).unwrap();

    assert_eq!(report.deleted, vec!["StatefulSet/db---0", "StatefulSet/db---3"]);
    assert!(harness.statefulsets("prod").is_empty());
}

#[test]
fn test_uninstall_keeps_going_after_failures() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());
    harness.cluster.fail_delete("Service", "web");

    let mut session = harness.session(RESOURCE);
    let report = harness.orchestrator.uninstall(&mut session).unwrap();

    assert_eq!(report.failed, vec!["Service/web"]);
    assert_eq!(report.deleted, vec!["StatefulSet/db---0", "Deployment/api"]);
}

#[test]
fn test_uninstall_dry_run_changes_nothing() {
    let harness = TestHarness::new();
    harness.apply(RESOURCE, web_spec(app()), stack());

    let mut session = harness.session_with(RESOURCE, harness.options().with_dry_run(true));
    let report = harness.orchestrator.uninstall(&mut session).unwrap();

    assert!(report.dry_run);
    assert!(harness.cluster.deleted().is_empty());
    assert!(harness.releases.contains("prod", "shop"));
}

#[test]
fn test_uninstall_without_release_fails() {
    let harness = TestHarness::new();
    let mut session = harness.session("prod/ghost");
    let err = harness.orchestrator.uninstall(&mut session).unwrap_err();
    assert!(err.is_not_found());
}
