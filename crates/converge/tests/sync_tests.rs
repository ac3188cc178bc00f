//! Sync engine properties: idempotence, safety, convergence, mutual exclusion
//! and prune gating.

mod common;

use std::time::Duration;

use converge::error::RuntimeError;
use converge::runtime::memory::FailureMode;
use converge::sync::{RecordStatus, SyncRequestOutcome};
use converge::{
    HealthStatus, PolicyOverride, ResourceKey, SyncOutcome, SyncPhase, SyncPolicy, SyncTrigger,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::*;

fn key(kind: &str, name: &str) -> ResourceKey {
    ResourceKey::new(kind, Some(NAMESPACE), name)
}

fn three_services(h: &TestHarness) -> String {
    h.commit(&[
        ("deploy/config.yaml", config_map("settings", "live")),
        (
            "deploy/services.yaml",
            documents(&[deployment("api", 2), deployment("worker", 1)]),
        ),
    ])
}

#[tokio::test]
async fn test_second_sync_is_all_noop() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());

    let first = h.sync("platform").await;
    assert_eq!(first.outcome, Some(SyncOutcome::Succeeded));
    assert_eq!(first.count(RecordStatus::Succeeded), 3);
    let applies = h.runtime.apply_calls();

    let second = h.sync("platform").await;
    assert_eq!(second.outcome, Some(SyncOutcome::Succeeded));
    assert_eq!(second.count(RecordStatus::NoOp), 3);
    assert_eq!(h.runtime.apply_calls(), applies);
    assert_eq!(h.runtime.delete_calls(), 0);
}

/// Live objects the application does not own.
struct ForeignCase {
    name: &'static str,
    object: fn() -> converge::ResourceDeclaration,
}

const FOREIGN_CASES: &[ForeignCase] = &[
    ForeignCase {
        name: "unlabelled object of a managed kind",
        object: || foreign("Deployment", "legacy"),
    },
    ForeignCase {
        name: "object owned by another application",
        object: || owned_by("billing", "Deployment", "invoices"),
    },
    ForeignCase {
        name: "unlabelled object of an unrelated kind",
        object: || foreign("Secret", "tls"),
    },
];

#[tokio::test]
async fn test_foreign_objects_are_never_deleted() {
    let policies = [
        SyncPolicy::default(),
        SyncPolicy {
            automated: false,
            prune: true,
            self_heal: false,
        },
        SyncPolicy {
            automated: true,
            prune: true,
            self_heal: true,
        },
    ];

    for case in FOREIGN_CASES {
        for policy in &policies {
            let h = TestHarness::new();
            three_services(&h);
            h.store("platform", ApplicationBuilder::new().policy(policy.clone()).build());
            let object = (case.object)();
            let foreign_key = object.key();
            h.runtime.insert(object);

            h.sync("platform").await;
            h.commit(&[("deploy/config.yaml", config_map("settings", "v2"))]);
            let op = h.sync("platform").await;

            assert!(
                h.runtime.get(&foreign_key).is_some(),
                "{} was deleted under {:?}",
                case.name,
                policy
            );
            assert!(
                op.records.iter().all(|r| r.key != foreign_key),
                "{} appeared in the sync records",
                case.name
            );
        }
    }
}

#[tokio::test]
async fn test_out_of_scope_objects_are_reported() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    h.runtime.insert(foreign("Deployment", "legacy"));

    let op = h.sync("platform").await;
    assert!(op.warnings.iter().any(|w| w.contains("Deployment/prod/legacy")));
}

#[tokio::test]
async fn test_converges_from_any_live_state() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().prune().build());
    h.sync("platform").await;

    // Drift one object, delete another and leave a stale owned one behind.
    h.runtime.edit(&key("Deployment", "api"), |object| {
        object.content.insert("spec".into(), json!({ "replicas": 7 }));
    });
    h.runtime.remove(&key("Deployment", "worker"));
    h.runtime.insert(owned_by("platform", "Deployment", "stale"));

    let op = h.sync("platform").await;
    assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
    assert!(h.runtime.get(&key("Deployment", "stale")).is_none());
    assert_eq!(
        h.runtime.get(&key("Deployment", "api")).unwrap().content["spec"]["replicas"],
        json!(2)
    );
    assert!(h.runtime.get(&key("Deployment", "worker")).is_some());

    let again = h.sync("platform").await;
    assert_eq!(again.count(RecordStatus::NoOp), 3);
    assert_eq!(again.records.len(), 3);
}

#[tokio::test]
async fn test_concurrent_requests_never_overlap() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    h.runtime.set_apply_delay(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        h.engine().request_sync("platform", SyncTrigger::Manual, &cancel),
        h.engine().request_sync("platform", SyncTrigger::Manual, &cancel),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SyncRequestOutcome::Completed(_)))
        .count();
    let coalesced = outcomes
        .iter()
        .filter(|o| matches!(o, SyncRequestOutcome::Coalesced { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(coalesced, 1);
    assert_eq!(h.runtime.max_concurrent_applies(), 1);
    assert_eq!(h.control.history("platform", 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_newer_revision_is_queued_behind_running_sync() {
    let h = TestHarness::new();
    let first = three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    h.runtime.set_apply_delay(Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let engine = h.engine();
    let running = engine.request_sync("platform", SyncTrigger::Manual, &cancel);
    let newer = async {
        // Let the first sync enter its apply phase before the next commit lands.
        while engine.in_flight("platform").is_none() {
            tokio::task::yield_now().await;
        }
        let next = h.commit(&[("deploy/config.yaml", config_map("settings", "v2"))]);
        let outcome = engine
            .request_sync("platform", SyncTrigger::Manual, &cancel)
            .await
            .unwrap();
        (next, outcome)
    };
    let (running, (next, queued)) = tokio::join!(running, newer);

    let SyncRequestOutcome::Completed(op) = running.unwrap() else {
        panic!("first request should run");
    };
    assert_eq!(op.revision, first);
    assert_eq!(queued, SyncRequestOutcome::Queued { revision: next.clone() });

    // The follow-up ran before the first request returned.
    let app = h.app("platform");
    assert_eq!(app.status.last_synced_revision.as_deref(), Some(next.as_str()));
    assert_eq!(h.control.history("platform", 10).unwrap().len(), 2);
    assert_eq!(h.runtime.max_concurrent_applies(), 1);
}

#[tokio::test]
async fn test_removed_resource_waits_for_prune() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    h.sync("platform").await;

    h.commit(&[
        ("deploy/config.yaml", config_map("settings", "live")),
        ("deploy/services.yaml", deployment("api", 2)),
    ]);
    let op = h.sync("platform").await;
    assert_eq!(op.count(RecordStatus::Skipped), 1);
    assert!(h.runtime.get(&key("Deployment", "worker")).is_some());
    assert_eq!(h.runtime.delete_calls(), 0);

    h.control
        .override_policy(
            "platform",
            &PolicyOverride {
                prune: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.sync("platform").await;
    assert!(h.runtime.get(&key("Deployment", "worker")).is_none());
    assert_eq!(h.runtime.delete_calls(), 1);
}

#[tokio::test]
async fn test_permanent_failure_partially_applies() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    let broken = key("Deployment", "worker");
    h.runtime.fail(
        broken.clone(),
        FailureMode::Always(RuntimeError::Forbidden {
            key: broken.clone(),
            message: "replicas must be positive".into(),
        }),
    );

    let op = h.sync("platform").await;
    assert_eq!(op.outcome, Some(SyncOutcome::PartiallyApplied));
    assert_eq!(op.count(RecordStatus::Succeeded), 2);
    assert_eq!(op.count(RecordStatus::Failed), 1);
    assert!(h.runtime.get(&key("Deployment", "api")).is_some());
    assert!(h.runtime.get(&broken).is_none());

    let app = h.app("platform");
    assert_eq!(app.status.health, HealthStatus::Degraded);
    assert_eq!(app.status.phase, SyncPhase::Idle);
    assert_eq!(app.status.last_outcome, Some(SyncOutcome::PartiallyApplied));
    assert!(app.status.last_synced_revision.is_none());
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());
    let flaky = key("Deployment", "api");
    h.runtime.fail(
        flaky.clone(),
        FailureMode::Times(1, RuntimeError::Unavailable("connection reset".into())),
    );

    let op = h.sync("platform").await;
    assert_eq!(op.outcome, Some(SyncOutcome::Succeeded));
    let record = op.records.iter().find(|r| r.key == flaky).unwrap();
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn test_automatic_sync_requires_automation() {
    let h = TestHarness::new();
    three_services(&h);
    h.store("platform", ApplicationBuilder::new().build());

    let result = h
        .engine()
        .request_sync("platform", SyncTrigger::NewRevision, &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(h.runtime.apply_calls(), 0);
    assert!(h.control.history("platform", 10).unwrap().is_empty());
}
