//! Reconciliation loops driven through the control plane under a paused clock.

mod common;

use std::time::Duration;

use converge::{ResourceKey, SyncTrigger};
use serde_json::json;

use common::*;

fn service_a() -> ResourceKey {
    ResourceKey::new("Deployment", Some(NAMESPACE), "service-a")
}

fn live_replicas(h: &TestHarness) -> serde_json::Value {
    h.runtime.get(&service_a()).unwrap().content["spec"]["replicas"].clone()
}

#[tokio::test(start_paused = true)]
async fn test_self_heal_restores_scaled_down_workload() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register(
            "platform",
            ApplicationBuilder::new().automated().self_heal().build(),
        )
        .unwrap();
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;

    h.runtime.edit(&service_a(), |object| {
        object.content.insert("spec".into(), json!({ "replicas": 1 }));
    });
    for _ in 0..100 {
        if live_replicas(&h) == json!(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(live_replicas(&h), json!(3));

    let history = h.control.history("platform", 10).unwrap();
    assert_eq!(history[0].trigger, SyncTrigger::SelfHeal);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_drift_is_left_alone_without_self_heal() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register("platform", ApplicationBuilder::new().automated().build())
        .unwrap();
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;

    h.runtime.edit(&service_a(), |object| {
        object.content.insert("spec".into(), json!({ "replicas": 1 }));
    });
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(live_replicas(&h), json!(1));
    assert_eq!(h.control.history("platform", 10).unwrap().len(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_webhooks_sync_once() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register(
            "platform",
            ApplicationBuilder::new().automated().poll_interval(3600).build(),
        )
        .unwrap();
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;

    let next = h.commit(&[("deploy/service-a.yaml", deployment("service-a", 4))]);
    for _ in 0..3 {
        assert_eq!(h.control.notify_webhook(REPO, "main").unwrap(), vec!["platform"]);
    }
    h.eventually("platform", |a| {
        a.status.last_synced_revision.as_deref() == Some(next.as_str())
    })
    .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let history = h.control.history("platform", 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].revision, next);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_picks_up_new_revision() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register(
            "platform",
            ApplicationBuilder::new().automated().poll_interval(5).build(),
        )
        .unwrap();
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;

    let next = h.commit(&[("deploy/service-a.yaml", deployment("service-a", 5))]);
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.eventually("platform", |a| {
        a.status.last_synced_revision.as_deref() == Some(next.as_str())
    })
    .await;
    assert_eq!(live_replicas(&h), json!(5));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_policy_ignores_webhooks() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register("platform", ApplicationBuilder::new().build())
        .unwrap();

    h.control.notify_webhook(REPO, "main").unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.runtime.apply_calls(), 0);
    assert!(h.app("platform").status.last_synced_revision.is_none());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_resumes_stored_applications() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.store("platform", ApplicationBuilder::new().automated().build());
    h.store("billing", ApplicationBuilder::new().path("billing").build());

    assert_eq!(h.control.controller().start().unwrap(), 2);
    assert!(h.control.controller().is_running("billing"));
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;
    h.shutdown().await;
    assert!(!h.control.controller().is_running("platform"));
}

#[tokio::test(start_paused = true)]
async fn test_deregister_with_prune_removes_resources() {
    let h = TestHarness::new();
    h.commit(&[("deploy/service-a.yaml", deployment("service-a", 3))]);
    h.control
        .register("platform", ApplicationBuilder::new().automated().build())
        .unwrap();
    h.eventually("platform", |a| a.status.last_synced_revision.is_some())
        .await;

    let pruned = h.control.deregister("platform", true).await.unwrap().unwrap();
    assert_eq!(pruned.trigger, SyncTrigger::Prune);
    assert!(h.runtime.get(&service_a()).is_none());
    assert!(h.control.status("platform").is_err());
    assert!(h.control.list().unwrap().is_empty());
}
