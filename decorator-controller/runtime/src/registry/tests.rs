use super::*;
use crate::{
    controller::Config,
    core::Backoff,
    metrics::Metrics,
    test_util::{decorator, eventually, parent, spec, FakeCluster, FakeHook},
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time;

fn registry(cluster: &Arc<FakeCluster>, selector: &str) -> Registry {
    let ctx = Context {
        cluster: cluster.clone(),
        hook: FakeHook::child_per_parent(),
        config: Config {
            workers: 1,
            default_resync: Duration::from_secs(600),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        },
        metrics: Metrics::default(),
    };
    Registry::new(ctx, selector.parse().expect("valid selector"))
}

fn target_parent() -> crate::k8s::DynamicObject {
    parent(
        "p1",
        &[],
        json!({"selector": {"matchLabels": {"test": "test-target"}}}),
    )
}

/// Decorates `clusterparents` with `configmaps`, so that its watches are
/// distinguishable from the default spec's.
fn other_spec() -> serde_json::Value {
    json!({
        "resources": [{"apiVersion": "example.com/v1", "resource": "clusterparents"}],
        "attachments": [{"apiVersion": "v1", "resource": "configmaps"}],
        "hooks": {"sync": {"webhook": {"url": "http://hook.test/sync"}}},
    })
}

#[tokio::test]
async fn runs_definitions_matching_target_selector() {
    let cluster = FakeCluster::new();
    cluster.insert(target_parent());
    let registry = registry(&cluster, "foo=bar");

    registry
        .apply(decorator("dc-target", &[("foo", "bar")], spec()))
        .await;
    eventually("child of p1", || {
        cluster.get_object("children", Some("ns"), "p1").is_some()
    })
    .await;
    assert_eq!(registry.running(), vec!["dc-target"]);

    let c = cluster.get_object("children", Some("ns"), "p1").unwrap();
    assert_eq!(
        c.labels().get(crate::k8s::CONTROLLER_LABEL).map(String::as_str),
        Some("dc-target")
    );
}

#[tokio::test]
async fn ignores_definitions_outside_target_selector() {
    let cluster = FakeCluster::new();
    cluster.insert(target_parent());
    let registry = registry(&cluster, "foo=bar");

    registry
        .apply(decorator("dc-other", &[("baz", "caz")], other_spec()))
        .await;
    assert!(!registry.is_running("dc-other"));

    let wait = time::timeout(
        Duration::from_millis(200),
        eventually("a configmap", || !cluster.objects("configmaps").is_empty()),
    )
    .await;
    assert!(wait.is_err(), "no attachment may be created");
    assert!(cluster.resolved().is_empty(), "{:?}", cluster.resolved());
    assert!(cluster.watched().is_empty(), "{:?}", cluster.watched());
}

#[tokio::test]
async fn shards_by_labels() {
    let cluster = FakeCluster::new();
    let registry = registry(&cluster, "foo=bar");

    registry
        .apply(decorator("dc-target", &[("foo", "bar")], spec()))
        .await;
    registry
        .apply(decorator("dc-other", &[("baz", "caz")], other_spec()))
        .await;
    assert_eq!(registry.running(), vec!["dc-target"]);

    eventually("watches", || cluster.watched().len() == 2).await;
    let mut watched = cluster.watched();
    watched.sort();
    assert_eq!(watched, vec!["children", "parents"]);
}

#[tokio::test]
async fn relabeling_moves_definitions_between_shards() {
    let cluster = FakeCluster::new();
    let registry = registry(&cluster, "foo=bar");

    registry
        .apply(decorator("dc", &[("foo", "bar")], spec()))
        .await;
    assert!(registry.is_running("dc"));
    eventually("watches", || cluster.watched().len() == 2).await;

    registry
        .apply(decorator("dc", &[("baz", "caz")], spec()))
        .await;
    assert!(!registry.is_running("dc"));
    assert!(cluster.watched().is_empty(), "{:?}", cluster.watched());

    registry
        .apply(decorator("dc", &[("foo", "bar"), ("extra", "x")], spec()))
        .await;
    assert!(registry.is_running("dc"));
}

#[tokio::test]
async fn restarts_only_on_change() {
    let cluster = FakeCluster::new();
    let registry = registry(&cluster, "");

    registry.apply(decorator("dc", &[], spec())).await;
    eventually("resolution", || cluster.resolved().len() == 2).await;

    registry.apply(decorator("dc", &[], spec())).await;
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.resolved().len(), 2);

    let mut changed = spec();
    changed["resyncPeriodSeconds"] = json!(30);
    registry.apply(decorator("dc", &[], changed)).await;
    eventually("re-resolution", || cluster.resolved().len() == 4).await;
    assert_eq!(registry.running(), vec!["dc"]);
}

#[tokio::test]
async fn follows_definition_events() {
    let cluster = FakeCluster::new();
    let registry = registry(&cluster, "");

    let a = decorator("a", &[], spec());
    let b = decorator("b", &[], spec());
    let c = decorator("c", &[], spec());
    registry
        .run(stream::iter(vec![
            Event::Init,
            Event::InitApply(a.clone()),
            Event::InitApply(b.clone()),
            Event::InitDone,
            Event::Apply(c.clone()),
        ]))
        .await;
    assert_eq!(registry.running(), vec!["a", "b", "c"]);

    registry.run(stream::iter(vec![Event::Delete(c)])).await;
    assert_eq!(registry.running(), vec!["a", "b"]);

    // After a relist, definitions that were not listed are gone.
    registry
        .run(stream::iter(vec![
            Event::Init,
            Event::InitApply(a),
            Event::InitDone,
        ]))
        .await;
    assert_eq!(registry.running(), vec!["a"]);
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let cluster = FakeCluster::new();
    let registry = registry(&cluster, "");
    registry.apply(decorator("a", &[], spec())).await;
    registry.apply(decorator("b", &[], other_spec())).await;
    eventually("watches", || cluster.watched().len() == 4).await;

    registry.shutdown().await;
    assert!(registry.running().is_empty());
    assert!(cluster.watched().is_empty(), "{:?}", cluster.watched());
}
