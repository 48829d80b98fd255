//! Reconcile-and-drain cycles against a scripted backend.

mod helpers;

use std::sync::atomic::Ordering;

use claw_sync::{EntityId, EntityKey, EntityKind, FetchTask, SyncEvent, Topic};
use helpers::{Failure, counter, engine, nodes, seed};
use serde_json::json;

fn key(kind: EntityKind, id: i64) -> EntityKey {
    EntityKey::new(kind, EntityId(id))
}

#[tokio::test]
async fn test_changed_node_fetched_and_deployment_cascaded() {
    let engine = engine();
    seed(&engine, EntityKind::Deployment, json!({"id": 3, "name": "lab"}));
    seed(&engine, EntityKind::Deployment, json!({"id": 8, "name": "prod"}));
    seed(&engine, EntityKind::Node, json!({"id": 1, "deployment_id": 3}));
    seed(&engine, EntityKind::Node, json!({"id": 2, "deployment_id": 8}));
    seed(&engine, EntityKind::NodeRole, json!({"id": 5, "deployment_id": 3, "state": 0}));
    engine.backend().entity(
        EntityKind::Node,
        json!({"id": 7, "name": "n7", "alive": true, "state": 0}),
    );
    engine
        .backend()
        .push_summary(json!({"changed": {"nodes": [7]}, "deleted": {"deployments": [3]}}));

    let mut events = engine.notifier().events();
    let cycle = engine.reconcile().await;

    assert_eq!(cycle.reconcile.queued, 1);
    assert_eq!(cycle.reconcile.batch_len, 1);
    assert_eq!(
        cycle.reconcile.removed,
        vec![
            key(EntityKind::Deployment, 3),
            key(EntityKind::Node, 1),
            key(EntityKind::NodeRole, 5),
        ]
    );
    assert_eq!(cycle.drain.executed, 1);
    assert_eq!(cycle.drain.stored, 1);

    let store = engine.store();
    assert!(store.contains(EntityKind::Node, EntityId(7)));
    assert!(store.contains(EntityKind::Node, EntityId(2)));
    assert!(store.contains(EntityKind::Deployment, EntityId(8)));
    assert!(!store.contains(EntityKind::Deployment, EntityId(3)));
    assert!(!store.contains(EntityKind::Node, EntityId(1)));
    assert!(!store.contains(EntityKind::NodeRole, EntityId(5)));

    // Removals are announced before the queued fetch runs.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        order.push(event);
    }
    assert_eq!(
        order,
        vec![
            SyncEvent::EntityDone(key(EntityKind::Deployment, 3)),
            SyncEvent::EntityDone(key(EntityKind::Node, 1)),
            SyncEvent::EntityDone(key(EntityKind::NodeRole, 5)),
            SyncEvent::EntityDone(key(EntityKind::Node, 7)),
            SyncEvent::ReloadFinished,
        ]
    );
}

#[tokio::test]
async fn test_summary_carries_cached_ids() {
    let engine = engine();
    seed(&engine, EntityKind::Node, json!({"id": 4}));
    seed(&engine, EntityKind::Node, json!({"id": 2}));
    seed(&engine, EntityKind::Deployment, json!({"id": 1}));
    seed(&engine, EntityKind::Role, json!({"id": 9}));

    engine.reconcile().await;

    let requests = engine.backend().summary_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.nodes, vec![EntityId(2), EntityId(4)]);
    assert_eq!(requests[0].1.deployments, vec![EntityId(1)]);
}

#[tokio::test]
async fn test_unauthorized_fetch_keeps_entity_and_advances() {
    let engine = engine();
    seed(&engine, EntityKind::Node, json!({"id": 9, "name": "n9"}));
    engine.backend().fail_entity(EntityKind::Node, 9, Failure::Unauthorized);
    engine.backend().entity(EntityKind::Node, json!({"id": 10}));
    engine
        .backend()
        .push_summary(json!({"changed": {"nodes": [9, 10]}}));
    let done = engine.notifier().wait_for(Topic::Entity(key(EntityKind::Node, 9)));

    let cycle = engine.reconcile().await;

    assert_eq!(done.await, Some(SyncEvent::EntityDone(key(EntityKind::Node, 9))));
    assert_eq!(cycle.drain.unauthorized, 1);
    assert_eq!(cycle.drain.stored, 1);
    let cached = engine.store().get(EntityKind::Node, EntityId(9)).unwrap();
    assert_eq!(cached.name(), Some("n9"));
    assert!(engine.store().contains(EntityKind::Node, EntityId(10)));
}

#[tokio::test]
async fn test_unauthorized_fetch_of_unknown_entity_still_fires() {
    let engine = engine();
    engine.backend().fail_entity(EntityKind::Node, 9, Failure::Unauthorized);
    engine.backend().push_summary(json!({"changed": {"nodes": [9]}}));
    let fired = counter(&engine, Topic::Entity(key(EntityKind::Node, 9)));

    engine.reconcile().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!engine.store().contains(EntityKind::Node, EntityId(9)));
}

#[tokio::test]
async fn test_failed_fetch_evicts_and_advances() {
    let engine = engine();
    seed(&engine, EntityKind::Role, json!({"id": 4, "name": "dns-server"}));
    engine.backend().fail_entity(EntityKind::Role, 4, Failure::Server);
    engine.backend().entity(EntityKind::Node, json!({"id": 5}));
    engine
        .backend()
        .push_summary(json!({"changed": {"roles": [4], "nodes": [5]}}));
    let fired = counter(&engine, Topic::Entity(key(EntityKind::Role, 4)));

    let cycle = engine.reconcile().await;

    assert!(!engine.store().contains(EntityKind::Role, EntityId(4)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cycle.drain.evicted, 1);
    assert!(engine.store().contains(EntityKind::Node, EntityId(5)));
    assert!(engine.queue().is_empty());
}

#[tokio::test]
async fn test_failed_deployment_fetch_cascades() {
    let engine = engine();
    seed(&engine, EntityKind::Deployment, json!({"id": 3}));
    seed(&engine, EntityKind::Node, json!({"id": 1, "deployment_id": 3}));
    engine.backend().push_summary(json!({"changed": {"deployments": [3]}}));

    engine.reconcile().await;

    assert!(!engine.store().contains(EntityKind::Deployment, EntityId(3)));
    assert!(!engine.store().contains(EntityKind::Node, EntityId(1)));
}

#[tokio::test]
async fn test_refetching_same_payload_is_idempotent() {
    let engine = engine();
    engine
        .backend()
        .entity(EntityKind::Node, json!({"id": 7, "name": "n7.lab", "alive": true, "state": 2}));
    engine.backend().push_summary(json!({"changed": {"nodes": [7]}}));
    engine.backend().push_summary(json!({"changed": {"nodes": [7]}}));
    let fired = counter(&engine, Topic::Entity(key(EntityKind::Node, 7)));

    engine.reconcile().await;
    let first = engine.store().get(EntityKind::Node, EntityId(7)).unwrap();
    engine.reconcile().await;
    let second = engine.store().get(EntityKind::Node, EntityId(7)).unwrap();

    assert_eq!(*first, *second);
    assert_eq!(second.status(), Some("transition"));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(engine.store().len(EntityKind::Node), 1);
}

#[tokio::test]
async fn test_summary_failure_still_drains() {
    let engine = engine();
    engine.backend().entity(EntityKind::Network, json!({"id": 1, "name": "admin"}));
    engine.backend().push_summary_failure();
    engine
        .queue()
        .enqueue(FetchTask::entity(EntityKind::Network, EntityId(1)));
    let finished = engine.notifier().wait_for(Topic::ReloadFinished);

    let cycle = engine.reconcile().await;

    assert!(!cycle.reconcile.summary_ok);
    assert_eq!(cycle.drain.executed, 1);
    assert!(engine.store().contains(EntityKind::Network, EntityId(1)));
    assert_eq!(finished.await, Some(SyncEvent::ReloadFinished));
}

#[tokio::test]
async fn test_unknown_summary_types_ignored() {
    let engine = engine();
    engine
        .backend()
        .push_summary(json!({"changed": {"widgets": [1]}, "deleted": {"gizmos": [2]}}));

    let cycle = engine.reconcile().await;

    assert!(cycle.reconcile.summary_ok);
    assert_eq!(cycle.reconcile.queued, 0);
    assert_eq!(cycle.reconcile.unknown_types.len(), 2);
}

#[tokio::test]
async fn test_start_runs_full_sync_then_cycle() {
    let engine = engine();
    let backend = engine.backend();
    backend.collection(EntityKind::Node, nodes(1, 3));
    backend.collection(EntityKind::Deployment, vec![json!({"id": 1, "name": "system"})]);
    backend.collection(
        EntityKind::Barclamp,
        vec![json!({
            "id": 2,
            "name": "network",
            "cfg_data": {"wizard": {"version": 2, "name": "Networks"}}
        })],
    );
    backend.document("/health", json!({"Map": {"dhcp-mgmt-service": {}}}));
    backend.document("/dhcp/subnets", json!([{"name": "admin"}]));
    backend.collection(
        EntityKind::User,
        vec![json!({"id": 1, "username": "admin", "tenant_id": 1})],
    );
    backend.collection(EntityKind::Tenant, vec![json!({"id": 1, "name": "system"})]);
    backend.document("/api/v2/user_tenant_capabilities", json!([]));
    let deployments_loaded = engine
        .notifier()
        .wait_for(Topic::Collection(EntityKind::Deployment));

    let cycle = engine.start().await;

    assert_eq!(cycle.drain.executed, EntityKind::FULL_SYNC.len());
    assert_eq!(engine.store().len(EntityKind::Node), 3);
    assert_eq!(engine.store().len(EntityKind::Deployment), 1);
    assert_eq!(engine.store().len(EntityKind::User), 1);
    assert_eq!(engine.store().wizards().len(), 1);
    assert_eq!(
        deployments_loaded.await,
        Some(SyncEvent::CollectionDone(EntityKind::Deployment))
    );

    let features = engine.features();
    assert!(features.dhcp);
    assert!(!features.dns);
    assert_eq!(engine.auxiliary().dhcp_subnets, json!([{"name": "admin"}]));
    assert_eq!(engine.tenants().roots, vec![EntityId(1)]);

    let calls = backend.calls();
    let first_load = calls.iter().position(|c| c == "load nodes").unwrap();
    let summary = calls.iter().position(|c| c == "summary").unwrap();
    assert!(summary < first_load, "summary is sent before the queue drains: {calls:?}");
}

#[tokio::test]
async fn test_full_sync_loads_kinds_in_order() {
    let engine = engine();

    engine.full_sync().await;
    engine.drain().await;

    let loads: Vec<String> = engine
        .backend()
        .calls()
        .into_iter()
        .filter(|c| {
            c.starts_with("load ")
                && !c.ends_with("users")
                && !c.ends_with("tenants")
                && !c.ends_with("capabilities")
        })
        .collect();
    let expected: Vec<String> = EntityKind::FULL_SYNC
        .into_iter()
        .map(|kind| format!("load {}", kind.plural()))
        .collect();
    assert_eq!(loads, expected);
}
