//! Delta reconciliation.
//!
//! Each cycle sends the backend the node and deployment ids currently cached
//! together with the seconds elapsed since the last successful cycle. The
//! reply names entities that changed and entities that were deleted:
//!
//! ```text
//!   PUT /api/status/active?age=N  {nodes: [...], deployments: [...]}
//!        │
//!        ▼
//!   {changed: {nodes: [7]}, deleted: {deployments: [3]}}
//!        │                         │
//!        ▼                         ▼
//!   queue fetch node/7      remove deployment/3 + its nodes and node_roles
//! ```
//!
//! Deletions are applied before the queue starts draining.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ActiveRequest, ActiveSummary, Backend};
use crate::entity::{EntityKey, EntityKind};
use crate::queue::{FetchQueue, FetchTask};
use crate::store::EntityStore;

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Whether the summary request succeeded.
    pub summary_ok: bool,
    /// Age sent with the request, in seconds.
    pub age_secs: u64,
    /// Fetch tasks queued for changed entities.
    pub queued: usize,
    /// Entities removed, including cascaded children.
    pub removed: Vec<EntityKey>,
    /// Collection names in the summary that matched no known kind.
    pub unknown_types: Vec<String>,
    /// Queue length recorded as the batch size.
    pub batch_len: usize,
}

/// Tracks the last successful summary and applies deltas.
#[derive(Debug)]
pub struct Reconciler {
    last_update: Mutex<Instant>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    /// Start with the last update set to now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Mark the cache as current.
    pub fn touch(&self) {
        *self.last_update.lock() = Instant::now();
    }

    /// Time since the cache was last marked current.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.last_update.lock().elapsed()
    }

    /// Seconds since the last update, rounded up.
    #[must_use]
    pub fn age_secs(&self) -> u64 {
        ceil_secs(self.elapsed())
    }

    /// Run one cycle: request the summary, apply it, record the batch size.
    ///
    /// A failed summary is logged and leaves the store and queue untouched.
    /// The caller drains the queue either way.
    pub async fn reconcile<B: Backend>(
        &self,
        backend: &B,
        store: &EntityStore,
        queue: &FetchQueue,
    ) -> ReconcileReport {
        let age_secs = self.age_secs();
        let request = ActiveRequest {
            nodes: store.ids(EntityKind::Node),
            deployments: store.ids(EntityKind::Deployment),
        };
        debug!(
            age_secs,
            nodes = request.nodes.len(),
            deployments = request.deployments.len(),
            "requesting active summary"
        );

        let mut report = match backend.active_summary(age_secs, &request).await {
            Ok(summary) => {
                self.touch();
                apply_summary(&summary, store, queue)
            }
            Err(e) => {
                warn!(error = %e, "active summary failed");
                ReconcileReport::default()
            }
        };

        report.age_secs = age_secs;
        report.batch_len = queue.mark_batch();
        report
    }
}

/// Queue fetches for changed entities and remove deleted ones.
pub fn apply_summary(
    summary: &ActiveSummary,
    store: &EntityStore,
    queue: &FetchQueue,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        summary_ok: true,
        ..ReconcileReport::default()
    };

    for (collection, ids) in &summary.changed {
        let Ok(kind) = EntityKind::from_collection(collection) else {
            warn!(collection = %collection, "ignoring changes for unknown type");
            report.unknown_types.push(collection.clone());
            continue;
        };
        for id in ids {
            queue.enqueue(FetchTask::entity(kind, *id));
            report.queued += 1;
        }
    }

    for (collection, ids) in &summary.deleted {
        let kind = match EntityKind::from_collection(collection) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(collection = %collection, error = %e, "ignoring deletions for unknown type");
                report.unknown_types.push(collection.clone());
                continue;
            }
        };
        for id in ids {
            let removed = store.remove_cascading(kind, *id);
            if removed.is_empty() {
                debug!(%kind, %id, "deleted entity was not cached");
            }
            report.removed.extend(removed);
        }
    }

    if report.queued > 0 || !report.removed.is_empty() {
        info!(
            queued = report.queued,
            removed = report.removed.len(),
            "applied active summary"
        );
    }
    report
}

fn ceil_secs(elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs();
    if elapsed.subsec_nanos() > 0 { secs + 1 } else { secs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use test_case::test_case;

    use crate::entity::{Entity, EntityId};
    use crate::error::{SyncError, SyncResult};
    use crate::notify::ChangeNotifier;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(ChangeNotifier::new()))
    }

    fn put(store: &EntityStore, kind: EntityKind, raw: Value) {
        store.set(Entity::ingest(kind, raw).unwrap());
    }

    fn to_map(entries: &[(&str, &[i64])]) -> BTreeMap<String, Vec<EntityId>> {
        entries
            .iter()
            .map(|(k, ids)| ((*k).to_string(), ids.iter().copied().map(EntityId).collect()))
            .collect()
    }

    fn summary(changed: &[(&str, &[i64])], deleted: &[(&str, &[i64])]) -> ActiveSummary {
        ActiveSummary {
            changed: to_map(changed),
            deleted: to_map(deleted),
        }
    }

    struct SummaryBackend {
        reply: SyncResult<ActiveSummary>,
        seen: Mutex<Vec<(u64, ActiveRequest)>>,
    }

    #[async_trait]
    impl Backend for SummaryBackend {
        async fn fetch_collection(&self, _kind: EntityKind) -> SyncResult<Vec<Value>> {
            Ok(Vec::new())
        }

        async fn fetch_entity(&self, _kind: EntityKind, id: EntityId) -> SyncResult<Value> {
            Err(SyncError::NotFound(id.to_string()))
        }

        async fn active_summary(
            &self,
            age_secs: u64,
            request: &ActiveRequest,
        ) -> SyncResult<ActiveSummary> {
            self.seen.lock().push((age_secs, request.clone()));
            match &self.reply {
                Ok(summary) => Ok(summary.clone()),
                Err(_) => Err(SyncError::Transport("connection refused".to_string())),
            }
        }

        async fn get_json(&self, path: &str) -> SyncResult<Value> {
            Err(SyncError::NotFound(path.to_string()))
        }

        async fn post_json(&self, path: &str, _body: &Value) -> SyncResult<Value> {
            Err(SyncError::NotFound(path.to_string()))
        }
    }

    #[test_case(Duration::ZERO, 0)]
    #[test_case(Duration::from_millis(1), 1)]
    #[test_case(Duration::from_secs(15), 15)]
    #[test_case(Duration::from_millis(15_001), 16)]
    fn test_ceil_secs(elapsed: Duration, expected: u64) {
        assert_eq!(ceil_secs(elapsed), expected);
    }

    #[test]
    fn test_changed_node_queued_and_deployment_cascaded() {
        let store = store();
        put(&store, EntityKind::Deployment, json!({"id": 3, "name": "lab"}));
        put(&store, EntityKind::Node, json!({"id": 1, "deployment_id": 3}));
        put(&store, EntityKind::Node, json!({"id": 2, "deployment_id": 1}));
        put(&store, EntityKind::NodeRole, json!({"id": 5, "deployment_id": 3}));
        let queue = FetchQueue::new();

        let report = apply_summary(
            &summary(&[("nodes", &[7])], &[("deployments", &[3])]),
            &store,
            &queue,
        );

        assert_eq!(queue.snapshot(), vec![FetchTask::entity(EntityKind::Node, EntityId(7))]);
        assert_eq!(report.queued, 1);
        assert!(!store.contains(EntityKind::Deployment, EntityId(3)));
        assert!(!store.contains(EntityKind::Node, EntityId(1)));
        assert!(!store.contains(EntityKind::NodeRole, EntityId(5)));
        assert!(store.contains(EntityKind::Node, EntityId(2)));
        assert_eq!(report.removed.len(), 3);
    }

    #[test]
    fn test_unknown_types_skipped() {
        let store = store();
        let queue = FetchQueue::new();

        let report = apply_summary(
            &summary(&[("widgets", &[1]), ("roles", &[2])], &[("gadgets", &[3])]),
            &store,
            &queue,
        );

        assert_eq!(queue.snapshot(), vec![FetchTask::entity(EntityKind::Role, EntityId(2))]);
        assert_eq!(report.unknown_types, vec!["widgets".to_string(), "gadgets".to_string()]);
    }

    #[test]
    fn test_deleting_uncached_entity_is_harmless() {
        let store = store();
        let queue = FetchQueue::new();

        let report = apply_summary(&summary(&[], &[("nodes", &[42])]), &store, &queue);

        assert!(report.summary_ok);
        assert!(report.removed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_sends_cached_ids_and_age() {
        let store = store();
        put(&store, EntityKind::Node, json!({"id": 4}));
        put(&store, EntityKind::Node, json!({"id": 2}));
        put(&store, EntityKind::Deployment, json!({"id": 1}));
        let queue = FetchQueue::new();
        let backend = SummaryBackend {
            reply: Ok(summary(&[("nodes", &[9])], &[])),
            seen: Mutex::new(Vec::new()),
        };
        let reconciler = Reconciler::new();

        tokio::time::advance(Duration::from_millis(2_500)).await;
        let report = reconciler.reconcile(&backend, &store, &queue).await;

        let seen = backend.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 3);
        assert_eq!(seen[0].1.nodes, vec![EntityId(2), EntityId(4)]);
        assert_eq!(seen[0].1.deployments, vec![EntityId(1)]);
        assert_eq!(report.age_secs, 3);
        assert_eq!(report.batch_len, 1);
        assert_eq!(reconciler.age_secs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_summary_keeps_age_running() {
        let store = store();
        let queue = FetchQueue::new();
        let backend = SummaryBackend {
            reply: Err(SyncError::Transport(String::new())),
            seen: Mutex::new(Vec::new()),
        };
        let reconciler = Reconciler::new();

        tokio::time::advance(Duration::from_secs(10)).await;
        let report = reconciler.reconcile(&backend, &store, &queue).await;

        assert!(!report.summary_ok);
        assert_eq!(report.batch_len, 0);
        assert!(queue.is_empty());
        assert_eq!(reconciler.age_secs(), 10);
    }
}
