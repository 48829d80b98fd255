//! Test helpers for sync integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use claw_sync::{
    ActiveRequest, ActiveSummary, Backend, Entity, EntityId, EntityKind, SyncConfig, SyncEngine,
    SyncError, SyncResult, Topic,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// How a scripted entity fetch should fail.
#[derive(Debug, Clone)]
pub enum Failure {
    /// Backend answers with the `Unauthorized\n` body.
    Unauthorized,
    /// Any other server error.
    Server,
}

/// In-memory backend whose responses are set up by the test.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    entities: Mutex<HashMap<(EntityKind, EntityId), Result<Value, Failure>>>,
    collections: Mutex<HashMap<EntityKind, Vec<Value>>>,
    documents: Mutex<HashMap<String, Value>>,
    summaries: Mutex<VecDeque<SyncResult<ActiveSummary>>>,
    requests: Mutex<Vec<(u64, ActiveRequest)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, kind: EntityKind, raw: Value) {
        let id = EntityId(raw["id"].as_i64().unwrap());
        self.entities.lock().insert((kind, id), Ok(raw));
    }

    pub fn fail_entity(&self, kind: EntityKind, id: i64, failure: Failure) {
        self.entities.lock().insert((kind, EntityId(id)), Err(failure));
    }

    pub fn collection(&self, kind: EntityKind, items: Vec<Value>) {
        self.collections.lock().insert(kind, items);
    }

    pub fn document(&self, path: &str, body: Value) {
        self.documents.lock().insert(path.to_string(), body);
    }

    pub fn push_summary(&self, summary: Value) {
        let summary: ActiveSummary = serde_json::from_value(summary).unwrap();
        self.summaries.lock().push_back(Ok(summary));
    }

    pub fn push_summary_failure(&self) {
        self.summaries
            .lock()
            .push_back(Err(SyncError::Transport("connection reset".to_string())));
    }

    /// Every call made so far, e.g. `"fetch node/7"` or `"summary"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn summary_requests(&self) -> Vec<(u64, ActiveRequest)> {
        self.requests.lock().clone()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn fetch_collection(&self, kind: EntityKind) -> SyncResult<Vec<Value>> {
        self.log(format!("load {}", kind.plural()));
        Ok(self.collections.lock().get(&kind).cloned().unwrap_or_default())
    }

    async fn fetch_entity(&self, kind: EntityKind, id: EntityId) -> SyncResult<Value> {
        self.log(format!("fetch {kind}/{id}"));
        match self.entities.lock().get(&(kind, id)).cloned() {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(Failure::Unauthorized)) => {
                Err(SyncError::from_status(401, "Unauthorized\n".to_string()))
            }
            Some(Err(Failure::Server)) => {
                Err(SyncError::from_status(500, "internal error".to_string()))
            }
            None => Err(SyncError::from_status(404, "not found".to_string())),
        }
    }

    async fn active_summary(
        &self,
        age_secs: u64,
        request: &ActiveRequest,
    ) -> SyncResult<ActiveSummary> {
        self.log("summary".to_string());
        self.requests.lock().push((age_secs, request.clone()));
        self.summaries
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ActiveSummary::default()))
    }

    async fn get_json(&self, path: &str) -> SyncResult<Value> {
        self.log(format!("get {path}"));
        self.documents
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    async fn post_json(&self, path: &str, _body: &Value) -> SyncResult<Value> {
        self.log(format!("post {path}"));
        self.documents
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }
}

/// Engine over a fresh scripted backend with default config.
pub fn engine() -> SyncEngine<ScriptedBackend> {
    engine_with(SyncConfig::default())
}

/// Engine over a fresh scripted backend.
pub fn engine_with(config: SyncConfig) -> SyncEngine<ScriptedBackend> {
    SyncEngine::new(ScriptedBackend::new(), config).unwrap()
}

/// Put an entity straight into the engine's store.
pub fn seed(engine: &SyncEngine<ScriptedBackend>, kind: EntityKind, raw: Value) {
    engine.store().set(Entity::ingest(kind, raw).unwrap());
}

/// `count` nodes with ids starting at `first`.
pub fn nodes(first: i64, count: i64) -> Vec<Value> {
    (first..first + count)
        .map(|id| {
            json!({
                "id": id,
                "name": format!("node{id}.cluster.local"),
                "alive": true,
                "state": 0
            })
        })
        .collect()
}

/// Count how often a topic fires.
pub fn counter(engine: &SyncEngine<ScriptedBackend>, topic: Topic) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    engine.notifier().subscribe(topic, move |_| {
        inner.fetch_add(1, Ordering::SeqCst);
    });
    count
}
