//! The sync engine.
//!
//! [`SyncEngine`] ties the pieces together. It owns the store, the fetch
//! queue and the poll controller, executes queued fetches against a
//! [`Backend`], and runs the poll loop until shut down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::client::Backend;
use crate::config::SyncConfig;
use crate::entity::{Entity, EntityKey, EntityKind};
use crate::errlog::ErrorLog;
use crate::error::{SyncError, SyncResult};
use crate::features::{AuxiliaryData, FeatureFlags};
use crate::notify::{ChangeNotifier, SyncEvent};
use crate::poll::PollRateController;
use crate::queue::{DrainReport, FetchQueue, FetchTask, TaskExecutor, TaskOutcome};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::EntityStore;
use crate::tenants::TenantDirectory;

/// Collection endpoint barclamp uploads are posted to.
pub const BARCLAMPS_PATH: &str = "/api/v2/barclamps";

/// Result of one reconcile-and-drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// What the reconciler applied.
    pub reconcile: ReconcileReport,
    /// What the queue ran.
    pub drain: DrainReport,
}

/// Keeps a local [`EntityStore`] in step with a backend.
#[derive(Debug)]
pub struct SyncEngine<B> {
    backend: B,
    config: SyncConfig,
    notifier: Arc<ChangeNotifier>,
    store: Arc<EntityStore>,
    queue: FetchQueue,
    poll: PollRateController,
    reconciler: Reconciler,
    last_full_sync: Mutex<Instant>,
    features: RwLock<FeatureFlags>,
    auxiliary: RwLock<AuxiliaryData>,
    tenants: RwLock<TenantDirectory>,
    errors: ErrorLog,
}

impl<B: Backend> SyncEngine<B> {
    /// Create an engine with an empty store.
    pub fn new(backend: B, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let errors = match &config.error_log_dir {
            Some(dir) => ErrorLog::persistent(dir, config.max_error_entries),
            None => ErrorLog::in_memory(config.max_error_entries),
        };
        let notifier = Arc::new(ChangeNotifier::new());

        Ok(Self {
            backend,
            store: Arc::new(EntityStore::new(Arc::clone(&notifier))),
            notifier,
            queue: FetchQueue::new(),
            poll: PollRateController::new(config.poll),
            reconciler: Reconciler::new(),
            last_full_sync: Mutex::new(Instant::now()),
            features: RwLock::new(FeatureFlags::default()),
            auxiliary: RwLock::new(AuxiliaryData::default()),
            tenants: RwLock::new(TenantDirectory::default()),
            errors,
            config,
        })
    }

    /// The backend in use.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared handle to the entity cache.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Shared handle to the change notifier.
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// The fetch queue.
    pub fn queue(&self) -> &FetchQueue {
        &self.queue
    }

    /// The poll-rate controller.
    pub fn poll(&self) -> &PollRateController {
        &self.poll
    }

    /// The error log.
    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Optional subsystems found by the last full sync.
    pub fn features(&self) -> FeatureFlags {
        *self.features.read()
    }

    /// Data loaded from the optional subsystems.
    pub fn auxiliary(&self) -> AuxiliaryData {
        self.auxiliary.read().clone()
    }

    /// Tenant directory built by the last full sync.
    pub fn tenants(&self) -> TenantDirectory {
        self.tenants.read().clone()
    }

    /// Override the poll interval. Automatic adjustment stops for good.
    ///
    /// Returns whether the rate changed. A zero interval is rejected.
    pub fn set_poll_rate(&self, rate: Duration) -> SyncResult<bool> {
        if rate.is_zero() {
            return Err(SyncError::Config("poll rate must be greater than zero".to_string()));
        }
        info!(rate_secs = rate.as_secs(), "poll rate overridden");
        Ok(self.poll.set_rate(rate, true))
    }

    /// Queue a full reload of every collection and run the auxiliary loads.
    ///
    /// The collection fetches run on the next drain. Returns the number of
    /// tasks queued.
    pub async fn full_sync(&self) -> usize {
        self.reconciler.touch();
        *self.last_full_sync.lock() = Instant::now();
        let queued = bootstrap::plan_full_sync(&self.queue);

        let (flags, data) = bootstrap::load_features(&self.backend).await;
        *self.features.write() = flags;
        *self.auxiliary.write() = data;

        match bootstrap::load_tenants(&self.backend, &self.store).await {
            Ok(directory) => *self.tenants.write() = directory,
            Err(e) => warn!(error = %e, "tenant directory load failed"),
        }

        queued
    }

    /// Run the queue dry and announce when it is empty.
    pub async fn drain(&self) -> DrainReport {
        let report = self.queue.drain(self).await;
        if !report.skipped {
            self.notifier.publish(SyncEvent::ReloadFinished);
        }
        report
    }

    /// One reconciliation cycle followed by a drain.
    pub async fn reconcile(&self) -> CycleReport {
        let reconcile = self
            .reconciler
            .reconcile(&self.backend, &self.store, &self.queue)
            .await;
        let drain = self.drain().await;
        CycleReport { reconcile, drain }
    }

    /// Initial load: full sync, then a first cycle.
    pub async fn start(&self) -> CycleReport {
        info!(host = %self.config.host, "starting sync");
        self.full_sync().await;
        self.reconcile().await
    }

    /// Poll until `shutdown` resolves.
    ///
    /// Each tick waits for the current poll interval, queues a full sync once
    /// the resync interval has passed, then reconciles. A cycle already in
    /// progress finishes before shutdown is observed.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("sync loop stopping");
                    return;
                }
                wait = self.poll.wait_next() => {
                    debug!(?wait, rate_secs = self.poll.rate().as_secs(), "poll timer fired");
                }
            }

            if self.last_full_sync.lock().elapsed() >= self.config.full_sync_interval {
                self.full_sync().await;
            }
            let cycle = self.reconcile().await;
            debug!(
                queued = cycle.reconcile.queued,
                removed = cycle.reconcile.removed.len(),
                executed = cycle.drain.executed,
                "cycle complete"
            );
        }
    }

    /// Upload a barclamp definition, then refresh it and the role list.
    ///
    /// `config` must contain `barclamp.name`. Failures are recorded in the
    /// error log and announced as a notice.
    pub async fn save_barclamp(&self, mut config: Value) -> SyncResult<Arc<Entity>> {
        let Some(barclamp) = config.get_mut("barclamp").and_then(Value::as_object_mut) else {
            return Err(SyncError::Malformed {
                kind: EntityKind::Barclamp,
                reason: "missing barclamp section".to_string(),
            });
        };
        let name = barclamp
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::Malformed {
                kind: EntityKind::Barclamp,
                reason: "missing barclamp.name".to_string(),
            })?;
        barclamp.insert("source_path".to_string(), json!("API_uploaded"));

        let uploaded = self
            .backend
            .post_json(BARCLAMPS_PATH, &json!({ "value": config }))
            .await;
        if let Err(e) = uploaded {
            self.notice("Error Updating barclamp", Some(("barclamp", json!(e.to_string()))));
            return Err(e);
        }

        let entity = match self.backend.get_json(&format!("{BARCLAMPS_PATH}/{name}")).await {
            Ok(raw) => self.store.ingest(EntityKind::Barclamp, raw)?,
            Err(e) => {
                self.notice("Error Updating barclamp", Some(("barclamp", json!(e.to_string()))));
                return Err(e);
            }
        };

        self.notice("Updated barclamp", None);
        self.queue.enqueue(FetchTask::Collection(EntityKind::Role));
        self.drain().await;
        Ok(entity)
    }

    /// Publish a user-facing notice. With an error category it is also
    /// recorded in the error log.
    #[track_caller]
    pub fn notice(&self, message: &str, error: Option<(&str, Value)>) {
        if let Some((kind, detail)) = error {
            self.errors.record(kind, message, Some(detail));
        }
        self.notifier.publish(SyncEvent::Notice(message.to_string()));
    }

    async fn fetch_entity(&self, key: EntityKey) -> TaskOutcome {
        let fetched = self
            .backend
            .fetch_entity(key.kind, key.id)
            .await
            .and_then(|raw| Entity::ingest(key.kind, raw));

        match fetched {
            Ok(entity) => {
                self.store.set(entity);
                if key.kind == EntityKind::Node {
                    self.poll.auto_adjust(self.store.len(EntityKind::Node));
                }
                TaskOutcome::Stored
            }
            Err(e) if e.is_unauthorized() => {
                debug!(%key, "fetch unauthorized, keeping cached copy");
                self.notifier.publish(SyncEvent::EntityDone(key));
                TaskOutcome::Unauthorized
            }
            Err(e) => {
                debug!(%key, error = %e, "fetch failed, evicting");
                let removed = self.store.remove_cascading(key.kind, key.id);
                if removed.is_empty() {
                    self.notifier.publish(SyncEvent::EntityDone(key));
                }
                TaskOutcome::Evicted
            }
        }
    }

    async fn load_collection(&self, kind: EntityKind) -> TaskOutcome {
        match bootstrap::fetch_kind(&self.backend, kind).await {
            Ok(entities) => {
                let count = entities.len();
                self.store.replace_all(kind, entities);
                if kind == EntityKind::Node {
                    self.poll.auto_adjust(count);
                }
                self.notifier.publish(SyncEvent::CollectionDone(kind));
                TaskOutcome::Stored
            }
            Err(e) => {
                warn!(%kind, error = %e, "collection load failed");
                TaskOutcome::Failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl<B: Backend> TaskExecutor for SyncEngine<B> {
    async fn execute(&self, task: FetchTask) -> TaskOutcome {
        match task {
            FetchTask::Entity(key) => self.fetch_entity(key).await,
            FetchTask::Collection(kind) => self.load_collection(kind).await,
        }
    }
}
