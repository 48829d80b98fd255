//! Full synchronization and auxiliary loads.
//!
//! A full sync queues one collection fetch per kind in
//! [`EntityKind::FULL_SYNC`]; the queue then replaces each slice of the store
//! as the responses arrive. Feature discovery and the tenant directory are
//! loaded directly and never fail the caller.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::Backend;
use crate::entity::{Entity, EntityKind};
use crate::error::{SyncError, SyncResult};
use crate::features::{AuxiliaryData, FeatureFlags, Subsystem};
use crate::queue::{FetchQueue, FetchTask};
use crate::store::EntityStore;
use crate::tenants::{CapabilityGrant, TenantDirectory};

/// Path of the health document listing running services.
pub const HEALTH_PATH: &str = "/health";

/// Path of the user/tenant/capability join table.
pub const GRANTS_PATH: &str = "/api/v2/user_tenant_capabilities";

/// Queue a collection fetch for every full-sync kind. Returns how many tasks
/// were queued.
pub fn plan_full_sync(queue: &FetchQueue) -> usize {
    for kind in EntityKind::FULL_SYNC {
        queue.enqueue(FetchTask::Collection(kind));
    }
    info!(kinds = EntityKind::FULL_SYNC.len(), "full sync queued");
    EntityKind::FULL_SYNC.len()
}

/// Discover optional subsystems and load their data.
///
/// A failed health check disables every subsystem. A subsystem whose own
/// load fails keeps its flag but leaves its data empty.
pub async fn load_features<B: Backend>(backend: &B) -> (FeatureFlags, AuxiliaryData) {
    let flags = match backend.get_json(HEALTH_PATH).await {
        Ok(health) => FeatureFlags::from_health(&health).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable health response, disabling subsystems");
            FeatureFlags::default()
        }),
        Err(e) => {
            warn!(error = %e, "health check failed, disabling subsystems");
            FeatureFlags::default()
        }
    };

    let mut data = AuxiliaryData::default();
    for subsystem in flags.iter_enabled() {
        match load_subsystem(backend, subsystem).await {
            Ok(bodies) => {
                for (endpoint, body) in bodies {
                    data.put(endpoint, body);
                }
            }
            Err(e) => warn!(?subsystem, error = %e, "subsystem load failed"),
        }
    }

    (flags, data)
}

async fn load_subsystem<B: Backend>(
    backend: &B,
    subsystem: Subsystem,
) -> SyncResult<Vec<(&'static str, Value)>> {
    let mut bodies = Vec::with_capacity(subsystem.endpoints().len());
    for endpoint in subsystem.endpoints() {
        let body = backend.get_json(endpoint).await?;
        debug!(endpoint, "loaded subsystem endpoint");
        bodies.push((*endpoint, body));
    }
    Ok(bodies)
}

/// Load users, tenants, capabilities and grants, write the entities to the
/// store and build the joined directory.
pub async fn load_tenants<B: Backend>(
    backend: &B,
    store: &EntityStore,
) -> SyncResult<TenantDirectory> {
    let users = fetch_kind(backend, EntityKind::User).await?;
    let grants = parse_grants(backend.get_json(GRANTS_PATH).await?)?;
    let tenants = fetch_kind(backend, EntityKind::Tenant).await?;
    let capabilities = fetch_kind(backend, EntityKind::Capability).await?;

    store.replace_all(EntityKind::User, users.clone());
    store.replace_all(EntityKind::Tenant, tenants.clone());
    store.replace_all(EntityKind::Capability, capabilities.clone());

    let directory = TenantDirectory::build(users, tenants, &grants, capabilities);
    info!(
        users = directory.users.len(),
        tenants = directory.tenants.len(),
        grants = grants.len(),
        "tenant directory loaded"
    );
    Ok(directory)
}

/// Fetch and ingest a whole collection, skipping malformed entries.
pub async fn fetch_kind<B: Backend>(backend: &B, kind: EntityKind) -> SyncResult<Vec<Entity>> {
    let raw = backend.fetch_collection(kind).await?;
    Ok(ingest_all(kind, raw))
}

/// Ingest raw entities, dropping those without a usable id.
pub fn ingest_all(kind: EntityKind, raw: Vec<Value>) -> Vec<Entity> {
    raw.into_iter()
        .filter_map(|value| match Entity::ingest(kind, value) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!(%kind, error = %e, "skipping malformed entity");
                None
            }
        })
        .collect()
}

fn parse_grants(body: Value) -> SyncResult<Vec<CapabilityGrant>> {
    let Value::Array(rows) = body else {
        return Err(SyncError::Decode(
            "user_tenant_capabilities is not an array".to_string(),
        ));
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<CapabilityGrant>(row) {
            Ok(grant) => Some(grant),
            Err(e) => {
                warn!(error = %e, "skipping malformed capability grant");
                None
            }
        })
        .collect())
}
