//! In-memory cache of backend entities, partitioned by kind and id.
//!
//! The store is the one piece of shared mutable state in the client. Locks
//! are held only for the map operation itself and are released before any
//! change event is published, so handlers may read the store freely. There
//! is no snapshot isolation: a reader may observe a slice between two
//! unrelated updates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::entity::{Entity, EntityId, EntityKey, EntityKind, WizardEntry};
use crate::error::SyncResult;
use crate::notify::{ChangeNotifier, SyncEvent};

type Slice = BTreeMap<EntityId, Arc<Entity>>;

/// Shared entity cache. Every mutation publishes through the notifier.
#[derive(Debug)]
pub struct EntityStore {
    slices: RwLock<HashMap<EntityKind, Slice>>,
    wizards: RwLock<Vec<WizardEntry>>,
    notifier: Arc<ChangeNotifier>,
}

impl EntityStore {
    /// Create an empty store publishing to `notifier`.
    #[must_use]
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            slices: RwLock::new(HashMap::new()),
            wizards: RwLock::new(Vec::new()),
            notifier,
        }
    }

    /// The notifier mutations publish to.
    #[must_use]
    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Look up one entity.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<Arc<Entity>> {
        self.slices.read().get(&kind)?.get(&id).cloned()
    }

    /// Whether an entity is cached.
    #[must_use]
    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.slices
            .read()
            .get(&kind)
            .is_some_and(|slice| slice.contains_key(&id))
    }

    /// Insert or overwrite an entity, then publish its done event.
    pub fn set(&self, entity: Entity) -> Arc<Entity> {
        let key = entity.key();
        let wizard = entity.wizard();
        let entity = Arc::new(entity);

        self.slices
            .write()
            .entry(key.kind)
            .or_default()
            .insert(key.id, Arc::clone(&entity));

        if let Some(wizard) = wizard {
            self.register_wizard(wizard);
        }

        self.notifier.publish(SyncEvent::EntityDone(key));
        entity
    }

    /// Normalize a raw payload and store it.
    pub fn ingest(&self, kind: EntityKind, raw: Value) -> SyncResult<Arc<Entity>> {
        let entity = Entity::ingest(kind, raw)?;
        Ok(self.set(entity))
    }

    /// Remove one entity without cascading.
    ///
    /// Publishes only when something was actually removed.
    pub fn delete(&self, kind: EntityKind, id: EntityId) -> Option<Arc<Entity>> {
        let removed = self.slices.write().get_mut(&kind)?.remove(&id)?;
        debug!(%kind, %id, "removed from cache");
        self.notifier
            .publish(SyncEvent::EntityDone(EntityKey::new(kind, id)));
        Some(removed)
    }

    /// Remove an entity and, one level deep, the children its kind cascades
    /// to (a deployment takes its nodes and node roles with it).
    ///
    /// Returns every key removed, parent first. Absent parents remove
    /// nothing.
    pub fn remove_cascading(&self, kind: EntityKind, id: EntityId) -> Vec<EntityKey> {
        let children = kind.cascade_children();
        let mut removed = Vec::new();
        {
            let mut slices = self.slices.write();
            if slices
                .get_mut(&kind)
                .and_then(|slice| slice.remove(&id))
                .is_none()
            {
                return removed;
            }
            removed.push(EntityKey::new(kind, id));

            for child_kind in children {
                let Some(slice) = slices.get_mut(child_kind) else {
                    continue;
                };
                let orphans: Vec<EntityId> = slice
                    .values()
                    .filter(|child| child.parent_id(kind) == Some(id))
                    .map(|child| child.id)
                    .collect();
                for orphan in orphans {
                    slice.remove(&orphan);
                    removed.push(EntityKey::new(*child_kind, orphan));
                }
            }
        }

        info!(%kind, %id, cascaded = removed.len() - 1, "removing");
        for key in &removed {
            self.notifier.publish(SyncEvent::EntityDone(*key));
        }
        removed
    }

    /// Replace a kind's whole slice, publishing once per new entity.
    pub fn replace_all(&self, kind: EntityKind, entities: Vec<Entity>) {
        let mut slice = Slice::new();
        let mut wizards = Vec::new();
        for entity in entities {
            if let Some(wizard) = entity.wizard() {
                wizards.push(wizard);
            }
            slice.insert(entity.id, Arc::new(entity));
        }
        let keys: Vec<EntityKey> = slice.keys().map(|id| EntityKey::new(kind, *id)).collect();

        self.slices.write().insert(kind, slice);
        for wizard in wizards {
            self.register_wizard(wizard);
        }

        debug!(%kind, count = keys.len(), "replaced slice");
        for key in keys {
            self.notifier.publish(SyncEvent::EntityDone(key));
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.slices.write().clear();
        self.wizards.write().clear();
    }

    /// Ids cached for a kind, ascending.
    #[must_use]
    pub fn ids(&self, kind: EntityKind) -> Vec<EntityId> {
        self.slices
            .read()
            .get(&kind)
            .map(|slice| slice.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of cached entities of a kind.
    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.slices.read().get(&kind).map_or(0, BTreeMap::len)
    }

    /// Whether nothing at all is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.read().values().all(BTreeMap::is_empty)
    }

    /// All cached entities of a kind, ascending by id.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> Vec<Arc<Entity>> {
        self.slices
            .read()
            .get(&kind)
            .map(|slice| slice.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entities of `kind` whose `<parent_kind>_id` equals `parent_id`.
    #[must_use]
    pub fn children_of(
        &self,
        kind: EntityKind,
        parent_kind: EntityKind,
        parent_id: EntityId,
    ) -> Vec<Arc<Entity>> {
        self.slices
            .read()
            .get(&kind)
            .map(|slice| {
                slice
                    .values()
                    .filter(|e| e.parent_id(parent_kind) == Some(parent_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ordering key of a deployment role, taken from its role's cohort.
    #[must_use]
    pub fn deployment_role_cohort(&self, id: EntityId) -> Option<i64> {
        let slices = self.slices.read();
        let deployment_role = slices.get(&EntityKind::DeploymentRole)?.get(&id)?;
        let role_id = deployment_role.parent_id(EntityKind::Role)?;
        slices.get(&EntityKind::Role)?.get(&role_id)?.int_attr("cohort")
    }

    /// Wizard launchers registered by barclamps, in discovery order.
    #[must_use]
    pub fn wizards(&self) -> Vec<WizardEntry> {
        self.wizards.read().clone()
    }

    fn register_wizard(&self, wizard: WizardEntry) {
        let mut wizards = self.wizards.write();
        if !wizards.iter().any(|w| w.id == wizard.id) {
            wizards.push(wizard);
        }
    }
}
