//! Cached cluster entities and their kinds.
//!
//! Every object the backend serves (nodes, deployments, roles, ...) is held
//! as an [`Entity`]: the raw JSON attributes plus a handful of fields derived
//! at ingestion time. Kinds are a closed enum so cache keys, change topics and
//! collection paths can never drift apart.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};

/// Integer identifier, unique within one [`EntityKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// The kinds of object mirrored from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A group of nodes sharing configuration.
    Deployment,
    /// A unit of work that can be bound to nodes.
    Role,
    /// A managed machine.
    Node,
    /// A named attribute profile.
    Profile,
    /// A role bound to a node.
    NodeRole,
    /// A role bound to a deployment.
    DeploymentRole,
    /// An address space.
    Network,
    /// A range inside a network.
    NetworkRange,
    /// An infrastructure provider.
    Provider,
    /// A packaged set of roles.
    Barclamp,
    /// A dashboard user.
    User,
    /// A tenant in the ownership tree.
    Tenant,
    /// A grantable capability.
    Capability,
}

/// Attributes requested for node roles; leaves out the bulky run log.
pub const NODE_ROLE_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "deployment_id",
    "role_id",
    "node_id",
    "state",
    "cohort",
    "run_count",
    "status",
    "available",
    "order",
    "created_at",
    "updated_at",
    "uuid",
    "tenant_id",
    "node_error",
];

impl EntityKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Deployment,
        Self::Role,
        Self::Node,
        Self::Profile,
        Self::NodeRole,
        Self::DeploymentRole,
        Self::Network,
        Self::NetworkRange,
        Self::Provider,
        Self::Barclamp,
        Self::User,
        Self::Tenant,
        Self::Capability,
    ];

    /// Kinds loaded by a full sync, in the order they are queued.
    ///
    /// Users, tenants and capabilities come in through the tenant join
    /// instead.
    pub const FULL_SYNC: [Self; 10] = [
        Self::Deployment,
        Self::Role,
        Self::Node,
        Self::Profile,
        Self::NodeRole,
        Self::DeploymentRole,
        Self::Network,
        Self::NetworkRange,
        Self::Provider,
        Self::Barclamp,
    ];

    /// Singular name, as used in `<kind>_id` foreign keys.
    #[must_use]
    pub const fn singular(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Role => "role",
            Self::Node => "node",
            Self::Profile => "profile",
            Self::NodeRole => "node_role",
            Self::DeploymentRole => "deployment_role",
            Self::Network => "network",
            Self::NetworkRange => "network_range",
            Self::Provider => "provider",
            Self::Barclamp => "barclamp",
            Self::User => "user",
            Self::Tenant => "tenant",
            Self::Capability => "capability",
        }
    }

    /// Collection name, as used in REST paths and summary responses.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::Role => "roles",
            Self::Node => "nodes",
            Self::Profile => "profiles",
            Self::NodeRole => "node_roles",
            Self::DeploymentRole => "deployment_roles",
            Self::Network => "networks",
            Self::NetworkRange => "network_ranges",
            Self::Provider => "providers",
            Self::Barclamp => "barclamps",
            Self::User => "users",
            Self::Tenant => "tenants",
            Self::Capability => "capabilities",
        }
    }

    /// Parse a singular name.
    #[must_use]
    pub fn from_singular(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.singular() == name)
    }

    /// Parse a collection name from a summary response.
    ///
    /// The trailing plural `s` is stripped and the remainder parsed as a
    /// singular name, so `"nodes"` maps to [`EntityKind::Node`].
    pub fn from_collection(name: &str) -> SyncResult<Self> {
        name.strip_suffix('s')
            .and_then(Self::from_singular)
            .ok_or_else(|| SyncError::UnknownKind(name.to_string()))
    }

    /// Kinds removed along with an entity of this kind.
    ///
    /// Removal only reaches one level: the children themselves never cascade.
    #[must_use]
    pub const fn cascade_children(self) -> &'static [Self] {
        match self {
            Self::Deployment => &[Self::Node, Self::NodeRole],
            _ => &[],
        }
    }

    /// Attribute projection to request when fetching this kind, if any.
    #[must_use]
    pub const fn projection(self) -> Option<&'static [&'static str]> {
        match self {
            Self::NodeRole => Some(NODE_ROLE_ATTRIBUTES),
            _ => None,
        }
    }

    /// Foreign-key attribute naming a parent of this kind.
    #[must_use]
    pub fn foreign_key(self) -> String {
        format!("{}_id", self.singular())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

/// A `(kind, id)` pair addressing one cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
}

impl EntityKey {
    /// Create a key.
    #[must_use]
    pub const fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Presentation name for a node or node-role state code.
#[must_use]
pub const fn state_name(state: i64) -> Option<&'static str> {
    match state {
        -1 => Some("error"),
        0 => Some("ready"),
        1 => Some("todo"),
        2 => Some("transition"),
        3 => Some("blocked"),
        4 => Some("proposed"),
        _ => None,
    }
}

/// Coarse node state used by summary charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleState {
    /// Alive and in state 0.
    Ready = 0,
    /// Alive and in state -1.
    Error = 1,
    /// Alive with work outstanding.
    Todo = 2,
    /// Not alive.
    Off = 3,
}

/// Fields computed from the raw payload when an entity is ingested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derived {
    /// Presentation status (nodes and node roles).
    pub status: Option<String>,
    /// Chart bucket (nodes only).
    pub simple_state: Option<SimpleState>,
}

/// Wizard launcher advertised by a barclamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WizardEntry {
    /// Barclamp id.
    pub id: EntityId,
    /// Wizard title.
    pub title: String,
    /// Icon name.
    pub icon: String,
    /// Route to the wizard.
    pub path: String,
}

/// Only this wizard schema version is surfaced.
const WIZARD_VERSION: i64 = 2;
const DEFAULT_WIZARD_ICON: &str = "create_new_folder";

/// A cached backend object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity id.
    pub id: EntityId,
    /// Raw attributes as served by the backend, after normalization.
    pub attributes: Map<String, Value>,
    /// Fields derived at ingestion.
    #[serde(default)]
    pub derived: Derived,
}

impl Entity {
    /// Normalize a raw backend payload into an entity.
    pub fn ingest(kind: EntityKind, raw: Value) -> SyncResult<Self> {
        let Value::Object(mut attributes) = raw else {
            return Err(SyncError::Malformed {
                kind,
                reason: "expected a JSON object".to_string(),
            });
        };

        let id = attributes
            .get("id")
            .and_then(Value::as_i64)
            .map(EntityId)
            .ok_or_else(|| SyncError::Malformed {
                kind,
                reason: "missing integer id".to_string(),
            })?;

        let mut derived = Derived::default();
        match kind {
            EntityKind::Node => {
                let address = attributes
                    .get("node-control-address")
                    .cloned()
                    .unwrap_or(Value::Null);
                attributes.insert("address".to_string(), address);

                let alive = attributes.get("alive").and_then(Value::as_bool).unwrap_or(false);
                let reserved = attributes.get("reserved").and_then(Value::as_bool).unwrap_or(false);
                let state = attributes.get("state").and_then(Value::as_i64);

                derived.status = if alive {
                    state.and_then(state_name).map(str::to_string)
                } else if reserved {
                    Some("reserved".to_string())
                } else {
                    Some("off".to_string())
                };

                derived.simple_state = Some(match (alive, state) {
                    (false, _) => SimpleState::Off,
                    (true, Some(-1)) => SimpleState::Error,
                    (true, Some(0)) => SimpleState::Ready,
                    (true, _) => SimpleState::Todo,
                });
            }
            EntityKind::NodeRole => {
                attributes.remove("runlog");
                derived.status = attributes
                    .get("state")
                    .and_then(Value::as_i64)
                    .and_then(state_name)
                    .map(str::to_string);
            }
            _ => {}
        }

        Ok(Self {
            kind,
            id,
            attributes,
            derived,
        })
    }

    /// Cache key of this entity.
    #[must_use]
    pub const fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.id)
    }

    /// Raw attribute lookup.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Integer attribute.
    #[must_use]
    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Value::as_i64)
    }

    /// Boolean attribute; absent counts as `false`.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.attr(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// String attribute.
    #[must_use]
    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Value::as_str)
    }

    /// The `name` attribute.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.str_attr("name")
    }

    /// Id of the parent of the given kind, read from `<parent>_id`.
    #[must_use]
    pub fn parent_id(&self, parent: EntityKind) -> Option<EntityId> {
        self.int_attr(&parent.foreign_key()).map(EntityId)
    }

    /// Id of the owning deployment.
    #[must_use]
    pub fn deployment_id(&self) -> Option<EntityId> {
        self.parent_id(EntityKind::Deployment)
    }

    /// Derived presentation status.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.derived.status.as_deref()
    }

    /// Wizard launcher for a barclamp whose config declares a v2 wizard.
    #[must_use]
    pub fn wizard(&self) -> Option<WizardEntry> {
        if self.kind != EntityKind::Barclamp {
            return None;
        }
        let wizard = self.attr("cfg_data")?.get("wizard")?.as_object()?;
        if wizard.get("version").and_then(Value::as_i64) != Some(WIZARD_VERSION) {
            return None;
        }

        Some(WizardEntry {
            id: self.id,
            title: wizard
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            icon: wizard
                .get("icon")
                .and_then(Value::as_str)
                .filter(|icon| !icon.is_empty())
                .unwrap_or(DEFAULT_WIZARD_ICON)
                .to_string(),
            path: format!("/workloads/{}", self.id),
        })
    }
}

/// Presentation status for a node, from its live flags.
///
/// Unlike the status derived at ingestion this looks at `available` rather
/// than `reserved`.
#[must_use]
pub fn node_status(node: &Entity) -> &'static str {
    if !node.flag("alive") {
        return "off";
    }
    if !node.flag("available") {
        return "reserved";
    }
    node.int_attr("state").and_then(state_name).unwrap_or("unknown")
}

/// Host part of a fully qualified name.
#[must_use]
pub fn short_name(name: &str) -> &str {
    name.split_once('.').map_or(name, |(host, _)| host)
}
