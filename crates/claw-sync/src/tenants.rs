//! Users, tenants and capability grants joined into one directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::{Entity, EntityId, EntityKind};

/// One row of the user/tenant/capability join table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    /// Grantee.
    pub user_id: EntityId,
    /// Tenant the grant applies in.
    pub tenant_id: EntityId,
    /// Granted capability.
    pub capability_id: EntityId,
}

/// A user's capabilities within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCaps {
    /// Tenant id.
    pub tenant_id: EntityId,
    /// Capability ids, in grant order.
    pub capabilities: Vec<EntityId>,
}

/// A user with capabilities grouped by tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    /// The user as served by the backend.
    pub user: Entity,
    /// Home tenant.
    pub tenant_id: Option<EntityId>,
    /// Capabilities keyed by tenant id. Every known tenant has an entry.
    pub caps: BTreeMap<EntityId, TenantCaps>,
}

/// A tenant with its place in the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantEntry {
    /// The tenant as served by the backend.
    pub tenant: Entity,
    /// Parent tenant, if it exists in the directory.
    pub parent_id: Option<EntityId>,
    /// Direct children, ascending.
    pub children: Vec<EntityId>,
    /// Users whose home tenant this is, ascending.
    pub users: Vec<EntityId>,
}

/// Position of a tenant in the flattened tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatTenant {
    /// Tenant id.
    pub id: EntityId,
    /// Distance from its root; roots are 0.
    pub depth: usize,
}

/// Joined view of users, tenants and capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantDirectory {
    /// Users by id.
    pub users: BTreeMap<EntityId, UserEntry>,
    /// Tenants by id.
    pub tenants: BTreeMap<EntityId, TenantEntry>,
    /// Tenants without a known parent, ascending.
    pub roots: Vec<EntityId>,
    /// Pre-order traversal of the tenant forest.
    pub in_order: Vec<FlatTenant>,
    /// Capabilities by id.
    pub capabilities: BTreeMap<EntityId, Entity>,
}

impl TenantDirectory {
    /// Build the directory in one pass over each input.
    ///
    /// Grants naming an unknown user and users naming an unknown tenant are
    /// skipped with a warning.
    #[must_use]
    pub fn build(
        users: Vec<Entity>,
        tenants: Vec<Entity>,
        grants: &[CapabilityGrant],
        capabilities: Vec<Entity>,
    ) -> Self {
        let mut dir = Self::default();

        for user in users {
            let tenant_id = user.parent_id(EntityKind::Tenant);
            dir.users.insert(
                user.id,
                UserEntry {
                    user,
                    tenant_id,
                    caps: BTreeMap::new(),
                },
            );
        }

        for grant in grants {
            let Some(user) = dir.users.get_mut(&grant.user_id) else {
                warn!(user = %grant.user_id, "capability grant for unknown user");
                continue;
            };
            user.caps
                .entry(grant.tenant_id)
                .or_insert_with(|| TenantCaps {
                    tenant_id: grant.tenant_id,
                    capabilities: Vec::new(),
                })
                .capabilities
                .push(grant.capability_id);
        }

        for tenant in tenants {
            let id = tenant.id;
            for user in dir.users.values_mut() {
                user.caps.entry(id).or_insert_with(|| TenantCaps {
                    tenant_id: id,
                    capabilities: Vec::new(),
                });
            }
            dir.tenants.insert(
                id,
                TenantEntry {
                    parent_id: tenant.int_attr("parent_id").map(EntityId),
                    tenant,
                    children: Vec::new(),
                    users: Vec::new(),
                },
            );
        }

        for (user_id, user) in &dir.users {
            match user.tenant_id.and_then(|t| dir.tenants.get_mut(&t)) {
                Some(tenant) => tenant.users.push(*user_id),
                None => warn!(user = %user_id, "user has no known home tenant"),
            }
        }

        let links: Vec<(EntityId, Option<EntityId>)> = dir
            .tenants
            .iter()
            .map(|(id, t)| (*id, t.parent_id.filter(|p| dir.tenants.contains_key(p))))
            .collect();
        for (id, parent) in links {
            match parent {
                Some(parent) => {
                    if let Some(parent) = dir.tenants.get_mut(&parent) {
                        parent.children.push(id);
                    }
                }
                None => {
                    if let Some(tenant) = dir.tenants.get_mut(&id) {
                        tenant.parent_id = None;
                    }
                    dir.roots.push(id);
                }
            }
        }

        dir.in_order = dir.flatten();
        dir.capabilities = capabilities.into_iter().map(|c| (c.id, c)).collect();
        dir
    }

    fn flatten(&self) -> Vec<FlatTenant> {
        let mut out = Vec::with_capacity(self.tenants.len());
        let mut stack: Vec<FlatTenant> = self
            .roots
            .iter()
            .rev()
            .map(|id| FlatTenant { id: *id, depth: 0 })
            .collect();

        while let Some(current) = stack.pop() {
            out.push(current);
            if let Some(tenant) = self.tenants.get(&current.id) {
                stack.extend(tenant.children.iter().rev().map(|child| FlatTenant {
                    id: *child,
                    depth: current.depth + 1,
                }));
            }
        }
        out
    }

    /// Capabilities a user holds in a tenant.
    #[must_use]
    pub fn capabilities_of(&self, user: EntityId, tenant: EntityId) -> &[EntityId] {
        self.users
            .get(&user)
            .and_then(|u| u.caps.get(&tenant))
            .map(|caps| caps.capabilities.as_slice())
            .unwrap_or_default()
    }
}
