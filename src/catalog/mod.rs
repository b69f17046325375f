//! Desired-state stores: links, the principal name cache and the
//! permission-set catalog.

pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::assignment::{PermissionSetId, PrincipalType};
use crate::error::Result;
use crate::link::{Link, ScopeType};

pub use memory::{MemoryLinkStore, MemoryPermissionSetCatalog, MemoryPrincipalCache};

/// Desired-state link records with the secondary lookups the triggers need.
pub trait LinkStore: Send + Sync {
    /// Insert a link. Re-inserting an existing link is a no-op.
    fn put(&self, link: Link) -> Result<()>;

    /// Remove a link by descriptor id, returning it if present.
    fn remove(&self, link_id: &str) -> Result<Option<Link>>;

    fn get(&self, link_id: &str) -> Result<Option<Link>>;

    fn by_principal(&self, principal_name: &str, principal_type: PrincipalType)
        -> Result<Vec<Link>>;

    fn by_permission_set_name(&self, permission_set_name: &str) -> Result<Vec<Link>>;

    /// Links whose scope type and scope value both match.
    fn by_scope(&self, scope_type: ScopeType, scope_value: &str) -> Result<Vec<Link>>;

    fn all(&self) -> Result<Vec<Link>>;
}

/// A cached `name -> id` resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalCacheEntry {
    pub principal_name: String,
    pub principal_type: PrincipalType,
    pub principal_id: String,
}

pub trait PrincipalCache: Send + Sync {
    fn get(&self, principal_name: &str, principal_type: PrincipalType) -> Result<Option<String>>;

    fn upsert(&self, entry: PrincipalCacheEntry) -> Result<()>;

    fn get_by_id(&self, principal_id: &str) -> Result<Option<PrincipalCacheEntry>>;

    fn remove_by_id(&self, principal_id: &str) -> Result<Option<PrincipalCacheEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    #[default]
    Pending,
    Provisioned,
}

/// A permission set as known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSetRecord {
    pub name: String,

    /// Assigned by the assignment service once provisioned.
    #[serde(default)]
    pub id: Option<PermissionSetId>,

    #[serde(default)]
    pub status: ProvisioningStatus,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub session_duration: Option<String>,

    #[serde(default)]
    pub relay_state: Option<String>,

    #[serde(default)]
    pub managed_policies: Vec<String>,

    #[serde(default)]
    pub inline_policy: Option<String>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl PermissionSetRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            status: ProvisioningStatus::Pending,
            description: None,
            session_duration: None,
            relay_state: None,
            managed_policies: Vec::new(),
            inline_policy: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn provisioned(name: impl Into<String>, id: PermissionSetId) -> Self {
        Self {
            id: Some(id),
            status: ProvisioningStatus::Provisioned,
            ..Self::pending(name)
        }
    }

    /// The id to dispatch with, or `None` while unprovisioned.
    pub fn provisioned_id(&self) -> Option<&PermissionSetId> {
        match self.status {
            ProvisioningStatus::Provisioned => self.id.as_ref(),
            ProvisioningStatus::Pending => None,
        }
    }
}

/// Structural difference between two versions of a permission-set record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSetDiff {
    pub changed: Vec<&'static str>,
    pub became_provisioned: bool,
}

impl PermissionSetDiff {
    pub fn compute(old: Option<&PermissionSetRecord>, new: &PermissionSetRecord) -> Self {
        let was_provisioned = old.and_then(|o| o.provisioned_id()).is_some();
        let became_provisioned = !was_provisioned && new.provisioned_id().is_some();

        let mut changed = Vec::new();
        let Some(old) = old else {
            return Self {
                changed,
                became_provisioned,
            };
        };
        if old.description != new.description {
            changed.push("description");
        }
        if old.session_duration != new.session_duration {
            changed.push("session_duration");
        }
        if old.relay_state != new.relay_state {
            changed.push("relay_state");
        }
        if old.managed_policies != new.managed_policies {
            changed.push("managed_policies");
        }
        if old.inline_policy != new.inline_policy {
            changed.push("inline_policy");
        }
        if old.tags != new.tags {
            changed.push("tags");
        }
        Self {
            changed,
            became_provisioned,
        }
    }
}

pub trait PermissionSetCatalog: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<PermissionSetRecord>>;

    /// Store a record, returning the previous version.
    fn put(&self, record: PermissionSetRecord) -> Result<Option<PermissionSetRecord>>;

    fn remove(&self, name: &str) -> Result<Option<PermissionSetRecord>>;
}
