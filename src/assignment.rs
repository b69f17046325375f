use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReconcileError, Result};

/// Whether an assignment should exist or stop existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "delete" => Ok(Action::Delete),
            _ => Err(format!("unknown action: {s}")),
        }
    }
}

/// Kind of directory identity an assignment is granted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrincipalType {
    #[default]
    Group,
    User,
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrincipalType::Group => write!(f, "GROUP"),
            PrincipalType::User => write!(f, "USER"),
        }
    }
}

impl std::str::FromStr for PrincipalType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GROUP" => Ok(PrincipalType::Group),
            "USER" => Ok(PrincipalType::User),
            _ => Err(format!("unknown principal type: {s}")),
        }
    }
}

/// Opaque permission-set identifier as issued by the assignment service,
/// e.g. `arn:aws:sso:::permissionSet/ssoins-1234/ps-5678`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSetId(String);

impl PermissionSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Rebuild an identifier from the two qualifier parts stored in a ledger key.
    pub fn from_qualifiers(instance_part: &str, permission_set_part: &str) -> Self {
        Self(format!(
            "arn:aws:sso:::permissionSet/{instance_part}/{permission_set_part}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the `(instance, permission-set)` qualifier parts: the
    /// second and third `/`-separated segments.
    pub fn qualifiers(&self) -> Result<(&str, &str)> {
        let mut segments = self.0.split('/');
        let _prefix = segments.next();
        match (segments.next(), segments.next()) {
            (Some(instance), Some(ps)) if !instance.is_empty() && !ps.is_empty() => {
                Ok((instance, ps))
            }
            _ => Err(ReconcileError::InvalidPermissionSetId {
                id: self.0.clone(),
            }),
        }
    }

    /// The short per-permission-set part used in queue partition keys.
    /// Falls back to the whole identifier when it is not qualified.
    pub fn short_part(&self) -> &str {
        self.qualifiers().map(|(_, ps)| ps).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for PermissionSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation ids threaded through every message so one link's journey can
/// be followed from trigger to confirmed assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub caused_by: Option<Uuid>,
}

impl RequestContext {
    /// A fresh root context, minted by a trigger.
    pub fn root() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            caused_by: None,
        }
    }

    /// A downstream context: a new request id whose `caused_by` always
    /// names the originating trigger.
    pub fn child(&self) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            caused_by: Some(self.caused_by.unwrap_or(self.request_id)),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::root()
    }
}

/// Lifecycle status recorded in structured log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    InProgress,
    Completed,
    Aborted,
    FailedWithError,
    FailedWithException,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::InProgress => "InProgress",
            RequestStatus::Completed => "Completed",
            RequestStatus::Aborted => "Aborted",
            RequestStatus::FailedWithError => "FailedWithError",
            RequestStatus::FailedWithException => "FailedWithException",
        };
        f.write_str(s)
    }
}

/// A fully-resolved, single-account create/delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub principal_id: String,
    pub principal_type: PrincipalType,
    pub target_account_id: String,
    pub permission_set_id: PermissionSetId,
    pub action: Action,

    /// `tagKey^accountId` when the target came from a tag query.
    pub tag_key_lookup: Option<String>,

    pub context: RequestContext,
}

impl DispatchRequest {
    /// FIFO partition key: requests sharing it are processed in order.
    pub fn partition_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.target_account_id,
            self.permission_set_id.short_part(),
            self.principal_id
        )
    }

    /// Deduplication id: identical ids inside the dedup window are dropped.
    pub fn dedup_id(&self) -> String {
        format!("{}-{}", self.action, self.partition_key())
    }
}
