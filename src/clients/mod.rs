pub mod instance;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::assignment::{PermissionSetId, PrincipalType};

pub use instance::InstanceLocator;

/// Failure reported by an external collaborator API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("throttled: {reason}")]
    Throttled { reason: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("service unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    #[error("{reason}")]
    Other { reason: String },
}

impl ApiError {
    /// Throttling, conflicts and connectivity failures are worth redelivering.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Throttled { .. } | ApiError::Conflict { .. } | ApiError::Unavailable { .. }
        )
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// One page of a paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

/// The assignment service instance and its identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub identity_store_id: String,
}

/// Parameters of a create/delete assignment call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentParams {
    pub instance_id: String,
    pub target_account_id: String,
    pub permission_set_id: PermissionSetId,
    pub principal_type: PrincipalType,
    pub principal_id: String,
}

/// Handle for an asynchronous assignment operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle {
    pub instance_id: String,
    pub operation_id: String,
}

/// Status of an asynchronous assignment operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed { reason: String },
}

/// Assignment API: the slow, workflow-style service holding entitlements.
#[async_trait]
pub trait AssignmentApi: Send + Sync {
    async fn list_instances(&self) -> ApiResult<Vec<InstanceInfo>>;

    async fn create_assignment(&self, params: &AssignmentParams) -> ApiResult<OperationHandle>;

    async fn delete_assignment(&self, params: &AssignmentParams) -> ApiResult<OperationHandle>;

    async fn describe_operation(&self, handle: &OperationHandle) -> ApiResult<OperationStatus>;
}

/// Directory API: groups are looked up by display name, users by user name.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn find_principal(
        &self,
        identity_store_id: &str,
        principal_type: PrincipalType,
        name: &str,
    ) -> ApiResult<Option<String>>;

    /// Resolve a principal id back to its name.
    async fn describe_principal(
        &self,
        identity_store_id: &str,
        principal_type: PrincipalType,
        principal_id: &str,
    ) -> ApiResult<Option<String>>;
}

/// Organization-hierarchy API.
#[async_trait]
pub trait OrganizationApi: Send + Sync {
    /// Accounts directly under an organizational unit or root.
    async fn list_accounts_for_parent(
        &self,
        parent_id: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>>;

    /// Organizational units directly under a parent.
    async fn list_child_ous(
        &self,
        parent_id: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>>;

    /// The direct parent (organizational unit or root) of an account or
    /// organizational unit. `None` for the root itself.
    async fn parent_of(&self, child_id: &str) -> ApiResult<Option<String>>;

    /// Every account in the organization.
    async fn list_accounts(&self, next_token: Option<String>) -> ApiResult<Page<String>>;

    /// Resource identifiers of accounts carrying `key=value`. The tag key is
    /// not echoed back; callers must carry it alongside the request.
    async fn resources_with_tag(
        &self,
        key: &str,
        value: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>>;
}

/// Extract the account id from an account resource identifier of the form
/// `arn:aws:organizations::<mgmt>:account/<org>/<account>`. Plain account ids
/// pass through unchanged.
pub fn account_id_from_resource(resource: &str) -> &str {
    resource.split('/').nth(2).unwrap_or(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Throttled { reason: "slow down".into() }.is_retryable());
        assert!(ApiError::Conflict { reason: "busy".into() }.is_retryable());
        assert!(!ApiError::Validation { reason: "bad".into() }.is_retryable());
        assert!(!ApiError::NotFound { resource: "x".into() }.is_retryable());
    }

    #[test]
    fn test_account_id_from_resource() {
        assert_eq!(
            account_id_from_resource(
                "arn:aws:organizations::111111111111:account/o-abc/222222222222"
            ),
            "222222222222"
        );
        assert_eq!(account_id_from_resource("222222222222"), "222222222222");
    }
}
