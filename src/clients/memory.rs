//! In-memory collaborators, driven by a YAML world description.
//!
//! Used by the `simulate` command and by tests. Each client can be told to
//! fail its next calls so redelivery and error paths can be exercised.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    ApiError, ApiResult, AssignmentApi, AssignmentParams, DirectoryApi, InstanceInfo,
    OperationHandle, OperationStatus, OrganizationApi, Page,
};
use crate::assignment::{Action, PrincipalType};
use crate::catalog::PermissionSetRecord;
use crate::error::{ReconcileError, Result};

/// A complete simulated environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub management_account_id: Option<String>,

    #[serde(default = "default_instance")]
    pub instance: InstanceInfo,

    #[serde(default)]
    pub organization: OrgLayout,

    #[serde(default)]
    pub directory: DirectoryLayout,

    #[serde(default)]
    pub permission_sets: Vec<PermissionSetRecord>,

    /// Number of status polls before an assignment operation completes.
    #[serde(default = "default_polls")]
    pub polls_until_complete: u32,
}

fn default_instance() -> InstanceInfo {
    InstanceInfo {
        instance_id: "arn:aws:sso:::instance/ssoins-0000000000000000".into(),
        identity_store_id: "d-0000000000".into(),
    }
}

fn default_polls() -> u32 {
    1
}

impl World {
    /// Load a world from a YAML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| ReconcileError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgLayout {
    #[serde(default = "default_root")]
    pub root_id: String,

    #[serde(default)]
    pub organizational_units: Vec<OuLayout>,

    #[serde(default)]
    pub accounts: Vec<AccountLayout>,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_root() -> String {
    "r-root".into()
}

fn default_page_size() -> usize {
    20
}

impl Default for OrgLayout {
    fn default() -> Self {
        Self {
            root_id: default_root(),
            organizational_units: Vec::new(),
            accounts: Vec::new(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuLayout {
    pub id: String,
    pub parent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLayout {
    pub id: String,
    pub parent: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryLayout {
    /// Group display name -> group id.
    #[serde(default)]
    pub groups: BTreeMap<String, String>,

    /// User name -> user id.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

fn take_failure(queue: &Mutex<VecDeque<ApiError>>) -> ApiResult<()> {
    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
    match queue.pop_front() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn paginate(
    items: Vec<String>,
    page_size: usize,
    next_token: Option<String>,
) -> ApiResult<Page<String>> {
    let start = match next_token {
        Some(token) => token.parse::<usize>().map_err(|_| ApiError::Validation {
            reason: format!("invalid pagination token: {token}"),
        })?,
        None => 0,
    };
    let page_size = page_size.max(1);
    let end = (start + page_size).min(items.len());
    let page = items.get(start..end).map(<[String]>::to_vec).unwrap_or_default();
    let next_token = (end < items.len()).then(|| end.to_string());
    Ok(Page {
        items: page,
        next_token,
    })
}

// ---------------------------------------------------------------------------
// Organization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OrgState {
    root_id: String,
    ou_parents: BTreeMap<String, String>,
    account_parents: BTreeMap<String, String>,
    tags: HashMap<String, BTreeMap<String, String>>,
}

/// Simulated organization tree with account tags.
pub struct MemoryOrganization {
    state: RwLock<OrgState>,
    organization_id: String,
    management_account_id: String,
    page_size: usize,
    failures: Mutex<VecDeque<ApiError>>,
}

impl MemoryOrganization {
    pub fn new(layout: &OrgLayout, management_account_id: Option<&str>) -> Self {
        let mut state = OrgState {
            root_id: layout.root_id.clone(),
            ou_parents: BTreeMap::new(),
            account_parents: BTreeMap::new(),
            tags: HashMap::new(),
        };
        for ou in &layout.organizational_units {
            state.ou_parents.insert(ou.id.clone(), ou.parent.clone());
        }
        for account in &layout.accounts {
            state
                .account_parents
                .insert(account.id.clone(), account.parent.clone());
            state.tags.insert(account.id.clone(), account.tags.clone());
        }
        Self {
            state: RwLock::new(state),
            organization_id: "o-simulated".into(),
            management_account_id: management_account_id.unwrap_or("000000000000").to_string(),
            page_size: layout.page_size,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next call fail with `err`.
    pub fn inject_failure(&self, err: ApiError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    pub fn add_account(&self, account_id: &str, parent: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .account_parents
            .insert(account_id.to_string(), parent.to_string());
        state.tags.entry(account_id.to_string()).or_default();
    }

    pub fn move_account(&self, account_id: &str, destination: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .account_parents
            .insert(account_id.to_string(), destination.to_string());
    }

    pub fn set_tag(&self, account_id: &str, key: &str, value: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state
            .tags
            .entry(account_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn remove_tag(&self, account_id: &str, key: &str) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tags) = state.tags.get_mut(account_id) {
            tags.remove(key);
        }
    }

    /// Current tags of an account.
    pub fn tags_of(&self, account_id: &str) -> BTreeMap<String, String> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.tags.get(account_id).cloned().unwrap_or_default()
    }

    /// The resource identifier reported for an account by tag queries.
    pub fn account_resource(&self, account_id: &str) -> String {
        format!(
            "arn:aws:organizations::{}:account/{}/{}",
            self.management_account_id, self.organization_id, account_id
        )
    }

    fn known_parent(state: &OrgState, parent_id: &str) -> bool {
        parent_id == state.root_id || state.ou_parents.contains_key(parent_id)
    }
}

#[async_trait]
impl OrganizationApi for MemoryOrganization {
    async fn list_accounts_for_parent(
        &self,
        parent_id: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>> {
        take_failure(&self.failures)?;
        let items = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !Self::known_parent(&state, parent_id) {
                return Err(ApiError::NotFound {
                    resource: parent_id.to_string(),
                });
            }
            state
                .account_parents
                .iter()
                .filter(|(_, parent)| parent.as_str() == parent_id)
                .map(|(account, _)| account.clone())
                .collect()
        };
        paginate(items, self.page_size, next_token)
    }

    async fn list_child_ous(
        &self,
        parent_id: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>> {
        take_failure(&self.failures)?;
        let items = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if !Self::known_parent(&state, parent_id) {
                return Err(ApiError::NotFound {
                    resource: parent_id.to_string(),
                });
            }
            state
                .ou_parents
                .iter()
                .filter(|(_, parent)| parent.as_str() == parent_id)
                .map(|(ou, _)| ou.clone())
                .collect()
        };
        paginate(items, self.page_size, next_token)
    }

    async fn parent_of(&self, child_id: &str) -> ApiResult<Option<String>> {
        take_failure(&self.failures)?;
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if child_id == state.root_id {
            return Ok(None);
        }
        state
            .ou_parents
            .get(child_id)
            .or_else(|| state.account_parents.get(child_id))
            .cloned()
            .map(Some)
            .ok_or_else(|| ApiError::NotFound {
                resource: child_id.to_string(),
            })
    }

    async fn list_accounts(&self, next_token: Option<String>) -> ApiResult<Page<String>> {
        take_failure(&self.failures)?;
        let items = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.account_parents.keys().cloned().collect()
        };
        paginate(items, self.page_size, next_token)
    }

    async fn resources_with_tag(
        &self,
        key: &str,
        value: &str,
        next_token: Option<String>,
    ) -> ApiResult<Page<String>> {
        take_failure(&self.failures)?;
        let mut accounts: Vec<String> = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state
                .tags
                .iter()
                .filter(|(_, tags)| tags.get(key).is_some_and(|v| v == value))
                .map(|(account, _)| account.clone())
                .collect()
        };
        accounts.sort();
        let items = accounts
            .iter()
            .map(|account| self.account_resource(account))
            .collect();
        paginate(items, self.page_size, next_token)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Simulated identity store.
pub struct MemoryDirectory {
    identity_store_id: String,
    groups: RwLock<BTreeMap<String, String>>,
    users: RwLock<BTreeMap<String, String>>,
    lookups: AtomicU32,
    failures: Mutex<VecDeque<ApiError>>,
}

impl MemoryDirectory {
    pub fn new(identity_store_id: &str, layout: &DirectoryLayout) -> Self {
        Self {
            identity_store_id: identity_store_id.to_string(),
            groups: RwLock::new(layout.groups.clone()),
            users: RwLock::new(layout.users.clone()),
            lookups: AtomicU32::new(0),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn inject_failure(&self, err: ApiError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    pub fn add_principal(&self, principal_type: PrincipalType, name: &str, id: &str) {
        let mut map = self.map(principal_type).write().unwrap_or_else(|e| e.into_inner());
        map.insert(name.to_string(), id.to_string());
    }

    pub fn remove_principal(&self, principal_type: PrincipalType, id: &str) {
        let mut map = self.map(principal_type).write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, v| v != id);
    }

    /// Number of name lookups served so far.
    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn map(&self, principal_type: PrincipalType) -> &RwLock<BTreeMap<String, String>> {
        match principal_type {
            PrincipalType::Group => &self.groups,
            PrincipalType::User => &self.users,
        }
    }

    fn check_store(&self, identity_store_id: &str) -> ApiResult<()> {
        if identity_store_id != self.identity_store_id {
            return Err(ApiError::NotFound {
                resource: identity_store_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryApi for MemoryDirectory {
    async fn find_principal(
        &self,
        identity_store_id: &str,
        principal_type: PrincipalType,
        name: &str,
    ) -> ApiResult<Option<String>> {
        take_failure(&self.failures)?;
        self.check_store(identity_store_id)?;
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let map = self.map(principal_type).read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(name).cloned())
    }

    async fn describe_principal(
        &self,
        identity_store_id: &str,
        principal_type: PrincipalType,
        principal_id: &str,
    ) -> ApiResult<Option<String>> {
        take_failure(&self.failures)?;
        self.check_store(identity_store_id)?;
        let map = self.map(principal_type).read().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .iter()
            .find(|(_, id)| id.as_str() == principal_id)
            .map(|(name, _)| name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Assignments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PendingOperation {
    remaining_polls: u32,
    action: Action,
    params: AssignmentParams,
}

/// A recorded create/delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentCall {
    pub action: Action,
    pub params: AssignmentParams,
}

/// Simulated assignment service. Operations complete after a configurable
/// number of status polls; assignments take effect on completion.
pub struct MemoryAssignmentApi {
    instance: InstanceInfo,
    polls_until_complete: u32,
    operations: DashMap<String, PendingOperation>,
    assigned: DashMap<(String, String, String), PrincipalType>,
    calls: Mutex<Vec<AssignmentCall>>,
    fail_operations: AtomicBool,
    failures: Mutex<VecDeque<ApiError>>,
}

impl MemoryAssignmentApi {
    pub fn new(instance: InstanceInfo, polls_until_complete: u32) -> Self {
        Self {
            instance,
            polls_until_complete,
            operations: DashMap::new(),
            assigned: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            fail_operations: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Make the next call fail with `err`.
    pub fn inject_failure(&self, err: ApiError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// When set, every operation terminates as failed.
    pub fn set_fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::Relaxed);
    }

    /// All create/delete calls received, in order.
    pub fn calls(&self) -> Vec<AssignmentCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, action: Action) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.action == action)
            .count()
    }

    /// Whether the service currently holds this assignment.
    pub fn is_assigned(
        &self,
        principal_id: &str,
        account_id: &str,
        permission_set_id: &str,
    ) -> bool {
        self.assigned.contains_key(&(
            principal_id.to_string(),
            account_id.to_string(),
            permission_set_id.to_string(),
        ))
    }

    pub fn assignment_count(&self) -> usize {
        self.assigned.len()
    }

    /// Operations submitted but not yet reported terminal.
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    fn submit(&self, action: Action, params: &AssignmentParams) -> ApiResult<OperationHandle> {
        take_failure(&self.failures)?;
        if params.instance_id != self.instance.instance_id {
            return Err(ApiError::Validation {
                reason: format!("unknown instance {}", params.instance_id),
            });
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AssignmentCall {
                action,
                params: params.clone(),
            });
        let operation_id = Uuid::new_v4().to_string();
        self.operations.insert(
            operation_id.clone(),
            PendingOperation {
                remaining_polls: self.polls_until_complete,
                action,
                params: params.clone(),
            },
        );
        Ok(OperationHandle {
            instance_id: params.instance_id.clone(),
            operation_id,
        })
    }
}

#[async_trait]
impl AssignmentApi for MemoryAssignmentApi {
    async fn list_instances(&self) -> ApiResult<Vec<InstanceInfo>> {
        Ok(vec![self.instance.clone()])
    }

    async fn create_assignment(&self, params: &AssignmentParams) -> ApiResult<OperationHandle> {
        self.submit(Action::Create, params)
    }

    async fn delete_assignment(&self, params: &AssignmentParams) -> ApiResult<OperationHandle> {
        self.submit(Action::Delete, params)
    }

    async fn describe_operation(&self, handle: &OperationHandle) -> ApiResult<OperationStatus> {
        let not_found = || ApiError::NotFound {
            resource: handle.operation_id.clone(),
        };
        {
            let mut op = self
                .operations
                .get_mut(&handle.operation_id)
                .ok_or_else(not_found)?;
            if op.remaining_polls > 0 {
                op.remaining_polls -= 1;
            }
            if op.remaining_polls > 0 {
                return Ok(OperationStatus::InProgress);
            }
        }

        // A terminal status is reported once; the operation is then forgotten.
        let (_, op) = self
            .operations
            .remove(&handle.operation_id)
            .ok_or_else(not_found)?;
        if self.fail_operations.load(Ordering::Relaxed) {
            return Ok(OperationStatus::Failed {
                reason: "simulated operation failure".into(),
            });
        }

        let key = (
            op.params.principal_id.clone(),
            op.params.target_account_id.clone(),
            op.params.permission_set_id.to_string(),
        );
        match op.action {
            Action::Create => {
                self.assigned.insert(key, op.params.principal_type);
            }
            Action::Delete => {
                self.assigned.remove(&key);
            }
        }
        Ok(OperationStatus::Succeeded)
    }
}
