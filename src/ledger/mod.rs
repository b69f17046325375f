pub mod jsonl;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::{PermissionSetId, PrincipalType};
use crate::error::{ReconcileError, Result};

pub use jsonl::JsonlLedger;
pub use memory::MemoryLedger;

const KEY_SEPARATOR: char = '@';

/// Composite key of a confirmed assignment:
/// `principalId@targetAccountId@instancePart@permissionSetPart`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LedgerKey {
    pub principal_id: String,
    pub target_account_id: String,
    pub instance_part: String,
    pub permission_set_part: String,
}

impl LedgerKey {
    /// Derive the key by splitting the permission-set identifier into its
    /// two qualifier parts.
    pub fn derive(
        principal_id: &str,
        target_account_id: &str,
        permission_set_id: &PermissionSetId,
    ) -> Result<Self> {
        let (instance_part, permission_set_part) = permission_set_id.qualifiers()?;
        Ok(Self {
            principal_id: principal_id.to_string(),
            target_account_id: target_account_id.to_string(),
            instance_part: instance_part.to_string(),
            permission_set_part: permission_set_part.to_string(),
        })
    }

    /// Rebuild the permission-set identifier this key was derived from.
    pub fn permission_set_id(&self) -> PermissionSetId {
        PermissionSetId::from_qualifiers(&self.instance_part, &self.permission_set_part)
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.principal_id, self.target_account_id, self.instance_part, self.permission_set_part
        )
    }
}

impl std::str::FromStr for LedgerKey {
    type Err = ReconcileError;

    /// The last three fields never contain `@`; anything before them is
    /// the principal id.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.rsplitn(4, KEY_SEPARATOR);
        let (Some(ps), Some(instance), Some(account), Some(principal)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ReconcileError::InvalidLedgerKey {
                key: s.to_string(),
                reason: "expected principal@account@instance@permission-set".into(),
            });
        };
        if [ps, instance, account, principal].iter().any(|p| p.is_empty()) {
            return Err(ReconcileError::InvalidLedgerKey {
                key: s.to_string(),
                reason: "empty key component".into(),
            });
        }
        Ok(Self {
            principal_id: principal.to_string(),
            target_account_id: account.to_string(),
            instance_part: instance.to_string(),
            permission_set_part: ps.to_string(),
        })
    }
}

impl TryFrom<String> for LedgerKey {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LedgerKey> for String {
    fn from(value: LedgerKey) -> Self {
        value.to_string()
    }
}

/// A confirmed assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedEntry {
    pub key: LedgerKey,
    pub principal_type: PrincipalType,

    /// `tagKey^accountId` for assignments that came from a tag scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_key_lookup: Option<String>,

    pub confirmed_at: DateTime<Utc>,
}

/// Read capability over the ledger. Handed to every component that needs to
/// know whether an assignment is confirmed.
pub trait LedgerReader: Send + Sync {
    fn get(&self, key: &LedgerKey) -> Result<Option<ProvisionedEntry>>;

    /// Entries recorded with the given `tagKey^accountId` lookup value.
    fn find_by_tag_lookup(&self, tag_key_lookup: &str) -> Result<Vec<ProvisionedEntry>>;

    /// Every entry, ordered by key.
    fn entries(&self) -> Result<Vec<ProvisionedEntry>>;

    fn contains(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Write capability. Only the completion tracker holds one.
pub trait LedgerWriter: LedgerReader {
    /// Insert or replace the entry for its key.
    fn upsert(&self, entry: ProvisionedEntry) -> Result<()>;

    /// Remove an entry. Returns whether it was present.
    fn remove(&self, key: &LedgerKey) -> Result<bool>;
}

/// Summary counts over a set of ledger entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub groups: usize,
    pub users: usize,
    pub tag_derived: usize,
    pub accounts: usize,
    pub principals: usize,
}

impl LedgerStats {
    pub fn from_entries(entries: &[ProvisionedEntry]) -> Self {
        let accounts: std::collections::HashSet<&str> = entries
            .iter()
            .map(|e| e.key.target_account_id.as_str())
            .collect();
        let principals: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.key.principal_id.as_str()).collect();
        Self {
            total: entries.len(),
            groups: entries
                .iter()
                .filter(|e| e.principal_type == PrincipalType::Group)
                .count(),
            users: entries
                .iter()
                .filter(|e| e.principal_type == PrincipalType::User)
                .count(),
            tag_derived: entries.iter().filter(|e| e.tag_key_lookup.is_some()).count(),
            accounts: accounts.len(),
            principals: principals.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_permission_set_id() {
        let ps = PermissionSetId::new("arn:aws:sso:::permissionSet/ssoins-abc/ps-def");
        let key = LedgerKey::derive("g-1", "123456789012", &ps).unwrap();
        assert_eq!(key.to_string(), "g-1@123456789012@ssoins-abc@ps-def");
        assert_eq!(key.permission_set_id(), ps);
    }

    #[test]
    fn test_key_parse_allows_at_in_principal() {
        let key: LedgerKey = "jane@corp@123456789012@ssoins-abc@ps-def".parse().unwrap();
        assert_eq!(key.principal_id, "jane@corp");
        assert_eq!(key.target_account_id, "123456789012");
        assert_eq!(key.permission_set_part, "ps-def");
    }

    #[test]
    fn test_key_parse_rejects_short_keys() {
        assert!("g-1@123456789012@ps".parse::<LedgerKey>().is_err());
        assert!("g-1@@ssoins-abc@ps-def".parse::<LedgerKey>().is_err());
    }

    #[test]
    fn test_unqualified_permission_set_cannot_form_key() {
        let ps = PermissionSetId::new("ReadOnly-id");
        assert!(LedgerKey::derive("g-1", "123456789012", &ps).is_err());
    }

    #[test]
    fn test_stats_counts() {
        let ps = PermissionSetId::new("arn:aws:sso:::permissionSet/ssoins-abc/ps-def");
        let entries = vec![
            ProvisionedEntry {
                key: LedgerKey::derive("g-1", "111111111111", &ps).unwrap(),
                principal_type: PrincipalType::Group,
                tag_key_lookup: None,
                confirmed_at: Utc::now(),
            },
            ProvisionedEntry {
                key: LedgerKey::derive("u-1", "111111111111", &ps).unwrap(),
                principal_type: PrincipalType::User,
                tag_key_lookup: Some("team^111111111111".into()),
                confirmed_at: Utc::now(),
            },
        ];
        let stats = LedgerStats::from_entries(&entries);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.users, 1);
        assert_eq!(stats.tag_derived, 1);
        assert_eq!(stats.accounts, 1);
        assert_eq!(stats.principals, 2);
    }
}
