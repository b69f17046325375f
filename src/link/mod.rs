pub mod descriptor;

use serde::{Deserialize, Serialize};

use crate::assignment::PrincipalType;
use crate::error::Result;

pub use descriptor::{LinkDescriptor, SENTINEL};

/// The four ways a link selects target accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Account,
    #[serde(rename = "ou_id")]
    Ou,
    Root,
    AccountTag,
}

impl ScopeType {
    /// Token used for this scope type in link descriptors.
    pub fn token(&self) -> &'static str {
        match self {
            ScopeType::Account => "account",
            ScopeType::Ou => "ou_id",
            ScopeType::Root => "root",
            ScopeType::AccountTag => "account_tag",
        }
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl std::str::FromStr for ScopeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "account" => Ok(ScopeType::Account),
            "ou_id" | "ou" => Ok(ScopeType::Ou),
            "root" => Ok(ScopeType::Root),
            "account_tag" => Ok(ScopeType::AccountTag),
            _ => Err(format!("unknown scope type: {s}")),
        }
    }
}

/// A concrete target selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Account { account_id: String },
    Ou { ou_id: String },
    Root,
    AccountTag { key: String, value: String },
}

impl Scope {
    pub fn scope_type(&self) -> ScopeType {
        match self {
            Scope::Account { .. } => ScopeType::Account,
            Scope::Ou { .. } => ScopeType::Ou,
            Scope::Root => ScopeType::Root,
            Scope::AccountTag { .. } => ScopeType::AccountTag,
        }
    }

    /// The scope value as it appears in a descriptor (`all` for root,
    /// `key^value` for tags).
    pub fn value(&self) -> String {
        match self {
            Scope::Account { account_id } => account_id.clone(),
            Scope::Ou { ou_id } => ou_id.clone(),
            Scope::Root => descriptor::ROOT_VALUE.to_string(),
            Scope::AccountTag { key, value } => format!("{key}^{value}"),
        }
    }
}

/// A desired-state record: principal x permission set x scope.
///
/// Immutable once created; its identity is the descriptor string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub descriptor: LinkDescriptor,
    #[serde(default)]
    pub principal_type: PrincipalType,
}

impl Link {
    pub fn new(descriptor: LinkDescriptor, principal_type: PrincipalType) -> Self {
        Self {
            descriptor,
            principal_type,
        }
    }

    /// Parse a descriptor string into a link.
    pub fn parse(descriptor: &str, principal_type: PrincipalType) -> Result<Self> {
        Ok(Self::new(descriptor.parse()?, principal_type))
    }

    /// The composite key identifying this link.
    pub fn id(&self) -> String {
        self.descriptor.to_string()
    }

    pub fn scope(&self) -> &Scope {
        &self.descriptor.scope
    }

    pub fn permission_set_name(&self) -> &str {
        &self.descriptor.permission_set_name
    }

    pub fn principal_name(&self) -> &str {
        &self.descriptor.principal_name
    }
}
