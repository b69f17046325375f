//! Link descriptor grammar.
//!
//! ```text
//! descriptor     = scope-type "." scope-value "." permission-set "." principal "." "ssofile"
//! scope-type     = "root" / "ou_id" / "account" / "account_tag"
//! scope-value    = "all"                          ; root
//!                / "ou-" 4alnum "-" 8alnum        ; ou_id
//!                / 12DIGIT                        ; account
//!                / tag-key "^" tag-value          ; account_tag
//! permission-set = 1*32( word / "+" / "=" / "," / "@" / "-" )
//! principal      = 1*( alnum / "-" / "_" / "@" / "." / space )
//! ```
//!
//! Only the principal may contain the `.` delimiter; it is recovered by
//! joining every token between the permission set and the trailing sentinel.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Scope, ScopeType};
use crate::error::{ReconcileError, Result};

pub const DELIMITER: char = '.';
pub const SENTINEL: &str = "ssofile";
pub const ROOT_VALUE: &str = "all";
pub const TAG_SEPARATOR: char = '^';

static OU_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ou-[a-z0-9]{4}-[a-z0-9]{8}$").expect("static regex"));
static ACCOUNT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{12}$").expect("static regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w+=,@-]{1,128})\^([\w+=,@-]{1,256})$").expect("static regex")
});
static PERMISSION_SET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w+=,@-]{1,32}$").expect("static regex"));
static PRINCIPAL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-_@.\s]+$").expect("static regex"));

/// Parsed form of a link's composite key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LinkDescriptor {
    pub scope: Scope,
    pub permission_set_name: String,
    pub principal_name: String,
}

impl LinkDescriptor {
    /// Build a descriptor from parts, validating each against the grammar.
    pub fn new(
        scope: Scope,
        permission_set_name: impl Into<String>,
        principal_name: impl Into<String>,
    ) -> Result<Self> {
        let descriptor = Self {
            scope,
            permission_set_name: permission_set_name.into(),
            principal_name: principal_name.into(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ReconcileError::InvalidLink {
            descriptor: self.to_string(),
            reason,
        };

        match &self.scope {
            Scope::Root => {}
            Scope::Ou { ou_id } => {
                if !OU_ID.is_match(ou_id) {
                    return Err(invalid(format!("'{ou_id}' is not an organizational unit id")));
                }
            }
            Scope::Account { account_id } => {
                if !ACCOUNT_ID.is_match(account_id) {
                    return Err(invalid(format!("'{account_id}' is not a 12-digit account id")));
                }
            }
            Scope::AccountTag { key, value } => {
                if !TAG.is_match(&format!("{key}{TAG_SEPARATOR}{value}")) {
                    return Err(invalid(format!("'{key}^{value}' is not a valid tag pair")));
                }
            }
        }

        if !PERMISSION_SET_NAME.is_match(&self.permission_set_name) {
            return Err(invalid(format!(
                "permission set name '{}' must be 1-32 characters of [\\w+=,@-]",
                self.permission_set_name
            )));
        }

        if !PRINCIPAL_NAME.is_match(&self.principal_name) {
            return Err(invalid(format!(
                "principal name '{}' contains unsupported characters",
                self.principal_name
            )));
        }

        Ok(())
    }
}

fn parse_scope(descriptor: &str, scope_type: ScopeType, value: &str) -> Result<Scope> {
    let invalid = |reason: String| ReconcileError::InvalidLink {
        descriptor: descriptor.to_string(),
        reason,
    };

    match scope_type {
        ScopeType::Root => {
            if value != ROOT_VALUE {
                return Err(invalid(format!(
                    "root scope value must be '{ROOT_VALUE}', got '{value}'"
                )));
            }
            Ok(Scope::Root)
        }
        ScopeType::Ou => Ok(Scope::Ou {
            ou_id: value.to_string(),
        }),
        ScopeType::Account => Ok(Scope::Account {
            account_id: value.to_string(),
        }),
        ScopeType::AccountTag => {
            let (key, tag_value) = value
                .split_once(TAG_SEPARATOR)
                .ok_or_else(|| invalid(format!("tag scope '{value}' is missing '^'")))?;
            Ok(Scope::AccountTag {
                key: key.to_string(),
                value: tag_value.to_string(),
            })
        }
    }
}

impl std::str::FromStr for LinkDescriptor {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ReconcileError::InvalidLink {
            descriptor: s.to_string(),
            reason: reason.to_string(),
        };

        let tokens: Vec<&str> = s.split(DELIMITER).collect();
        if tokens.len() < 5 {
            return Err(invalid(
                "expected <scope>.<value>.<permission-set>.<principal>.ssofile",
            ));
        }
        if tokens[tokens.len() - 1] != SENTINEL {
            return Err(invalid("missing trailing 'ssofile' sentinel"));
        }

        let scope_type: ScopeType = tokens[0]
            .parse()
            .map_err(|e: String| invalid(e.as_str()))?;
        let scope = parse_scope(s, scope_type, tokens[1])?;
        let principal_name = tokens[3..tokens.len() - 1].join(".");

        let descriptor = LinkDescriptor {
            scope,
            permission_set_name: tokens[2].to_string(),
            principal_name,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl std::fmt::Display for LinkDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{SENTINEL}",
            self.scope.scope_type(),
            self.scope.value(),
            self.permission_set_name,
            self.principal_name
        )
    }
}

impl TryFrom<String> for LinkDescriptor {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LinkDescriptor> for String {
    fn from(value: LinkDescriptor) -> Self {
        value.to_string()
    }
}
