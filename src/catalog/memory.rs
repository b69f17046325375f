use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{
    LinkStore, PermissionSetCatalog, PermissionSetRecord, PrincipalCache, PrincipalCacheEntry,
};
use crate::assignment::PrincipalType;
use crate::error::Result;
use crate::link::{Link, ScopeType};

/// In-memory link store keyed by descriptor.
#[derive(Default)]
pub struct MemoryLinkStore {
    links: RwLock<BTreeMap<String, Link>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filtered<F>(&self, predicate: F) -> Vec<Link>
    where
        F: Fn(&Link) -> bool,
    {
        let links = self.links.read().unwrap_or_else(|e| e.into_inner());
        links.values().filter(|l| predicate(l)).cloned().collect()
    }
}

impl LinkStore for MemoryLinkStore {
    fn put(&self, link: Link) -> Result<()> {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        links.entry(link.id()).or_insert(link);
        Ok(())
    }

    fn remove(&self, link_id: &str) -> Result<Option<Link>> {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        Ok(links.remove(link_id))
    }

    fn get(&self, link_id: &str) -> Result<Option<Link>> {
        let links = self.links.read().unwrap_or_else(|e| e.into_inner());
        Ok(links.get(link_id).cloned())
    }

    fn by_principal(
        &self,
        principal_name: &str,
        principal_type: PrincipalType,
    ) -> Result<Vec<Link>> {
        Ok(self.filtered(|l| {
            l.principal_name() == principal_name && l.principal_type == principal_type
        }))
    }

    fn by_permission_set_name(&self, permission_set_name: &str) -> Result<Vec<Link>> {
        Ok(self.filtered(|l| l.permission_set_name() == permission_set_name))
    }

    fn by_scope(&self, scope_type: ScopeType, scope_value: &str) -> Result<Vec<Link>> {
        Ok(self.filtered(|l| {
            l.scope().scope_type() == scope_type && l.scope().value() == scope_value
        }))
    }

    fn all(&self) -> Result<Vec<Link>> {
        Ok(self.filtered(|_| true))
    }
}

/// In-memory principal cache.
#[derive(Default)]
pub struct MemoryPrincipalCache {
    entries: RwLock<HashMap<(String, PrincipalType), PrincipalCacheEntry>>,
}

impl MemoryPrincipalCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrincipalCache for MemoryPrincipalCache {
    fn get(&self, principal_name: &str, principal_type: PrincipalType) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&(principal_name.to_string(), principal_type))
            .map(|e| e.principal_id.clone()))
    }

    fn upsert(&self, entry: PrincipalCacheEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (entry.principal_name.clone(), entry.principal_type),
            entry,
        );
        Ok(())
    }

    fn get_by_id(&self, principal_id: &str) -> Result<Option<PrincipalCacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .values()
            .find(|e| e.principal_id == principal_id)
            .cloned())
    }

    fn remove_by_id(&self, principal_id: &str) -> Result<Option<PrincipalCacheEntry>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let key = entries
            .iter()
            .find(|(_, e)| e.principal_id == principal_id)
            .map(|(k, _)| k.clone());
        Ok(key.and_then(|k| entries.remove(&k)))
    }
}

/// In-memory permission-set catalog keyed by name.
#[derive(Default)]
pub struct MemoryPermissionSetCatalog {
    records: RwLock<HashMap<String, PermissionSetRecord>>,
}

impl MemoryPermissionSetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from(&self, records: Vec<PermissionSetRecord>) {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            map.insert(record.name.clone(), record);
        }
    }
}

impl PermissionSetCatalog for MemoryPermissionSetCatalog {
    fn get(&self, name: &str) -> Result<Option<PermissionSetRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(name).cloned())
    }

    fn put(&self, record: PermissionSetRecord) -> Result<Option<PermissionSetRecord>> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(records.insert(record.name.clone(), record))
    }

    fn remove(&self, name: &str) -> Result<Option<PermissionSetRecord>> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(name))
    }
}
