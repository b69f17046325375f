use dashmap::DashMap;

use super::{LedgerKey, LedgerReader, LedgerWriter, ProvisionedEntry};
use crate::error::Result;

/// In-process ledger. Point operations only touch one shard of the map.
#[derive(Default)]
pub struct MemoryLedger {
    entries: DashMap<LedgerKey, ProvisionedEntry>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from previously persisted entries.
    pub fn load_from(&self, entries: Vec<ProvisionedEntry>) {
        for entry in entries {
            self.entries.insert(entry.key.clone(), entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LedgerReader for MemoryLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<ProvisionedEntry>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn find_by_tag_lookup(&self, tag_key_lookup: &str) -> Result<Vec<ProvisionedEntry>> {
        let mut found: Vec<ProvisionedEntry> = self
            .entries
            .iter()
            .filter(|e| e.tag_key_lookup.as_deref() == Some(tag_key_lookup))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    fn entries(&self) -> Result<Vec<ProvisionedEntry>> {
        let mut all: Vec<ProvisionedEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}

impl LedgerWriter for MemoryLedger {
    fn upsert(&self, entry: ProvisionedEntry) -> Result<()> {
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &LedgerKey) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}
