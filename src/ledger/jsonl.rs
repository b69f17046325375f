use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{LedgerKey, LedgerReader, LedgerWriter, ProvisionedEntry};
use crate::error::{ReconcileError, Result};

/// File-backed ledger: one JSON entry per line.
///
/// Every write is a locked read-modify-write that lands through a temp file
/// and a rename, so readers never observe a half-written ledger and separate
/// processes sharing the file serialize on an advisory lock.
pub struct JsonlLedger {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Read all entries, keyed by ledger key. Later lines win.
    pub fn read_file(path: &Path) -> Result<BTreeMap<LedgerKey, ProvisionedEntry>> {
        let mut entries = BTreeMap::new();
        if !path.exists() {
            return Ok(entries);
        }
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ProvisionedEntry>(trimmed) {
                Ok(entry) => {
                    entries.insert(entry.key.clone(), entry);
                }
                Err(e) => {
                    tracing::warn!(
                        "skipping malformed ledger line {} in {}: {}",
                        line_num + 1,
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok(entries)
    }

    fn write_file(path: &Path, entries: &BTreeMap<LedgerKey, ProvisionedEntry>) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            for entry in entries.values() {
                let json = serde_json::to_string(entry)?;
                writeln!(file, "{}", json)?;
            }
            file.sync_all()?;
        }
        set_file_permissions_0600(&tmp_path);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn modify<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<LedgerKey, ProvisionedEntry>) -> T,
    {
        let _local = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let _lock = FileLock::acquire(&self.path)?;

        let mut entries = Self::read_file(&self.path)?;
        let out = f(&mut entries);
        Self::write_file(&self.path, &entries)?;
        Ok(out)
    }
}

impl LedgerReader for JsonlLedger {
    fn get(&self, key: &LedgerKey) -> Result<Option<ProvisionedEntry>> {
        Ok(Self::read_file(&self.path)?.remove(key))
    }

    fn find_by_tag_lookup(&self, tag_key_lookup: &str) -> Result<Vec<ProvisionedEntry>> {
        Ok(Self::read_file(&self.path)?
            .into_values()
            .filter(|e| e.tag_key_lookup.as_deref() == Some(tag_key_lookup))
            .collect())
    }

    fn entries(&self) -> Result<Vec<ProvisionedEntry>> {
        Ok(Self::read_file(&self.path)?.into_values().collect())
    }
}

impl LedgerWriter for JsonlLedger {
    fn upsert(&self, entry: ProvisionedEntry) -> Result<()> {
        self.modify(|entries| {
            entries.insert(entry.key.clone(), entry);
        })
    }

    fn remove(&self, key: &LedgerKey) -> Result<bool> {
        self.modify(|entries| entries.remove(key).is_some())
    }
}

#[cfg(unix)]
fn set_file_permissions_0600(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    let _ = fs::set_permissions(path, perms);
}

#[cfg(not(unix))]
fn set_file_permissions_0600(_path: &Path) {}

/// Advisory lock on `<ledger>.lock`, released on drop.
struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self> {
        let lock_path = path.with_extension("lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        flock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &fs::File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if ret != 0 {
        return Err(ReconcileError::Storage {
            reason: format!("flock failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{PermissionSetId, PrincipalType};
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(principal: &str, account: &str) -> ProvisionedEntry {
        let ps = PermissionSetId::new("arn:aws:sso:::permissionSet/ssoins-1/ps-1");
        ProvisionedEntry {
            key: LedgerKey::derive(principal, account, &ps).unwrap(),
            principal_type: PrincipalType::Group,
            tag_key_lookup: None,
            confirmed_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let tmp = TempDir::new().unwrap();
        let ledger = JsonlLedger::new(tmp.path().join("ledger.jsonl"));
        let e = entry("g-1", "123456789012");
        ledger.upsert(e.clone()).unwrap();
        assert_eq!(ledger.get(&e.key).unwrap(), Some(e));
    }

    #[test]
    fn test_upsert_twice_keeps_one_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        let ledger = JsonlLedger::new(&path);
        ledger.upsert(entry("g-1", "123456789012")).unwrap();
        ledger.upsert(entry("g-1", "123456789012")).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn test_remove_rewrites_file() {
        let tmp = TempDir::new().unwrap();
        let ledger = JsonlLedger::new(tmp.path().join("ledger.jsonl"));
        let a = entry("g-1", "111111111111");
        let b = entry("g-1", "222222222222");
        ledger.upsert(a.clone()).unwrap();
        ledger.upsert(b.clone()).unwrap();
        assert!(ledger.remove(&a.key).unwrap());
        let remaining = ledger.entries().unwrap();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        let good = serde_json::to_string(&entry("g-1", "123456789012")).unwrap();
        fs::write(&path, format!("not json\n{good}\n\n")).unwrap();
        let ledger = JsonlLedger::new(&path);
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let ledger = JsonlLedger::new(tmp.path().join("absent.jsonl"));
        assert!(ledger.entries().unwrap().is_empty());
    }
}
