//! File-backed ledger shared between handles and threads.

use std::sync::Arc;

use access_reconciler::assignment::{PermissionSetId, PrincipalType};
use access_reconciler::ledger::{
    JsonlLedger, LedgerKey, LedgerReader, LedgerStats, LedgerWriter, ProvisionedEntry,
};
use chrono::Utc;
use tempfile::TempDir;

fn entry(principal: &str, account: &str, tag: Option<&str>) -> ProvisionedEntry {
    let ps = PermissionSetId::new("arn:aws:sso:::permissionSet/ssoins-1/ps-readonly");
    ProvisionedEntry {
        key: LedgerKey::derive(principal, account, &ps).unwrap(),
        principal_type: PrincipalType::Group,
        tag_key_lookup: tag.map(str::to_string),
        confirmed_at: Utc::now(),
    }
}

#[test]
fn separate_handles_see_each_others_writes() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ledger.jsonl");

    let writer = JsonlLedger::new(&path);
    writer.upsert(entry("g-1", "222222222222", None)).unwrap();

    let reader = JsonlLedger::new(&path);
    assert_eq!(reader.entries().unwrap().len(), 1);
    assert!(reader
        .contains(&entry("g-1", "222222222222", None).key)
        .unwrap());
}

#[test]
fn concurrent_writers_lose_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ledger.jsonl");
    let ledger = Arc::new(JsonlLedger::new(&path));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for j in 0..5 {
                    let account = format!("{:012}", i * 100 + j);
                    ledger.upsert(entry("g-1", &account, None)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(JsonlLedger::new(&path).entries().unwrap().len(), 40);
}

#[test]
fn tag_lookup_and_stats() {
    let tmp = TempDir::new().unwrap();
    let ledger = JsonlLedger::new(tmp.path().join("nested/dir/ledger.jsonl"));

    ledger
        .upsert(entry("g-1", "222222222222", Some("team^222222222222")))
        .unwrap();
    ledger.upsert(entry("g-2", "222222222222", None)).unwrap();
    ledger
        .upsert(entry("g-1", "333333333333", Some("team^333333333333")))
        .unwrap();

    let tagged = ledger.find_by_tag_lookup("team^222222222222").unwrap();
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].key.principal_id, "g-1");

    let stats = LedgerStats::from_entries(&ledger.entries().unwrap());
    assert_eq!(stats.total, 3);
    assert_eq!(stats.tag_derived, 2);
    assert_eq!(stats.accounts, 2);
    assert_eq!(stats.principals, 2);

    assert!(ledger.remove(&tagged[0].key).unwrap());
    assert!(!ledger.remove(&tagged[0].key).unwrap());
    assert_eq!(ledger.entries().unwrap().len(), 2);
}
