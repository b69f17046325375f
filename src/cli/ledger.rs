use std::path::Path;

use crate::error::Result;
use crate::ledger::{JsonlLedger, LedgerReader, LedgerStats};

/// Print confirmed assignments, optionally narrowed to one account or
/// principal.
pub async fn run_list(path: &Path, account: Option<&str>, principal: Option<&str>) -> Result<()> {
    let ledger = JsonlLedger::new(path);
    let entries: Vec<_> = ledger
        .entries()?
        .into_iter()
        .filter(|e| account.map_or(true, |a| e.key.target_account_id == a))
        .filter(|e| principal.map_or(true, |p| e.key.principal_id == p))
        .collect();

    if entries.is_empty() {
        eprintln!("access-reconciler: no confirmed assignments in {}", path.display());
        return Ok(());
    }

    for entry in &entries {
        println!(
            "{}  {}  account={}  permission_set={}  confirmed={}{}",
            entry.key.principal_id,
            entry.principal_type,
            entry.key.target_account_id,
            entry.key.permission_set_id(),
            entry.confirmed_at.format("%Y-%m-%dT%H:%M:%SZ"),
            entry
                .tag_key_lookup
                .as_deref()
                .map(|t| format!("  tag={t}"))
                .unwrap_or_default(),
        );
    }
    eprintln!("{} assignment(s)", entries.len());
    Ok(())
}

/// Print summary counts as JSON.
pub async fn run_stats(path: &Path) -> Result<()> {
    let ledger = JsonlLedger::new(path);
    let stats = LedgerStats::from_entries(&ledger.entries()?);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
