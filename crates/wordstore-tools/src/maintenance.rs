//! Directory-level maintenance: forced recovery, log purging and a
//! read-only consistency check.

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use wordstore_core::datafile::{data_file_path, list_names, read_data_file, LoadMode};
use wordstore_core::log::{read_checkpoint, scan};
use wordstore_core::{
    check_zombies, BackendKind, Codec, Config, Datastore, MetaKey, RecoveryReport, StoreError,
    ZombieCheck,
};

use crate::error::ToolResult;

/// Recover `dir`, replaying committed log records into its lists.
pub fn recover(dir: &Path, config: &Config, catastrophic: bool) -> ToolResult<RecoveryReport> {
    let ds = Datastore::new(config.clone())?;
    Ok(ds.recover(dir, catastrophic)?)
}

/// Remove log segments already folded into the lists. Returns the number
/// removed.
pub fn purge_logs(dir: &Path, config: &Config) -> ToolResult<usize> {
    let ds = Datastore::new(config.clone())?;
    Ok(ds.purge_logs(dir)?)
}

/// Per-list findings of [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListReport {
    pub name: String,
    pub records: usize,
    /// Value of `.WORDLIST_VERSION`, if present
    pub version: Option<u32>,
    pub byte_order_differs: bool,
    /// Records whose value does not decode
    pub malformed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub dir: PathBuf,
    pub lists: Vec<ListReport>,
    /// Committed transactions not yet folded into the lists
    pub pending_transactions: usize,
    /// Process-table cells left behind by dead writers
    pub zombies: usize,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check every list, the log past the checkpoint and the process table
/// without modifying anything. Damage is reported, not returned as an error.
pub fn verify(dir: &Path, config: &Config) -> ToolResult<VerifyReport> {
    if !dir.is_dir() {
        return Err(StoreError::NotFound {
            what: "directory",
            path: dir.to_path_buf(),
        }
        .into());
    }
    let buffer = config.scan_buffer_bytes();
    let mut report = VerifyReport {
        dir: dir.to_path_buf(),
        ..VerifyReport::default()
    };

    for name in list_names(dir)? {
        let path = data_file_path(dir, &name);
        let contents = match read_data_file(&path, LoadMode::Strict, buffer) {
            Ok(c) => c,
            Err(e) => {
                report.problems.push(format!("list '{name}': {e}"));
                continue;
            }
        };
        let codec = Codec::for_order(contents.header.byte_order);
        let mut list = ListReport {
            name: name.clone(),
            records: contents.entries.len(),
            version: None,
            byte_order_differs: codec.byte_order_differs(),
            malformed: 0,
        };
        for (token, raw) in &contents.entries {
            match codec.decode(raw) {
                Ok(rec) if token.as_slice() == MetaKey::WordlistVersion.token() => {
                    list.version = Some(rec.spam_count);
                }
                Ok(_) => {}
                Err(_) => list.malformed += 1,
            }
        }
        if list.malformed > 0 {
            let problem = format!("list '{name}': {} malformed record(s)", list.malformed);
            report.problems.push(problem);
        }
        if list.version.is_none() {
            report.problems.push(format!("list '{name}': missing schema version"));
        }
        report.lists.push(list);
    }

    if config.backend == BackendKind::Transactional {
        let pending = read_checkpoint(dir)
            .and_then(|from| scan(dir, from, LoadMode::Strict, buffer));
        match pending {
            Ok(log) => {
                report.pending_transactions = log.txns.len();
                if log.missing {
                    report.problems.push("log segments after the checkpoint are missing".into());
                }
            }
            Err(e) => report.problems.push(format!("log: {e}")),
        }
    }

    match check_zombies(dir) {
        Ok(ZombieCheck::Zombies(cells)) => {
            report.zombies = cells.len();
            report.problems.push(format!(
                "{} dead writer(s) in the process table; run recover",
                cells.len()
            ));
        }
        Ok(ZombieCheck::Clean | ZombieCheck::NoLockFile) => {}
        Err(e) => report.problems.push(format!("process table: {e}")),
    }

    if report.is_clean() {
        info!(dir = %dir.display(), lists = report.lists.len(), "Verified store");
    } else {
        for problem in &report.problems {
            warn!(dir = %dir.display(), "{problem}");
        }
    }
    Ok(report)
}
