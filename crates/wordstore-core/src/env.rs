//! Shared environment for the transactional backend.
//!
//! One [`Environment`] exists per store directory per [`Datastore`]. It owns
//! the process table cell, the write-ahead log writer and the in-memory images
//! of every list opened through it.
//!
//! Two whole-file locks coordinate processes:
//!
//! - `env.lock` is held shared by every open environment and exclusively
//!   while recovery runs, so recovery never overlaps a live opener.
//! - `txn.lock` is held exclusively for the span of a transaction or a
//!   checkpoint and shared while loading lists or catching up with the log.
//!
//! Committed transactions reach the list files only at checkpoint time. Until
//! then every opener reconstructs current state by replaying the log from the
//! checkpoint over the data file.
//!
//! [`Datastore`]: crate::datastore::Datastore

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::Config;
use crate::datafile::{data_file_path, list_names, validate_list_name, LoadMode};
use crate::error::{StoreError, StoreResult};
use crate::lockcell::{LockCellTable, SetLock, ZombieCheck};
use crate::log::{
    self, read_checkpoint, remove_segments_before, segments, truncate_log, write_checkpoint,
    CommittedTxn, LogOp, LogScan, LogWriter, Lsn, CHECKPOINT_FILE,
};
use crate::platform::try_lock_file;
use crate::retry::lock_file_with_backoff;
use crate::table::Table;

/// Whole-environment lock file
pub const ENV_LOCK_FILE: &str = "env.lock";

/// Transaction lock file
pub const TXN_LOCK_FILE: &str = "txn.lock";

/// Environment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Unopened,
    CheckingRecovery,
    Recovering,
    Open,
    Closed,
    /// Recovery failed; every operation is refused
    Failed,
}

/// Recovery strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Replay from the last checkpoint, refusing damaged records
    Normal,
    /// Replay the whole log, skipping damaged records, and rewrite every list
    Catastrophic,
}

/// What a recovery run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub kind: RecoveryKind,
    /// Committed transactions replayed
    pub transactions: usize,
    /// List files rewritten
    pub lists: usize,
    /// New checkpoint position
    pub checkpoint: Lsn,
    /// Damaged log regions skipped (catastrophic only)
    pub skipped: usize,
    /// Abandoned process table cells reset
    pub zombies_cleared: usize,
}

/// Per-directory shared state.
pub struct Environment {
    dir: PathBuf,
    config: Config,
    env_lock: File,
    env_lock_path: PathBuf,
    txn_lock: File,
    txn_lock_path: PathBuf,
    inner: Mutex<EnvInner>,
}

struct EnvInner {
    state: EnvState,
    cells: LockCellTable,
    log: LogWriter,
    /// Log position the loaded tables reflect; `None` until a list is loaded
    applied: Option<Lsn>,
    tables: HashMap<String, Table>,
    /// Exclusive `txn.lock` hold count
    txn_depth: usize,
    /// Write-mode handles open through this environment
    writers: usize,
    last_checkpoint: Instant,
    log_bytes: u64,
    /// Skip cleanup on drop, leaving the cell InUse like a killed process
    abandoned: bool,
}

fn open_lock_file(path: &Path) -> StoreResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e, "Failed to open lock file"))
}

fn purged(dir: &Path, from: Lsn) -> StoreError {
    StoreError::Corrupted {
        path: dir.join(CHECKPOINT_FILE),
        offset: 0,
        reason: format!("log position {} precedes the oldest log segment", from),
    }
}

/// Replay `txns` into the list files of `dir`.
///
/// Lists present in `current` are written from that image, which already
/// reflects every op. With `all_lists`, lists the log never mentions are
/// rewritten too.
fn apply_to_data_files(
    dir: &Path,
    txns: &[CommittedTxn],
    mode: LoadMode,
    buffer_bytes: usize,
    all_lists: bool,
    current: Option<&HashMap<String, Table>>,
) -> StoreResult<usize> {
    let mut by_list: BTreeMap<String, Vec<&LogOp>> = BTreeMap::new();
    for op in txns.iter().flat_map(|t| t.ops.iter()) {
        by_list.entry(op.list.clone()).or_default().push(op);
    }
    if all_lists {
        for name in list_names(dir)? {
            by_list.entry(name).or_default();
        }
    }

    for (name, ops) in &by_list {
        if validate_list_name(name).is_err() {
            return Err(StoreError::Corrupted {
                path: dir.to_path_buf(),
                offset: 0,
                reason: format!("log names invalid list '{}'", name),
            });
        }
        if let Some(table) = current.and_then(|t| t.get(name)) {
            table.rewrite(buffer_bytes)?;
            continue;
        }
        let path = data_file_path(dir, name);
        let mut table = match Table::load(&path, mode, buffer_bytes) {
            Ok(t) => t,
            Err(StoreError::NotFound { .. }) => Table::empty(&path),
            Err(e) => return Err(e),
        };
        for op in ops {
            table.apply(op);
        }
        table.rewrite(buffer_bytes)?;
    }
    Ok(by_list.len())
}

/// Fold committed log transactions into the list files and checkpoint.
///
/// The caller must hold `env.lock` exclusively.
pub(crate) fn run_recovery(
    dir: &Path,
    config: &Config,
    kind: RecoveryKind,
) -> StoreResult<RecoveryReport> {
    let buffer = config.scan_buffer_bytes();
    let (from, mode, all_lists) = match kind {
        RecoveryKind::Normal => (read_checkpoint(dir)?, LoadMode::Strict, false),
        RecoveryKind::Catastrophic => {
            let first = segments(dir)?.first().copied().unwrap_or(Lsn::START.segment);
            (Lsn::new(first, 0), LoadMode::Lenient, true)
        }
    };
    info!(dir = %dir.display(), ?kind, %from, "Running recovery");

    let scan = log::scan(dir, from, mode, buffer)?;
    if scan.missing {
        return Err(purged(dir, from));
    }
    let lists = apply_to_data_files(dir, &scan.txns, mode, buffer, all_lists, None)?;
    truncate_log(dir, scan.commit_end)?;
    write_checkpoint(dir, scan.commit_end)?;

    info!(
        dir = %dir.display(),
        transactions = scan.txns.len(),
        lists,
        skipped = scan.skipped,
        checkpoint = %scan.commit_end,
        "Recovery complete"
    );
    Ok(RecoveryReport {
        kind,
        transactions: scan.txns.len(),
        lists,
        checkpoint: scan.commit_end,
        skipped: scan.skipped,
        zombies_cleared: 0,
    })
}

/// Recover a store directory that nobody has open.
///
/// Fails with `Busy` when another environment holds `env.lock`.
pub fn recover_directory(
    dir: &Path,
    config: &Config,
    catastrophic: bool,
) -> StoreResult<RecoveryReport> {
    if !dir.is_dir() {
        return Err(StoreError::NotFound {
            what: "directory",
            path: dir.to_path_buf(),
        });
    }
    let lock_path = dir.join(ENV_LOCK_FILE);
    let env_lock = open_lock_file(&lock_path)?;
    lock_file_with_backoff(&env_lock, &lock_path, true, config.lock_retries).map_err(|e| match e {
        StoreError::LockContention { .. } => StoreError::Busy {
            dir: dir.to_path_buf(),
            reason: "the store is open in another process".into(),
        },
        e => e,
    })?;

    let result = recover_locked(dir, config, catastrophic);
    if let Err(e) = FileExt::unlock(&env_lock) {
        warn!(path = %lock_path.display(), error = %e, "Failed to release environment lock");
    }
    result
}

fn recover_locked(dir: &Path, config: &Config, catastrophic: bool) -> StoreResult<RecoveryReport> {
    let cells = LockCellTable::open_or_create(dir, config.max_writers)?;
    let live = cells.live_writers()?;
    if live > 0 {
        return Err(StoreError::Busy {
            dir: dir.to_path_buf(),
            reason: format!("{live} live writers"),
        });
    }
    let kind = if catastrophic {
        RecoveryKind::Catastrophic
    } else {
        RecoveryKind::Normal
    };
    let mut report =
        run_recovery(dir, config, kind).map_err(|e| StoreError::RecoveryFailed {
            dir: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
    if let ZombieCheck::Zombies(zombies) = cells.check_zombies()? {
        for cell in zombies {
            if cells.clear_zombie(cell)? {
                report.zombies_cleared += 1;
            }
        }
    }
    Ok(report)
}

fn checkpoint_due(inner: &EnvInner, log_kb: u64, age_min: u64) -> bool {
    if log_kb == 0 && age_min == 0 {
        return true;
    }
    (log_kb > 0 && inner.log_bytes >= log_kb * 1024)
        || (age_min > 0 && inner.last_checkpoint.elapsed() >= Duration::from_secs(age_min * 60))
}

impl Environment {
    /// Open the environment in `dir`, recovering first if a writer died.
    pub fn open(dir: &Path, config: &Config) -> StoreResult<Arc<Self>> {
        debug!(dir = %dir.display(), "Opening environment");
        let env_lock_path = dir.join(ENV_LOCK_FILE);
        let env_lock = open_lock_file(&env_lock_path)?;
        let txn_lock_path = dir.join(TXN_LOCK_FILE);
        let txn_lock = open_lock_file(&txn_lock_path)?;
        let cells = LockCellTable::open_or_create(dir, config.max_writers)?;

        let env = Environment {
            dir: dir.to_path_buf(),
            config: config.clone(),
            env_lock,
            env_lock_path,
            txn_lock,
            txn_lock_path,
            inner: Mutex::new(EnvInner {
                state: EnvState::Unopened,
                cells,
                log: LogWriter::new(dir, config.log_segment_bytes),
                applied: None,
                tables: HashMap::new(),
                txn_depth: 0,
                writers: 0,
                last_checkpoint: Instant::now(),
                log_bytes: 0,
                abandoned: false,
            }),
        };
        env.startup()?;
        info!(dir = %dir.display(), "Environment open");
        Ok(Arc::new(env))
    }

    fn set_state(&self, inner: &mut EnvInner, state: EnvState) {
        debug!(
            dir = %self.dir.display(),
            from = ?inner.state,
            to = ?state,
            "Environment state change"
        );
        inner.state = state;
    }

    fn startup(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.set_state(&mut inner, EnvState::CheckingRecovery);

        let zombies = match inner.cells.check_zombies()? {
            ZombieCheck::Zombies(z) => z,
            _ => Vec::new(),
        };
        let exclusive = !zombies.is_empty()
            && try_lock_file(&self.env_lock, true)
                .map_err(|e| StoreError::io(&self.env_lock_path, e, "Failed to lock environment"))?;

        if exclusive {
            let recovered = self.recover_exclusive(&mut inner);
            // downgrade; flock converts in place
            let downgraded = FileExt::lock_shared(&self.env_lock);
            if let Err(e) = recovered {
                self.set_state(&mut inner, EnvState::Failed);
                return Err(e);
            }
            downgraded.map_err(|e| {
                StoreError::io(&self.env_lock_path, e, "Failed to downgrade environment lock")
            })?;
        } else {
            if !zombies.is_empty() {
                warn!(
                    dir = %self.dir.display(),
                    zombies = zombies.len(),
                    "Store is in use by other processes; deferring recovery of abandoned cells"
                );
            }
            FileExt::lock_shared(&self.env_lock)
                .map_err(|e| StoreError::io(&self.env_lock_path, e, "Failed to lock environment"))?;
        }

        self.set_state(&mut inner, EnvState::Open);
        Ok(())
    }

    fn recover_exclusive(&self, inner: &mut EnvInner) -> StoreResult<()> {
        // re-check under the exclusive lock; another opener may have recovered
        let zombies = match inner.cells.check_zombies()? {
            ZombieCheck::Zombies(z) => z,
            _ => return Ok(()),
        };
        self.set_state(inner, EnvState::Recovering);
        warn!(
            dir = %self.dir.display(),
            zombies = zombies.len(),
            "Writer died without closing; recovering"
        );

        let report = match run_recovery(&self.dir, &self.config, RecoveryKind::Normal) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Normal recovery failed; trying catastrophic recovery"
                );
                run_recovery(&self.dir, &self.config, RecoveryKind::Catastrophic).map_err(|e| {
                    error!(dir = %self.dir.display(), error = %e, "Catastrophic recovery failed");
                    StoreError::RecoveryFailed {
                        dir: self.dir.clone(),
                        reason: e.to_string(),
                    }
                })?
            }
        };
        for cell in zombies {
            inner.cells.clear_zombie(cell)?;
        }
        debug!(
            dir = %self.dir.display(),
            transactions = report.transactions,
            "Recovered environment"
        );
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> EnvState {
        self.inner.lock().state
    }

    fn ensure_open(&self, inner: &EnvInner) -> StoreResult<()> {
        match inner.state {
            EnvState::Open => Ok(()),
            EnvState::Failed => Err(StoreError::EnvironmentFailed {
                dir: self.dir.clone(),
            }),
            _ => Err(StoreError::NotFound {
                what: "open environment",
                path: self.dir.clone(),
            }),
        }
    }

    fn buffer(&self) -> usize {
        self.config.scan_buffer_bytes()
    }

    /// Committed log since the checkpoint, with the checkpoint it started at.
    fn scan_since_checkpoint(&self) -> StoreResult<(Lsn, LogScan)> {
        let from = read_checkpoint(&self.dir)?;
        let scan = log::scan(&self.dir, from, LoadMode::Strict, self.buffer())?;
        if scan.missing {
            return Err(purged(&self.dir, from));
        }
        Ok((from, scan))
    }

    fn load_list_file(&self, list: &str) -> StoreResult<Table> {
        let path = data_file_path(&self.dir, list);
        Table::load(&path, LoadMode::Strict, self.buffer())
    }

    fn lock_txn_file(&self, exclusive: bool) -> StoreResult<()> {
        let retries = self.config.lock_retries;
        lock_file_with_backoff(&self.txn_lock, &self.txn_lock_path, exclusive, retries)
    }

    fn unlock_txn_file(&self) {
        if let Err(e) = FileExt::unlock(&self.txn_lock) {
            error!(
                path = %self.txn_lock_path.display(),
                error = %e,
                "Failed to release transaction lock"
            );
        }
    }

    fn hold_exclusive(&self, inner: &mut EnvInner) -> StoreResult<()> {
        if inner.txn_depth == 0 {
            self.lock_txn_file(true)?;
        }
        inner.txn_depth += 1;
        Ok(())
    }

    fn release_exclusive(&self, inner: &mut EnvInner) {
        if inner.txn_depth == 0 {
            return;
        }
        inner.txn_depth -= 1;
        if inner.txn_depth == 0 {
            self.unlock_txn_file();
        }
    }

    fn with_exclusive<T>(
        &self,
        inner: &mut EnvInner,
        f: impl FnOnce(&mut EnvInner) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.hold_exclusive(inner)?;
        let result = f(inner);
        self.release_exclusive(inner);
        result
    }

    /// Run `f` with at least a shared `txn.lock`.
    fn with_view<T>(
        &self,
        inner: &mut EnvInner,
        f: impl FnOnce(&mut EnvInner) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if inner.txn_depth > 0 {
            return f(inner);
        }
        self.lock_txn_file(false)?;
        let result = f(inner);
        self.unlock_txn_file();
        result
    }

    fn catch_up(&self, inner: &mut EnvInner) -> StoreResult<()> {
        let Some(applied) = inner.applied else {
            return Ok(());
        };
        let scan = log::scan(&self.dir, applied, LoadMode::Strict, self.buffer())?;
        if scan.missing {
            debug!(dir = %self.dir.display(), "Log purged since last catch-up; reloading lists");
            return self.reload_tables(inner);
        }
        for op in scan.txns.iter().flat_map(|t| t.ops.iter()) {
            if let Some(table) = inner.tables.get_mut(&op.list) {
                table.apply(op);
            }
        }
        if !scan.txns.is_empty() {
            debug!(
                dir = %self.dir.display(),
                transactions = scan.txns.len(),
                to = %scan.commit_end,
                "Caught up with log"
            );
        }
        inner.applied = Some(scan.commit_end);
        Ok(())
    }

    fn reload_tables(&self, inner: &mut EnvInner) -> StoreResult<()> {
        let (_, scan) = self.scan_since_checkpoint()?;
        let names: Vec<String> = inner.tables.keys().cloned().collect();
        for name in names {
            let mut table = self.load_list_file(&name)?;
            for op in scan.txns.iter().flat_map(|t| t.ops.iter()).filter(|op| op.list == name) {
                table.apply(op);
            }
            inner.tables.insert(name, table);
        }
        inner.applied = Some(scan.commit_end);
        Ok(())
    }

    fn load_table(&self, inner: &mut EnvInner, list: &str) -> StoreResult<()> {
        self.catch_up(inner)?;
        if inner.tables.contains_key(list) {
            return Ok(());
        }
        let (_, scan) = self.scan_since_checkpoint()?;
        let mut table = self.load_list_file(list)?;
        for op in scan.txns.iter().flat_map(|t| t.ops.iter()).filter(|op| op.list == list) {
            table.apply(op);
        }
        inner.applied = Some(inner.applied.map_or(scan.commit_end, |a| a.max(scan.commit_end)));
        inner.tables.insert(list.to_string(), table);
        debug!(dir = %self.dir.display(), list, "Loaded list");
        Ok(())
    }

    fn create_list(&self, list: &str) -> StoreResult<bool> {
        let path = data_file_path(&self.dir, list);
        if path.exists() {
            return Ok(false);
        }
        Table::create(&path, self.buffer())?;
        info!(path = %path.display(), "Created wordlist");
        Ok(true)
    }

    /// Load `list`, creating it first when `create` is set.
    ///
    /// Returns the list's codec and whether this call created it.
    pub fn open_list(&self, list: &str, create: bool) -> StoreResult<(Codec, bool)> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        let mut created = false;
        if create && !data_file_path(&self.dir, list).exists() {
            created = self.with_exclusive(&mut inner, |_| self.create_list(list))?;
        }
        self.with_view(&mut inner, |inner| self.load_table(inner, list))?;
        let codec = inner.tables.get(list).map(Table::codec).unwrap_or_default();
        Ok((codec, created))
    }

    /// Claim a process table cell for a Write-mode handle.
    pub fn register_writer(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        if inner.cells.claimed().is_none() {
            let mut cleared = 0;
            loop {
                match inner.cells.set_lock()? {
                    SetLock::Claimed(cell) => {
                        debug!(dir = %self.dir.display(), cell, "Registered writer");
                        break;
                    }
                    SetLock::ZombieFound(cell) => {
                        // the log heals itself; a stale cell only needs resetting
                        warn!(
                            dir = %self.dir.display(),
                            cell,
                            "Claimed cell was abandoned by a dead writer"
                        );
                        inner.cells.clear_zombie(cell)?;
                        cleared += 1;
                        if cleared > inner.cells.cells() {
                            return Err(StoreError::LockTableFull {
                                path: self.dir.join(crate::lockcell::PROCESS_TABLE_FILE),
                                cells: inner.cells.cells(),
                            });
                        }
                    }
                }
            }
        }
        inner.writers += 1;
        Ok(())
    }

    /// Forget a Write-mode handle. The cell stays claimed until close.
    pub fn release_writer(&self) {
        let mut inner = self.inner.lock();
        inner.writers = inner.writers.saturating_sub(1);
    }

    /// Take the transaction lock and bring loaded lists up to date.
    pub fn begin_txn(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.hold_exclusive(&mut inner)?;
        if let Err(e) = self.catch_up(&mut inner) {
            self.release_exclusive(&mut inner);
            return Err(e);
        }
        Ok(())
    }

    /// Release one `begin_txn` hold.
    pub fn end_txn(&self) {
        let mut inner = self.inner.lock();
        self.release_exclusive(&mut inner);
    }

    /// Append `ops` as one durable transaction and apply them to loaded lists.
    ///
    /// Must be called between `begin_txn` and `end_txn`.
    pub fn commit_ops(&self, ops: Vec<LogOp>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        if inner.txn_depth == 0 {
            let list = ops.first().map(|op| op.list.clone()).unwrap_or_default();
            return Err(StoreError::NoActiveTransaction { list });
        }
        if ops.is_empty() {
            return Ok(());
        }
        let appended = inner.log.append_txn(&ops)?;
        for op in &ops {
            if let Some(table) = inner.tables.get_mut(&op.list) {
                table.apply(op);
            }
        }
        if inner.applied.is_some() {
            inner.applied = Some(appended.end);
        }
        inner.log_bytes += appended.bytes;

        let (kb, min) = (self.config.checkpoint_log_kb, self.config.checkpoint_age_min);
        if (kb > 0 || min > 0) && checkpoint_due(&inner, kb, min) {
            if let Err(e) = self.checkpoint_locked(&mut inner) {
                warn!(dir = %self.dir.display(), error = %e, "Automatic checkpoint failed");
            }
        }
        Ok(())
    }

    /// Fold the log into the list files. Requires the exclusive txn lock.
    fn checkpoint_locked(&self, inner: &mut EnvInner) -> StoreResult<Lsn> {
        self.catch_up(inner)?;
        let (from, scan) = self.scan_since_checkpoint()?;
        if !scan.txns.is_empty() {
            let loaded = Some(&inner.tables);
            let buffer = self.buffer();
            apply_to_data_files(&self.dir, &scan.txns, LoadMode::Strict, buffer, false, loaded)?;
        }
        if scan.commit_end != from {
            write_checkpoint(&self.dir, scan.commit_end)?;
        }
        inner.log_bytes = 0;
        inner.last_checkpoint = Instant::now();
        info!(
            dir = %self.dir.display(),
            checkpoint = %scan.commit_end,
            transactions = scan.txns.len(),
            "Checkpoint complete"
        );
        Ok(scan.commit_end)
    }

    /// Checkpoint if at least `log_kb` KB of log were written or the last
    /// checkpoint is `age_min` minutes old. Both zero forces one.
    ///
    /// Best effort: failures are logged and leave the log intact.
    pub fn checkpoint(&self, log_kb: u64, age_min: u64) {
        let mut inner = self.inner.lock();
        if inner.state != EnvState::Open || !checkpoint_due(&inner, log_kb, age_min) {
            return;
        }
        if let Err(e) = self.with_exclusive(&mut inner, |inner| self.checkpoint_locked(inner)) {
            warn!(dir = %self.dir.display(), error = %e, "Checkpoint failed");
        }
    }

    /// Checkpoint and delete log segments the checkpoint no longer needs.
    ///
    /// Refused with `Busy` while any writer, here or elsewhere, is open.
    pub fn purge_logs(&self) -> StoreResult<usize> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        if inner.writers > 0 {
            return Err(StoreError::Busy {
                dir: self.dir.clone(),
                reason: format!("{} write handles open in this process", inner.writers),
            });
        }
        let live = inner.cells.live_writers()?;
        if live > 0 {
            return Err(StoreError::Busy {
                dir: self.dir.clone(),
                reason: format!("{live} live writers"),
            });
        }
        self.with_exclusive(&mut inner, |inner| {
            let tail = inner.log.rotate()?;
            self.checkpoint_locked(inner)?;
            // with no writers, nothing after the last commit can still commit
            write_checkpoint(&self.dir, tail)?;
            if inner.applied.is_some() {
                inner.applied = Some(tail);
            }
            let removed = remove_segments_before(&self.dir, tail.segment)?;
            info!(dir = %self.dir.display(), removed, "Purged log segments");
            Ok(removed)
        })
    }

    /// Apply transactions committed by other processes.
    pub fn refresh(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_open(&inner)?;
        self.with_view(&mut inner, |inner| self.catch_up(inner))
    }

    fn table<'a>(&self, inner: &'a EnvInner, list: &str) -> StoreResult<&'a Table> {
        inner
            .tables
            .get(list)
            .ok_or_else(|| StoreError::NotFound {
                what: "list",
                path: data_file_path(&self.dir, list),
            })
    }

    /// Encoded value stored for `key`.
    pub fn get(&self, list: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        self.ensure_open(&inner)?;
        Ok(self.table(&inner, list)?.get(key).cloned())
    }

    pub fn table_len(&self, list: &str) -> StoreResult<usize> {
        let inner = self.inner.lock();
        self.ensure_open(&inner)?;
        Ok(self.table(&inner, list)?.len())
    }

    /// Up to `limit` entries of `list` after `after`, in token order.
    pub fn chunk(
        &self,
        list: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.lock();
        self.ensure_open(&inner)?;
        Ok(self.table(&inner, list)?.chunk_after(after, limit))
    }

    /// Release the cell and locks. With `sync`, checkpoint first.
    pub fn close(&self, sync: bool) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == EnvState::Closed {
            return Ok(());
        }
        if sync && inner.state == EnvState::Open {
            if let Err(e) = self.with_exclusive(&mut inner, |inner| self.checkpoint_locked(inner)) {
                warn!(dir = %self.dir.display(), error = %e, "Checkpoint at close failed");
            }
        }
        let released = inner.cells.clear_lock();
        if let Err(e) = &released {
            error!(dir = %self.dir.display(), error = %e, "Failed to release process table cell");
        }
        if inner.txn_depth > 0 {
            inner.txn_depth = 0;
            self.unlock_txn_file();
        }
        if let Err(e) = FileExt::unlock(&self.env_lock) {
            warn!(
                path = %self.env_lock_path.display(),
                error = %e,
                "Failed to release environment lock"
            );
        }
        inner.tables.clear();
        inner.applied = None;
        if inner.state != EnvState::Failed {
            self.set_state(&mut inner, EnvState::Closed);
        }
        info!(dir = %self.dir.display(), "Environment closed");
        released
    }

    /// Drop without releasing anything, the way a killed process would.
    #[cfg(test)]
    pub(crate) fn abandon(self: Arc<Self>) {
        self.inner.lock().abandoned = true;
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.abandoned || matches!(inner.state, EnvState::Closed | EnvState::Unopened) {
            return;
        }
        let sync = inner.log_bytes > 0;
        if let Err(e) = self.close(sync) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to close environment on drop");
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").field("dir", &self.dir).finish_non_exhaustive()
    }
}
