//! Backend strategies.
//!
//! The traditional backend reads and writes list files directly under
//! whole-file locks. The transactional backend routes every change through a
//! shared [`Environment`] and its write-ahead log.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use fs2::FileExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::{BackendKind, Config};
use crate::datafile::{data_file_path, list_names, read_from, DataFileWriter, LoadMode};
use crate::env::{recover_directory, Environment, RecoveryKind, RecoveryReport};
use crate::error::{StoreError, StoreResult};
use crate::format::{encode_data_record, FileHeader};
use crate::handle::{DirectTable, Handle, OpenMode, OpenedTable, Overlay, Storage};
use crate::log::{LogOp, Lsn};
use crate::platform::{durable_sync, same_file};
use crate::record::{CounterRecord, MetaKey, SCHEMA_VERSION};
use crate::retry::lock_file_with_backoff;
use crate::table::Table;

/// Storage strategy behind a [`Datastore`](crate::Datastore).
pub(crate) trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn supports_transactions(&self) -> bool;

    /// Prepare `dir` for use, returning its shared environment if the
    /// strategy has one.
    fn init(&self, dir: &Path) -> StoreResult<Option<Arc<Environment>>>;

    /// Open `list` in `dir`. Write mode creates a missing list.
    fn open_table(
        &self,
        env: Option<&Arc<Environment>>,
        dir: &Path,
        list: &str,
        mode: OpenMode,
    ) -> StoreResult<OpenedTable>;

    /// Lock an open list file for `mode`.
    fn lock(&self, file: &File, path: &Path, mode: OpenMode) -> StoreResult<()>;

    fn begin(&self, handle: &mut Handle) -> StoreResult<()>;

    /// Discard the handle's pending writes. Idempotent.
    fn abort(&self, handle: &mut Handle);

    /// Commit every handle's pending writes; handles sharing an environment
    /// commit as one transaction.
    fn commit(&self, handles: &mut [&mut Handle]) -> StoreResult<()>;

    /// Release `handle`, flushing when `sync` is set.
    fn close(&self, handle: Handle, sync: bool) -> StoreResult<()>;

    /// Checkpoint `dir` if the thresholds say it is due.
    fn checkpoint(&self, dir: &Path, log_kb: u64, age_min: u64) -> StoreResult<()>;

    /// Remove log files no longer needed; returns how many were removed.
    fn purge_logs(&self, dir: &Path) -> StoreResult<usize>;

    fn recover(&self, dir: &Path, catastrophic: bool) -> StoreResult<RecoveryReport>;
}

/// Backend for `kind`.
pub(crate) fn backend_for(config: &Config) -> Box<dyn Backend> {
    match config.backend {
        BackendKind::Traditional => Box::new(TraditionalBackend::new(config.clone())),
        BackendKind::Transactional => Box::new(TransactionalBackend::new(config.clone())),
    }
}

fn clone_file(file: &File, path: &Path) -> StoreResult<File> {
    file.try_clone()
        .map_err(|e| StoreError::io(path, e, "Failed to clone descriptor"))
}

/// Lists as plain files, one writer at a time.
#[derive(Debug)]
pub(crate) struct TraditionalBackend {
    config: Config,
}

impl TraditionalBackend {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn open_file(path: &Path, mode: OpenMode) -> StoreResult<File> {
        let write = mode == OpenMode::Write;
        match OpenOptions::new().read(true).write(write).create(write).open(path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                what: "list",
                path: path.to_path_buf(),
            }),
            Err(e) => Err(StoreError::io(path, e, "Failed to open data file")),
        }
    }

    /// Write the header and version record into an empty list file.
    fn initialize(file: &File, path: &Path) -> StoreResult<()> {
        let version = Codec::NATIVE.encode(&CounterRecord::counts(SCHEMA_VERSION, 0), false);
        let record = encode_data_record(MetaKey::WordlistVersion.token(), Some(version.as_slice()));
        let mut bytes = FileHeader::native().to_bytes().to_vec();
        bytes.extend_from_slice(&record);
        let mut f = file;
        f.write_all(&bytes)
            .and_then(|_| durable_sync(file))
            .map_err(|e| StoreError::io(path, e, "Failed to initialize data file"))?;
        info!(path = %path.display(), "Created wordlist");
        Ok(())
    }

    fn recover_list(&self, path: &Path) -> StoreResult<usize> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e, "Failed to open data file"))?;
        self.lock(&file, path, OpenMode::Write)?;
        let buffer = self.config.scan_buffer_bytes();
        let result = clone_file(&file, path)
            .and_then(|reader| read_from(reader, path, LoadMode::Lenient, buffer))
            .and_then(|contents| {
                let skipped = contents.skipped;
                Table::from_contents(path, contents).rewrite(buffer)?;
                Ok(skipped)
            });
        if let Err(e) = FileExt::unlock(&file) {
            warn!(path = %path.display(), error = %e, "Failed to unlock data file");
        }
        result
    }
}

impl Backend for TraditionalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Traditional
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    fn init(&self, _dir: &Path) -> StoreResult<Option<Arc<Environment>>> {
        Ok(None)
    }

    fn open_table(
        &self,
        _env: Option<&Arc<Environment>>,
        dir: &Path,
        list: &str,
        mode: OpenMode,
    ) -> StoreResult<OpenedTable> {
        let path = data_file_path(dir, list);
        let buffer = self.config.scan_buffer_bytes();
        let mut reopened = 0;
        let file = loop {
            let file = Self::open_file(&path, mode)?;
            self.lock(&file, &path, mode)?;
            // a writer may have replaced the file while we waited for the lock
            let current = same_file(&file, &path)
                .map_err(|e| StoreError::io(&path, e, "Failed to stat data file"))?;
            if current {
                break file;
            }
            reopened += 1;
            debug!(path = %path.display(), reopened, "List file replaced while locking; reopening");
            if reopened >= self.config.lock_retries {
                return Err(StoreError::LockContention {
                    resource: path,
                    attempts: reopened,
                });
            }
        };

        // an empty file is one we or a racing opener just created
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e, "Failed to stat data file"))?
            .len();
        let mut created = false;
        if len == 0 {
            match mode {
                OpenMode::Write => {
                    Self::initialize(&file, &path)?;
                    created = true;
                }
                OpenMode::Read => {
                    let direct = DirectTable {
                        table: Table::empty(&path),
                        file,
                        writer: None,
                        appended: 0,
                        buffer_bytes: buffer,
                    };
                    return Ok(OpenedTable {
                        storage: Storage::Direct(direct),
                        codec: Codec::NATIVE,
                        created_fresh: false,
                    });
                }
            }
        }

        let contents = read_from(clone_file(&file, &path)?, &path, LoadMode::Strict, buffer)?;
        let (valid_len, file_len) = (contents.valid_len, contents.file_len);
        let table = Table::from_contents(&path, contents);
        let codec = table.codec();
        let writer = match mode {
            OpenMode::Write => {
                let append = clone_file(&file, &path)?;
                Some(DataFileWriter::new(append, &path, valid_len, file_len)?)
            }
            OpenMode::Read => None,
        };
        debug!(path = %path.display(), entries = table.len(), ?mode, "Opened list file");
        let direct = DirectTable {
            table,
            file,
            writer,
            appended: 0,
            buffer_bytes: buffer,
        };
        Ok(OpenedTable {
            storage: Storage::Direct(direct),
            codec,
            created_fresh: created,
        })
    }

    fn lock(&self, file: &File, path: &Path, mode: OpenMode) -> StoreResult<()> {
        lock_file_with_backoff(file, path, mode == OpenMode::Write, self.config.lock_retries)
    }

    fn begin(&self, _handle: &mut Handle) -> StoreResult<()> {
        Ok(())
    }

    fn abort(&self, _handle: &mut Handle) {}

    fn commit(&self, _handles: &mut [&mut Handle]) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self, mut handle: Handle, sync: bool) -> StoreResult<()> {
        let result = handle.finish_direct(sync);
        handle.release();
        if let Storage::Direct(d) = &handle.storage {
            if let Err(e) = FileExt::unlock(&d.file) {
                warn!(list = %handle.list, error = %e, "Failed to unlock list file");
            }
        }
        result
    }

    fn checkpoint(&self, _dir: &Path, _log_kb: u64, _age_min: u64) -> StoreResult<()> {
        Ok(())
    }

    fn purge_logs(&self, _dir: &Path) -> StoreResult<usize> {
        Ok(0)
    }

    /// Rewrite every list file, dropping damaged records.
    fn recover(&self, dir: &Path, catastrophic: bool) -> StoreResult<RecoveryReport> {
        let kind = if catastrophic {
            RecoveryKind::Catastrophic
        } else {
            RecoveryKind::Normal
        };
        let names = list_names(dir)?;
        let mut skipped = 0;
        for name in &names {
            skipped += self
                .recover_list(&data_file_path(dir, name))
                .map_err(|e| StoreError::RecoveryFailed {
                    dir: dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }
        info!(dir = %dir.display(), lists = names.len(), skipped, "Rewrote list files");
        Ok(RecoveryReport {
            kind,
            transactions: 0,
            lists: names.len(),
            checkpoint: Lsn::START,
            skipped,
            zombies_cleared: 0,
        })
    }
}

/// Lists behind a shared environment with a write-ahead log.
pub(crate) struct TransactionalBackend {
    config: Config,
    envs: Mutex<HashMap<PathBuf, Weak<Environment>>>,
}

impl TransactionalBackend {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            envs: Mutex::new(HashMap::new()),
        }
    }

    /// The live environment for `dir`, opening one if needed.
    fn environment(&self, dir: &Path) -> StoreResult<Arc<Environment>> {
        let mut envs = self.envs.lock();
        if let Some(env) = envs.get(dir).and_then(Weak::upgrade) {
            return Ok(env);
        }
        let env = Environment::open(dir, &self.config)?;
        envs.insert(dir.to_path_buf(), Arc::downgrade(&env));
        Ok(env)
    }

    fn live(&self, dir: &Path) -> Option<Arc<Environment>> {
        self.envs.lock().get(dir).and_then(Weak::upgrade)
    }

    fn shared(handle: &Handle) -> StoreResult<Arc<Environment>> {
        handle.env().cloned().ok_or_else(|| StoreError::NotFound {
            what: "environment",
            path: handle.dir.clone(),
        })
    }
}

impl std::fmt::Debug for TransactionalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalBackend")
            .field("environments", &self.envs.lock().len())
            .finish()
    }
}

impl Backend for TransactionalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Transactional
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn init(&self, dir: &Path) -> StoreResult<Option<Arc<Environment>>> {
        self.environment(dir).map(Some)
    }

    fn open_table(
        &self,
        env: Option<&Arc<Environment>>,
        dir: &Path,
        list: &str,
        mode: OpenMode,
    ) -> StoreResult<OpenedTable> {
        let env = match env {
            Some(env) => Arc::clone(env),
            None => self.environment(dir)?,
        };
        let write = mode == OpenMode::Write;
        if write {
            env.register_writer()?;
        }
        let (codec, created_fresh) = match env.open_list(list, write) {
            Ok(opened) => opened,
            Err(e) => {
                if write {
                    env.release_writer();
                }
                return Err(e);
            }
        };
        Ok(OpenedTable {
            storage: Storage::Shared(env),
            codec,
            created_fresh,
        })
    }

    /// The environment serializes access; list files need no lock of their own.
    fn lock(&self, _file: &File, _path: &Path, _mode: OpenMode) -> StoreResult<()> {
        Ok(())
    }

    fn begin(&self, handle: &mut Handle) -> StoreResult<()> {
        if handle.txn.is_some() {
            return Err(StoreError::TransactionActive {
                list: handle.list.clone(),
            });
        }
        Self::shared(handle)?.begin_txn()?;
        handle.txn = Some(Overlay::new());
        Ok(())
    }

    fn abort(&self, handle: &mut Handle) {
        if handle.txn.take().is_some() {
            if let Some(env) = handle.env() {
                env.end_txn();
            }
            debug!(list = %handle.list, "Aborted transaction");
        }
    }

    fn commit(&self, handles: &mut [&mut Handle]) -> StoreResult<()> {
        if let Some(h) = handles.iter().find(|h| !h.in_transaction()) {
            return Err(StoreError::NoActiveTransaction {
                list: h.list.clone(),
            });
        }

        // one log per directory
        let mut dirs: Vec<PathBuf> = Vec::new();
        for h in handles.iter() {
            if !dirs.iter().any(|d| d == h.dir()) {
                dirs.push(h.dir().to_path_buf());
            }
        }
        if dirs.len() > 1 {
            return Err(StoreError::MultipleDirectories { dirs });
        }
        let Some(first) = handles.first() else {
            return Ok(());
        };
        let env = Self::shared(first)?;

        let mut ops: Vec<LogOp> = Vec::new();
        for h in handles.iter_mut() {
            let overlay = h.txn.take().unwrap_or_default();
            ops.extend(overlay.into_iter().map(|(key, value)| LogOp {
                list: h.list.clone(),
                key,
                value,
            }));
        }
        let result = env.commit_ops(ops);
        // every handle's begin took one hold on its environment
        for h in handles.iter() {
            if let Some(env) = h.env() {
                env.end_txn();
            }
        }
        result
    }

    fn close(&self, mut handle: Handle, sync: bool) -> StoreResult<()> {
        let env = handle.env().cloned();
        handle.release();
        drop(handle);
        let Some(env) = env else {
            return Ok(());
        };
        let mut envs = self.envs.lock();
        // the registry holds only weak references
        if Arc::strong_count(&env) == 1 {
            envs.remove(env.dir());
            return env.close(sync);
        }
        Ok(())
    }

    fn checkpoint(&self, dir: &Path, log_kb: u64, age_min: u64) -> StoreResult<()> {
        self.environment(dir)?.checkpoint(log_kb, age_min);
        Ok(())
    }

    fn purge_logs(&self, dir: &Path) -> StoreResult<usize> {
        self.environment(dir)?.purge_logs()
    }

    fn recover(&self, dir: &Path, catastrophic: bool) -> StoreResult<RecoveryReport> {
        if self.live(dir).is_some() {
            return Err(StoreError::Busy {
                dir: dir.to_path_buf(),
                reason: "lists are open in this process".into(),
            });
        }
        recover_directory(dir, &self.config, catastrophic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{OpenLists, Registration};
    use tempfile::TempDir;

    fn quick() -> Config {
        Config {
            lock_retries: 20,
            ..Config::transactional()
        }
    }

    fn handle(
        backend: &dyn Backend,
        open_lists: &OpenLists,
        dir: &Path,
        list: &str,
        mode: OpenMode,
    ) -> StoreResult<Handle> {
        let config = quick();
        let registration = Registration::claim(open_lists, dir, list)?;
        let env = backend.init(dir)?;
        let opened = backend.open_table(env.as_ref(), dir, list, mode)?;
        Ok(Handle::new(1, dir, list, mode, opened, &config, registration))
    }

    #[test]
    fn test_traditional_read_of_missing_list() {
        let tmp = TempDir::new().unwrap();
        let backend = TraditionalBackend::new(Config::traditional());
        let lists = OpenLists::default();
        let err = handle(&backend, &lists, tmp.path(), "spam", OpenMode::Read).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { what: "list", .. }));
        assert!(lists.lock().is_empty());
    }

    #[test]
    fn test_traditional_create_write_close_reopen() {
        let tmp = TempDir::new().unwrap();
        let backend = TraditionalBackend::new(Config::traditional());
        let lists = OpenLists::default();

        let mut h = handle(&backend, &lists, tmp.path(), "spam", OpenMode::Write).unwrap();
        assert!(h.created_fresh());
        h.write(b"cash", &CounterRecord::counts(3, 1)).unwrap();
        backend.close(h, true).unwrap();

        let h = handle(&backend, &lists, tmp.path(), "spam", OpenMode::Read).unwrap();
        assert!(!h.created_fresh());
        assert_eq!(h.read(b"cash").unwrap(), Some(CounterRecord::counts(3, 1)));
        let version = h.get_metadata(MetaKey::WordlistVersion).unwrap();
        assert_eq!(version.map(|r| r.spam_count), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_traditional_recover_drops_damage() {
        let tmp = TempDir::new().unwrap();
        let backend = TraditionalBackend::new(Config::traditional());
        let lists = OpenLists::default();
        let mut h = handle(&backend, &lists, tmp.path(), "good", OpenMode::Write).unwrap();
        h.write(b"alpha", &CounterRecord::counts(0, 1)).unwrap();
        h.write(b"beta", &CounterRecord::counts(0, 2)).unwrap();
        backend.close(h, true).unwrap();

        // flip a byte inside the second-to-last record
        let path = data_file_path(tmp.path(), "good");
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 30;
        bytes[at] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let report = backend.recover(tmp.path(), false).unwrap();
        assert_eq!(report.lists, 1);
        let h = handle(&backend, &lists, tmp.path(), "good", OpenMode::Read).unwrap();
        assert!(h.read(b"beta").unwrap().is_some());
    }

    #[test]
    fn test_transactional_handles_share_environment() {
        let tmp = TempDir::new().unwrap();
        let backend = TransactionalBackend::new(quick());
        let lists = OpenLists::default();
        let spam = handle(&backend, &lists, tmp.path(), "spam", OpenMode::Write).unwrap();
        let good = handle(&backend, &lists, tmp.path(), "good", OpenMode::Write).unwrap();
        assert!(Arc::ptr_eq(spam.env().unwrap(), good.env().unwrap()));

        backend.close(spam, true).unwrap();
        assert!(backend.live(tmp.path()).is_some());
        backend.close(good, true).unwrap();
        assert!(backend.live(tmp.path()).is_none());
    }

    #[test]
    fn test_transactional_commit_without_begin() {
        let tmp = TempDir::new().unwrap();
        let backend = TransactionalBackend::new(quick());
        let lists = OpenLists::default();
        let mut h = handle(&backend, &lists, tmp.path(), "spam", OpenMode::Write).unwrap();
        let write = h.write(b"x", &CounterRecord::counts(1, 0));
        assert!(matches!(write, Err(StoreError::NoActiveTransaction { .. })));
        let commit = backend.commit(&mut [&mut h]);
        assert!(matches!(commit, Err(StoreError::NoActiveTransaction { .. })));

        backend.begin(&mut h).unwrap();
        assert!(matches!(backend.begin(&mut h), Err(StoreError::TransactionActive { .. })));
        backend.abort(&mut h);
        backend.abort(&mut h);
        assert!(!h.in_transaction());
    }
}
