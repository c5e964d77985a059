//! Datastore: the entry point for opening and managing wordlists.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::backend::{backend_for, Backend};
use crate::config::{BackendKind, Config};
use crate::datafile::validate_list_name;
use crate::env::RecoveryReport;
use crate::error::{StoreError, StoreResult};
use crate::handle::{Handle, OpenLists, OpenMode, Registration};
use crate::record::{MetaKey, SCHEMA_VERSION};

/// Canonical form of a store directory that must already exist.
fn existing(dir: &Path) -> StoreResult<PathBuf> {
    if !dir.is_dir() {
        return Err(StoreError::NotFound {
            what: "directory",
            path: dir.to_path_buf(),
        });
    }
    dir.canonicalize()
        .map_err(|e| StoreError::io(dir, e, "Failed to resolve store directory"))
}

/// Opens wordlists under one [`Config`].
///
/// A list may be open at most once per datastore. Handles opened on the
/// same directory share one environment under the transactional backend.
pub struct Datastore {
    config: Config,
    backend: Box<dyn Backend>,
    open_lists: OpenLists,
    next_id: AtomicU64,
}

impl Datastore {
    /// Create a datastore, validating `config`.
    pub fn new(config: Config) -> StoreResult<Self> {
        config.validate().map_err(StoreError::InvalidConfig)?;
        let backend = backend_for(&config);
        debug!(backend = ?config.backend, "Created datastore");
        Ok(Self {
            config,
            backend,
            open_lists: OpenLists::default(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Whether `begin`/`commit` group writes atomically.
    pub fn supports_transactions(&self) -> bool {
        self.backend.supports_transactions()
    }

    /// Open `list` in `dir`.
    ///
    /// Write mode creates the directory and the list when missing; Read mode
    /// reports them `NotFound`.
    pub fn open(&self, dir: &Path, list: &str, mode: OpenMode) -> StoreResult<Handle> {
        validate_list_name(list)?;
        if mode == OpenMode::Write && !dir.is_dir() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io(dir, e, "Failed to create store directory"))?;
        }
        let dir = existing(dir)?;

        let registration = Registration::claim(&self.open_lists, &dir, list)?;
        let env = self.backend.init(&dir)?;
        let opened = self.backend.open_table(env.as_ref(), &dir, list, mode)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Handle::new(id, &dir, list, mode, opened, &self.config, registration);

        if let Some(version) = handle.get_metadata(MetaKey::WordlistVersion)? {
            if version.spam_count > SCHEMA_VERSION {
                let path = crate::datafile::data_file_path(&dir, list);
                return Err(StoreError::VersionMismatch {
                    path,
                    found: version.spam_count,
                    supported: SCHEMA_VERSION,
                });
            }
        }
        info!(
            dir = %dir.display(),
            list,
            ?mode,
            created = handle.created_fresh(),
            "Opened wordlist"
        );
        Ok(handle)
    }

    /// Close `handle`. With `sync`, pending data is flushed to the list file.
    ///
    /// An open transaction is discarded.
    pub fn close(&self, handle: Handle, sync: bool) -> StoreResult<()> {
        debug!(list = %handle.list(), sync, "Closing wordlist");
        self.backend.close(handle, sync)
    }

    /// Start a transaction on `handle`. A no-op for the traditional backend.
    pub fn begin(&self, handle: &mut Handle) -> StoreResult<()> {
        self.backend.begin(handle)
    }

    /// Make `handle`'s pending writes durable.
    pub fn commit(&self, handle: &mut Handle) -> StoreResult<()> {
        self.backend.commit(&mut [handle])
    }

    /// Commit several handles. Handles on the same directory commit as one
    /// atomic transaction.
    pub fn commit_all(&self, handles: &mut [&mut Handle]) -> StoreResult<()> {
        self.backend.commit(handles)
    }

    /// Discard `handle`'s pending writes.
    pub fn abort(&self, handle: &mut Handle) {
        self.backend.abort(handle)
    }

    /// Checkpoint `dir` if `log_kb` KB of log accumulated or the last
    /// checkpoint is `age_min` minutes old; both zero forces it.
    pub fn checkpoint(&self, dir: &Path, log_kb: u64, age_min: u64) -> StoreResult<()> {
        self.backend.checkpoint(&existing(dir)?, log_kb, age_min)
    }

    /// Remove log segments older than the latest checkpoint.
    pub fn purge_logs(&self, dir: &Path) -> StoreResult<usize> {
        self.backend.purge_logs(&existing(dir)?)
    }

    /// Repair `dir` after a crash. Nobody may have the store open.
    pub fn recover(&self, dir: &Path, catastrophic: bool) -> StoreResult<RecoveryReport> {
        self.backend.recover(&existing(dir)?, catastrophic)
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("backend", &self.backend.kind())
            .field("open_lists", &self.open_lists.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Visit;
    use crate::record::CounterRecord;
    use tempfile::TempDir;

    fn quick(base: Config) -> Datastore {
        Datastore::new(Config {
            lock_retries: 20,
            ..base
        })
        .unwrap()
    }

    fn stores() -> Vec<Datastore> {
        vec![quick(Config::transactional()), quick(Config::traditional())]
    }

    /// Run `f` inside a transaction when the backend has them.
    fn in_txn(ds: &Datastore, h: &mut Handle, f: impl FnOnce(&mut Handle)) {
        ds.begin(h).unwrap();
        f(h);
        ds.commit(h).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            max_writers: 0,
            ..Config::transactional()
        };
        let err = Datastore::new(config).unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn test_read_open_of_missing_directory() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            let err = ds.open(&tmp.path().join("nope"), "spam", OpenMode::Read).unwrap_err();
            assert!(matches!(err, StoreError::NotFound { what: "directory", .. }));
        }
    }

    #[test]
    fn test_invalid_list_name() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            let result = ds.open(tmp.path(), "../x", OpenMode::Write);
            assert!(matches!(result, Err(StoreError::InvalidListName { .. })));
        }
    }

    #[test]
    fn test_write_creates_then_reads_back() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let dir = tmp.path().join("store");
            let mut h = ds.open(&dir, "spam", OpenMode::Write).unwrap();
            assert!(h.created_fresh());
            in_txn(&ds, &mut h, |h| {
                h.write(b"viagra", &CounterRecord::counts(12, 0)).unwrap();
                h.increment(b"hello", 0, 2).unwrap();
            });
            ds.close(h, true).unwrap();

            let h = ds.open(&dir, "spam", OpenMode::Read).unwrap();
            assert_eq!(h.read(b"viagra").unwrap().map(|r| r.spam_count), Some(12));
            assert_eq!(h.read(b"hello").unwrap().map(|r| r.good_count), Some(2));
            assert_eq!(h.read(b"absent").unwrap(), None);
            ds.close(h, false).unwrap();
        }
    }

    #[test]
    fn test_already_open_in_same_datastore() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            let h = ds.open(tmp.path(), "good", OpenMode::Write).unwrap();
            let again = ds.open(tmp.path(), "good", OpenMode::Read);
            assert!(matches!(again, Err(StoreError::AlreadyOpen { .. })));
            ds.close(h, false).unwrap();
            let h = ds.open(tmp.path(), "good", OpenMode::Read).unwrap();
            ds.close(h, false).unwrap();
        }
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            ds.close(ds.open(tmp.path(), "spam", OpenMode::Write).unwrap(), true).unwrap();
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Read).unwrap();
            ds.begin(&mut h).unwrap();
            let result = h.write(b"x", &CounterRecord::counts(1, 1));
            assert!(matches!(result, Err(StoreError::ReadOnly { .. })));
            ds.abort(&mut h);
            ds.close(h, false).unwrap();
        }
    }

    #[test]
    fn test_token_length_limit() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let long = vec![b'a'; ds.config().max_token_len + 1];
            ds.begin(&mut h).unwrap();
            let result = h.write(&long, &CounterRecord::counts(1, 0));
            assert!(matches!(result, Err(StoreError::TokenTooLong { .. })));
            assert_eq!(h.read(&long).unwrap(), None);
            // metadata keys are exempt
            h.set_metadata(MetaKey::MessageCount, &CounterRecord::counts(5, 7)).unwrap();
            ds.commit(&mut h).unwrap();
            let messages = h.get_metadata(MetaKey::MessageCount).unwrap();
            assert_eq!(messages, Some(CounterRecord::counts(5, 7)));
            ds.close(h, false).unwrap();
        }
    }

    #[test]
    fn test_newer_schema_refused() {
        let tmp = TempDir::new().unwrap();
        for ds in stores() {
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            in_txn(&ds, &mut h, |h| {
                let newer = CounterRecord::counts(SCHEMA_VERSION + 1, 0);
                h.set_metadata(MetaKey::WordlistVersion, &newer).unwrap();
            });
            ds.close(h, true).unwrap();
            let err = ds.open(tmp.path(), "spam", OpenMode::Read).unwrap_err();
            let newer = SCHEMA_VERSION + 1;
            assert!(matches!(err, StoreError::VersionMismatch { found, .. } if found == newer));
            std::fs::remove_file(tmp.path().join("spam.db")).unwrap();
        }
    }

    #[test]
    fn test_for_each_sees_pending_writes_in_order() {
        let tmp = TempDir::new().unwrap();
        let ds = quick(Config::transactional());
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        in_txn(&ds, &mut h, |h| {
            for t in [&b"b"[..], b"d", b"f"] {
                h.write(t, &CounterRecord::counts(1, 0)).unwrap();
            }
        });

        ds.begin(&mut h).unwrap();
        h.write(b"c", &CounterRecord::counts(2, 0)).unwrap();
        h.delete(b"d").unwrap();
        h.delete(b"missing").unwrap();

        let mut seen = Vec::new();
        h.for_each(|token, rec| {
            if token != b".WORDLIST_VERSION" {
                seen.push((token.to_vec(), rec.spam_count));
            }
            Visit::Continue
        })
        .unwrap();
        assert_eq!(seen, vec![(b"b".to_vec(), 1), (b"c".to_vec(), 2), (b"f".to_vec(), 1)]);
        assert_eq!(h.len().unwrap(), 4);

        // stop early
        let mut count = 0;
        h.for_each(|_, _| {
            count += 1;
            Visit::Stop
        })
        .unwrap();
        assert_eq!(count, 1);

        ds.abort(&mut h);
        assert!(h.read(b"d").unwrap().is_some());
        assert!(h.read(b"c").unwrap().is_none());
        ds.close(h, false).unwrap();
    }

    #[test]
    fn test_traditional_begin_commit_are_noops() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(Config::traditional()).unwrap();
        assert!(!ds.supports_transactions());
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        h.write(b"direct", &CounterRecord::counts(1, 0)).unwrap();
        ds.begin(&mut h).unwrap();
        ds.abort(&mut h);
        assert!(h.read(b"direct").unwrap().is_some());
        assert_eq!(ds.purge_logs(tmp.path()).unwrap(), 0);
        ds.close(h, true).unwrap();
    }
}
