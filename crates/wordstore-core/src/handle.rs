//! Open wordlist handles.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::config::Config;
use crate::datafile::DataFileWriter;
use crate::env::Environment;
use crate::error::{StoreError, StoreResult};
use crate::record::{adjust_logged, is_metadata_key, today, CounterRecord, MetaKey};
use crate::table::Table;

/// Entries fetched per step of [`Handle::for_each`].
const ITER_CHUNK: usize = 1024;

/// How a list is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Returned by a [`Handle::for_each`] visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// Pending writes of an open transaction; `None` is a delete.
pub(crate) type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

pub(crate) type OpenLists = Arc<Mutex<HashSet<(PathBuf, String)>>>;

/// Marks `(dir, list)` open in one datastore until dropped.
#[derive(Debug)]
pub(crate) struct Registration {
    key: (PathBuf, String),
    open_lists: OpenLists,
}

impl Registration {
    pub(crate) fn claim(open_lists: &OpenLists, dir: &Path, list: &str) -> StoreResult<Self> {
        let key = (dir.to_path_buf(), list.to_string());
        if !open_lists.lock().insert(key.clone()) {
            return Err(StoreError::AlreadyOpen {
                dir: dir.to_path_buf(),
                list: list.to_string(),
            });
        }
        Ok(Self {
            key,
            open_lists: Arc::clone(open_lists),
        })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.open_lists.lock().remove(&self.key);
    }
}

/// A list file opened by the traditional backend.
#[derive(Debug)]
pub(crate) struct DirectTable {
    pub(crate) table: Table,
    /// Locked descriptor; the lock lives as long as it does
    pub(crate) file: File,
    pub(crate) writer: Option<DataFileWriter>,
    /// Records appended since the file was last compacted
    pub(crate) appended: usize,
    pub(crate) buffer_bytes: usize,
}

#[derive(Debug)]
pub(crate) enum Storage {
    Direct(DirectTable),
    Shared(Arc<Environment>),
}

/// What a backend hands back when a list is opened.
#[derive(Debug)]
pub(crate) struct OpenedTable {
    pub(crate) storage: Storage,
    pub(crate) codec: Codec,
    pub(crate) created_fresh: bool,
}

/// An open wordlist.
///
/// Obtained from [`Datastore::open`](crate::Datastore::open) and released with
/// [`Datastore::close`](crate::Datastore::close). Dropping a handle releases it
/// without the final flush.
#[derive(Debug)]
pub struct Handle {
    pub(crate) id: u64,
    pub(crate) dir: PathBuf,
    pub(crate) list: String,
    pub(crate) mode: OpenMode,
    pub(crate) codec: Codec,
    pub(crate) created_fresh: bool,
    pub(crate) timestamps: bool,
    pub(crate) max_token_len: usize,
    pub(crate) storage: Storage,
    pub(crate) txn: Option<Overlay>,
    pub(crate) released: bool,
    pub(crate) _registration: Registration,
}

impl Handle {
    pub(crate) fn new(
        id: u64,
        dir: &Path,
        list: &str,
        mode: OpenMode,
        opened: OpenedTable,
        config: &Config,
        registration: Registration,
    ) -> Self {
        Self {
            id,
            dir: dir.to_path_buf(),
            list: list.to_string(),
            mode,
            codec: opened.codec,
            created_fresh: opened.created_fresh,
            timestamps: config.timestamps,
            max_token_len: config.max_token_len,
            storage: opened.storage,
            txn: None,
            released: false,
            _registration: registration,
        }
    }

    /// Identifier unique within the datastore that opened this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn list(&self) -> &str {
        &self.list
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether this open created the list file.
    pub fn created_fresh(&self) -> bool {
        self.created_fresh
    }

    /// Whether values in this list are stored in the other byte order.
    pub fn byte_order_differs(&self) -> bool {
        self.codec.byte_order_differs()
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub(crate) fn env(&self) -> Option<&Arc<Environment>> {
        match &self.storage {
            Storage::Shared(env) => Some(env),
            Storage::Direct(_) => None,
        }
    }

    pub(crate) fn check_token(&self, token: &[u8]) -> StoreResult<()> {
        if token.len() > self.max_token_len && !is_metadata_key(token) {
            return Err(StoreError::TokenTooLong {
                len: token.len(),
                max: self.max_token_len,
            });
        }
        Ok(())
    }

    fn base_get(&self, token: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match &self.storage {
            Storage::Direct(d) => Ok(d.table.get(token).cloned()),
            Storage::Shared(env) => env.get(&self.list, token),
        }
    }

    /// Encoded value as this handle sees it, pending writes included.
    pub(crate) fn raw_get(&self, token: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.txn.as_ref().and_then(|o| o.get(token)) {
            return Ok(pending.clone());
        }
        self.base_get(token)
    }

    /// Store an encoded value, or delete with `None`.
    pub(crate) fn raw_put(&mut self, token: &[u8], value: Option<Vec<u8>>) -> StoreResult<()> {
        if self.mode == OpenMode::Read {
            return Err(StoreError::ReadOnly {
                list: self.list.clone(),
            });
        }
        match &mut self.storage {
            Storage::Shared(_) => match self.txn.as_mut() {
                Some(overlay) => {
                    overlay.insert(token.to_vec(), value);
                    Ok(())
                }
                None => Err(StoreError::NoActiveTransaction {
                    list: self.list.clone(),
                }),
            },
            Storage::Direct(d) => {
                if value.is_none() && d.table.get(token).is_none() {
                    return Ok(());
                }
                let Some(writer) = d.writer.as_mut() else {
                    return Err(StoreError::ReadOnly {
                        list: self.list.clone(),
                    });
                };
                writer.append(token, value.as_deref())?;
                d.appended += 1;
                match value {
                    Some(v) => d.table.insert(token.to_vec(), v),
                    None => {
                        d.table.remove(token);
                    }
                }
                Ok(())
            }
        }
    }

    /// Counter record for `token`, if present.
    ///
    /// Tokens longer than the configured maximum can never have been stored
    /// and simply miss.
    pub fn read(&self, token: &[u8]) -> StoreResult<Option<CounterRecord>> {
        if token.len() > self.max_token_len && !is_metadata_key(token) {
            return Ok(None);
        }
        match self.raw_get(token)? {
            Some(raw) => self.codec.decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Store `rec` under `token`, replacing any previous record.
    pub fn write(&mut self, token: &[u8], rec: &CounterRecord) -> StoreResult<()> {
        self.check_token(token)?;
        let raw = self.codec.encode(rec, self.timestamps);
        self.raw_put(token, Some(raw))
    }

    /// Remove `token`. Deleting an absent token succeeds.
    ///
    /// Overlong tokens are accepted so that lists written under a larger
    /// limit can still be pruned.
    pub fn delete(&mut self, token: &[u8]) -> StoreResult<()> {
        self.raw_put(token, None)
    }

    /// Add signed deltas to `token`'s counts, stamping today's date.
    pub fn increment(
        &mut self,
        token: &[u8],
        delta_spam: i64,
        delta_good: i64,
    ) -> StoreResult<CounterRecord> {
        let date = if self.timestamps { today() } else { 0 };
        self.increment_at(token, delta_spam, delta_good, date)
    }

    /// Add signed deltas to `token`'s counts; counts clamp at zero.
    ///
    /// A non-zero `date` becomes the record's last-seen stamp when
    /// timestamps are enabled.
    pub fn increment_at(
        &mut self,
        token: &[u8],
        delta_spam: i64,
        delta_good: i64,
        date: u32,
    ) -> StoreResult<CounterRecord> {
        self.check_token(token)?;
        let current = self.read(token)?.unwrap_or_default();
        let mut next = adjust_logged(token, &current, delta_spam, delta_good);
        if self.timestamps && date != 0 {
            next.last_seen = date;
        }
        self.write(token, &next)?;
        Ok(next)
    }

    pub fn get_metadata(&self, key: MetaKey) -> StoreResult<Option<CounterRecord>> {
        self.read(key.token())
    }

    pub fn set_metadata(&mut self, key: MetaKey, rec: &CounterRecord) -> StoreResult<()> {
        // metadata is never date stamped
        let raw = self.codec.encode(rec, false);
        self.raw_put(key.token(), Some(raw))
    }

    fn base_chunk(&self, after: Option<&[u8]>) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        match &self.storage {
            Storage::Direct(d) => Ok(d.table.chunk_after(after, ITER_CHUNK)),
            Storage::Shared(env) => env.chunk(&self.list, after, ITER_CHUNK),
        }
    }

    /// Visit every record in token order until the visitor says stop.
    ///
    /// Records are fetched in chunks, so the visitor may call back into the
    /// store. Values that fail to decode are logged and skipped.
    pub fn for_each<F>(&self, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&[u8], &CounterRecord) -> Visit,
    {
        let mut after: Option<Vec<u8>> = None;
        loop {
            let chunk = self.base_chunk(after.as_deref())?;
            let upper = if chunk.len() == ITER_CHUNK {
                chunk.last().map(|(k, _)| k.clone())
            } else {
                None
            };
            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = chunk.into_iter().collect();

            if let Some(overlay) = &self.txn {
                let lower = after.clone().map_or(Bound::Unbounded, Bound::Excluded);
                let higher = upper.clone().map_or(Bound::Unbounded, Bound::Included);
                for (k, v) in overlay.range((lower, higher)) {
                    match v {
                        Some(v) => merged.insert(k.clone(), v.clone()),
                        None => merged.remove(k),
                    };
                }
            }

            for (token, raw) in &merged {
                let rec = match self.codec.decode(raw) {
                    Ok(rec) => rec,
                    Err(e) => {
                        warn!(
                            list = %self.list,
                            token = %String::from_utf8_lossy(token),
                            error = %e,
                            "Skipping undecodable record"
                        );
                        continue;
                    }
                };
                if visit(token, &rec) == Visit::Stop {
                    return Ok(());
                }
            }

            match upper {
                Some(k) => after = Some(k),
                None => return Ok(()),
            }
        }
    }

    /// Number of records, pending writes included.
    pub fn len(&self) -> StoreResult<usize> {
        let base = match &self.storage {
            Storage::Direct(d) => d.table.len(),
            Storage::Shared(env) => env.table_len(&self.list)?,
        };
        let Some(overlay) = &self.txn else {
            return Ok(base);
        };
        let mut len = base as i64;
        for (k, v) in overlay {
            match (v.is_some(), self.base_get(k)?.is_some()) {
                (true, false) => len += 1,
                (false, true) => len -= 1,
                _ => {}
            }
        }
        Ok(len.max(0) as usize)
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        self.len().map(|n| n == 0)
    }

    /// Pick up transactions other processes committed since the last refresh.
    pub fn refresh(&self) -> StoreResult<()> {
        match &self.storage {
            Storage::Shared(env) => env.refresh(),
            Storage::Direct(_) => Ok(()),
        }
    }

    /// Flush appended records on the way out; compact the file when it has
    /// grown past its live contents. Compaction replaces the file, so nothing
    /// may be written through this handle afterwards.
    pub(crate) fn finish_direct(&mut self, sync: bool) -> StoreResult<()> {
        let Storage::Direct(d) = &mut self.storage else {
            return Ok(());
        };
        let Some(writer) = d.writer.as_ref() else {
            return Ok(());
        };
        if d.appended > d.table.len() {
            debug!(
                list = %self.list,
                appended = d.appended,
                live = d.table.len(),
                "Compacting list file"
            );
            d.table.rewrite(d.buffer_bytes)?;
            d.appended = 0;
        } else if sync && d.appended > 0 {
            writer.sync()?;
        }
        Ok(())
    }

    /// Give back everything the handle holds in its environment.
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Storage::Shared(env) = &self.storage {
            if self.txn.take().is_some() {
                debug!(list = %self.list, "Discarding uncommitted transaction");
                env.end_txn();
            }
            if self.mode == OpenMode::Write {
                env.release_writer();
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.finish_direct(true) {
            warn!(list = %self.list, error = %e, "Failed to flush list on drop");
        }
        self.release();
    }
}
