//! Write journal.
//!
//! A [`Journal`] stages writes against one or more handles without touching
//! storage, then applies them as a batch. Reads through the journal see its
//! own staged writes first.
//!
//! Increments are staged as deltas and resolved against the stored value at
//! commit, after the transaction has caught up with other writers.
//!
//! With the transactional backend the batch is one transaction, and every
//! target must live in the same directory. With the traditional backend each
//! handle's prior values are captured first and restored if any write fails.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::datastore::Datastore;
use crate::error::{StoreError, StoreResult};
use crate::handle::Handle;
use crate::record::{adjust_logged, CounterRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Put(CounterRecord),
    Delete,
    Increment {
        delta_spam: i64,
        delta_good: i64,
        date: u32,
        /// Delete the record when both counts end at zero
        remove_if_empty: bool,
    },
}

impl Change {
    /// Value of a token after this change is applied on top of `current`.
    fn resolve(&self, current: Option<CounterRecord>, timestamps: bool) -> Option<CounterRecord> {
        match *self {
            Change::Put(rec) => Some(rec),
            Change::Delete => None,
            Change::Increment {
                delta_spam,
                delta_good,
                date,
                remove_if_empty,
            } => {
                let (next, _) = current.unwrap_or_default().adjusted(delta_spam, delta_good);
                Self::finish(next, date, remove_if_empty, timestamps)
            }
        }
    }

    fn finish(
        mut next: CounterRecord,
        date: u32,
        remove_if_empty: bool,
        timestamps: bool,
    ) -> Option<CounterRecord> {
        if timestamps && date != 0 {
            next.last_seen = next.last_seen.max(date);
        }
        if remove_if_empty && next.spam_count == 0 && next.good_count == 0 {
            return None;
        }
        Some(next)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    handle: u64,
    list: String,
    token: Vec<u8>,
    change: Change,
}

impl Entry {
    fn unknown_handle(&self) -> StoreError {
        StoreError::UnknownHandle {
            list: self.list.clone(),
        }
    }
}

/// Staged writes, applied in order by [`Journal::commit`].
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<Entry>,
}

impl Journal {
    pub fn begin() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stage `rec` for `token` in `handle`'s list.
    pub fn write(&mut self, handle: &Handle, token: &[u8], rec: &CounterRecord) -> StoreResult<()> {
        handle.check_token(token)?;
        self.push(handle, token, Change::Put(*rec));
        Ok(())
    }

    /// Stage removal of `token`. Never fails; see [`Handle::delete`].
    pub fn delete(&mut self, handle: &Handle, token: &[u8]) {
        self.push(handle, token, Change::Delete);
    }

    fn push(&mut self, handle: &Handle, token: &[u8], change: Change) {
        self.entries.push(Entry {
            handle: handle.id(),
            list: handle.list().to_string(),
            token: token.to_vec(),
            change,
        });
    }

    /// `token` as it would be if the journal committed now: staged changes
    /// folded over the handle's current value.
    pub fn read(&self, handle: &Handle, token: &[u8]) -> StoreResult<Option<CounterRecord>> {
        let staged: Vec<&Change> = self
            .entries
            .iter()
            .filter(|e| e.handle == handle.id() && e.token == token)
            .map(|e| &e.change)
            .collect();
        // changes before the last absolute one do not matter
        let start = staged.iter().rposition(|c| !matches!(c, Change::Increment { .. }));
        let mut current = match start {
            Some(_) => None,
            None => handle.read(token)?,
        };
        for change in &staged[start.unwrap_or(0)..] {
            current = change.resolve(current, handle.timestamps);
        }
        Ok(current)
    }

    /// Stage signed deltas for `token`. Counts clamp at zero when applied,
    /// and a non-zero `date` replaces an older last-seen stamp. Returns the
    /// value [`Journal::read`] now projects.
    pub fn increment(
        &mut self,
        handle: &Handle,
        token: &[u8],
        delta_spam: i64,
        delta_good: i64,
        date: u32,
    ) -> StoreResult<CounterRecord> {
        self.stage_increment(handle, token, delta_spam, delta_good, date, false)
            .map(Option::unwrap_or_default)
    }

    /// Like [`Journal::increment`], but the record is deleted when both of
    /// its counts end at zero.
    pub fn increment_or_remove(
        &mut self,
        handle: &Handle,
        token: &[u8],
        delta_spam: i64,
        delta_good: i64,
        date: u32,
    ) -> StoreResult<Option<CounterRecord>> {
        self.stage_increment(handle, token, delta_spam, delta_good, date, true)
    }

    fn stage_increment(
        &mut self,
        handle: &Handle,
        token: &[u8],
        delta_spam: i64,
        delta_good: i64,
        date: u32,
        remove_if_empty: bool,
    ) -> StoreResult<Option<CounterRecord>> {
        handle.check_token(token)?;
        let change = Change::Increment {
            delta_spam,
            delta_good,
            date,
            remove_if_empty,
        };
        self.push(handle, token, change);
        self.read(handle, token)
    }

    /// Drop every staged entry.
    pub fn rollback(&mut self) {
        debug!(entries = self.entries.len(), "Rolled back journal");
        self.entries.clear();
    }

    /// Apply every staged entry to `handles` and clear the journal.
    ///
    /// Each entry's handle must be among `handles`. On failure nothing staged
    /// is visible and the journal keeps its entries.
    pub fn commit(&mut self, ds: &Datastore, handles: &mut [&mut Handle]) -> StoreResult<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let supplied = |id: u64| handles.iter().any(|h| h.id() == id);
        if let Some(e) = self.entries.iter().find(|e| !supplied(e.handle)) {
            return Err(e.unknown_handle());
        }
        let mut targets: Vec<&mut Handle> = handles
            .iter_mut()
            .filter(|h| self.entries.iter().any(|e| e.handle == h.id()))
            .map(|h| &mut **h)
            .collect();

        if ds.supports_transactions() {
            self.commit_transactional(ds, &mut targets)?;
        } else {
            self.commit_compensating(&mut targets)?;
        }
        debug!(entries = self.entries.len(), handles = targets.len(), "Committed journal");
        self.entries.clear();
        Ok(())
    }

    fn apply(entry: &Entry, targets: &mut [&mut Handle]) -> StoreResult<()> {
        let Some(h) = targets.iter_mut().find(|h| h.id() == entry.handle) else {
            return Err(entry.unknown_handle());
        };
        let next = match entry.change {
            Change::Put(rec) => Some(rec),
            Change::Delete => None,
            Change::Increment {
                delta_spam,
                delta_good,
                date,
                remove_if_empty,
            } => {
                let current = h.read(&entry.token)?.unwrap_or_default();
                let next = adjust_logged(&entry.token, &current, delta_spam, delta_good);
                Change::finish(next, date, remove_if_empty, h.timestamps)
            }
        };
        match next {
            Some(rec) => h.write(&entry.token, &rec),
            None => h.delete(&entry.token),
        }
    }

    fn commit_transactional(&self, ds: &Datastore, targets: &mut [&mut Handle]) -> StoreResult<()> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for h in targets.iter() {
            if !dirs.iter().any(|d| d == h.dir()) {
                dirs.push(h.dir().to_path_buf());
            }
        }
        if dirs.len() > 1 {
            return Err(StoreError::MultipleDirectories { dirs });
        }

        for i in 0..targets.len() {
            if let Err(e) = ds.begin(&mut *targets[i]) {
                for h in targets[..i].iter_mut() {
                    ds.abort(h);
                }
                return Err(e);
            }
        }
        // begin has caught up, so increments resolve against current values
        let applied = self.entries.iter().try_for_each(|e| Self::apply(e, targets));
        let result = applied.and_then(|_| ds.commit_all(targets));
        if result.is_err() {
            for h in targets.iter_mut() {
                ds.abort(h);
            }
        }
        result
    }

    fn commit_compensating(&self, targets: &mut [&mut Handle]) -> StoreResult<()> {
        // prior encoded image of every token the batch touches
        let mut prior: BTreeMap<(u64, Vec<u8>), Option<Vec<u8>>> = BTreeMap::new();
        for e in &self.entries {
            let key = (e.handle, e.token.clone());
            if prior.contains_key(&key) {
                continue;
            }
            let Some(h) = targets.iter().find(|h| h.id() == e.handle) else {
                return Err(e.unknown_handle());
            };
            let image = h.raw_get(&e.token)?;
            prior.insert(key, image);
        }

        let Err(err) = self.entries.iter().try_for_each(|e| Self::apply(e, targets)) else {
            return Ok(());
        };
        warn!(error = %err, "Journal commit failed; restoring prior values");
        for ((id, token), image) in prior {
            if let Some(h) = targets.iter_mut().find(|h| h.id() == id) {
                if let Err(e) = h.raw_put(&token, image) {
                    warn!(
                        list = %h.list(),
                        error = %e,
                        "Failed to restore value after journal failure"
                    );
                }
            }
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handle::OpenMode;
    use crate::record::MetaKey;
    use tempfile::TempDir;

    fn with_retries(base: Config, lock_retries: u32) -> Datastore {
        Datastore::new(Config {
            lock_retries,
            ..base
        })
        .unwrap()
    }

    fn stores() -> Vec<Datastore> {
        vec![
            with_retries(Config::transactional(), 20),
            with_retries(Config::traditional(), 20),
        ]
    }

    #[test]
    fn test_staged_writes_invisible_until_commit() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let mut spam = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut good = ds.open(tmp.path(), "good", OpenMode::Write).unwrap();

            let mut j = Journal::begin();
            j.increment(&spam, b"cash", 1, 0, 20240101).unwrap();
            j.increment(&spam, b"cash", 1, 0, 20240102).unwrap();
            j.write(&good, b"meeting", &CounterRecord::counts(0, 3)).unwrap();

            assert_eq!(spam.read(b"cash").unwrap(), None);
            assert_eq!(j.read(&spam, b"cash").unwrap().map(|r| r.spam_count), Some(2));
            assert_eq!(j.len(), 3);

            j.commit(&ds, &mut [&mut spam, &mut good]).unwrap();
            assert!(j.is_empty());
            let cash = spam.read(b"cash").unwrap().unwrap();
            assert_eq!((cash.spam_count, cash.last_seen), (2, 20240102));
            assert_eq!(good.read(b"meeting").unwrap().map(|r| r.good_count), Some(3));

            ds.close(spam, true).unwrap();
            ds.close(good, true).unwrap();
        }
    }

    #[test]
    fn test_delete_then_read() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut j = Journal::begin();
            j.write(&h, b"x", &CounterRecord::counts(1, 1)).unwrap();
            j.commit(&ds, &mut [&mut h]).unwrap();

            j.delete(&h, b"x");
            assert_eq!(j.read(&h, b"x").unwrap(), None);
            assert!(h.read(b"x").unwrap().is_some());
            j.rollback();
            assert!(j.read(&h, b"x").unwrap().is_some());
            ds.close(h, false).unwrap();
        }
    }

    #[test]
    fn test_unknown_handle() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let spam = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut good = ds.open(tmp.path(), "good", OpenMode::Write).unwrap();
            let mut j = Journal::begin();
            j.write(&spam, b"x", &CounterRecord::counts(1, 0)).unwrap();
            let err = j.commit(&ds, &mut [&mut good]).unwrap_err();
            assert!(matches!(err, StoreError::UnknownHandle { ref list } if list == "spam"));
            assert_eq!(j.len(), 1);
            ds.close(spam, false).unwrap();
            ds.close(good, false).unwrap();
        }
    }

    #[test]
    fn test_failed_batch_leaves_nothing_behind() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            ds.close(ds.open(tmp.path(), "good", OpenMode::Write).unwrap(), true).unwrap();
            let mut spam = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut good = ds.open(tmp.path(), "good", OpenMode::Read).unwrap();

            let mut j = Journal::begin();
            j.write(&spam, b"first", &CounterRecord::counts(1, 0)).unwrap();
            j.write(&good, b"second", &CounterRecord::counts(0, 1)).unwrap();
            let err = j.commit(&ds, &mut [&mut spam, &mut good]).unwrap_err();
            assert!(matches!(err, StoreError::ReadOnly { .. }));

            assert_eq!(spam.read(b"first").unwrap(), None);
            assert!(!spam.in_transaction());
            ds.close(spam, false).unwrap();
            ds.close(good, false).unwrap();
        }
    }

    fn transactional() -> Datastore {
        with_retries(Config::transactional(), 100_000)
    }

    #[test]
    fn test_increments_from_two_datastores_accumulate() {
        let tmp = TempDir::new().unwrap();
        let a = transactional();
        let b = transactional();
        let mut ha = a.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        let mut hb = b.open(tmp.path(), "spam", OpenMode::Write).unwrap();

        // both batches are staged before either commits
        let mut ja = Journal::begin();
        ja.increment(&ha, b"cash", 1, 0, 0).unwrap();
        ja.increment(&ha, MetaKey::MessageCount.token(), 1, 0, 0).unwrap();
        let mut jb = Journal::begin();
        jb.increment(&hb, b"cash", 1, 0, 0).unwrap();
        jb.increment(&hb, MetaKey::MessageCount.token(), 1, 0, 0).unwrap();

        ja.commit(&a, &mut [&mut ha]).unwrap();
        jb.commit(&b, &mut [&mut hb]).unwrap();

        ha.refresh().unwrap();
        hb.refresh().unwrap();
        for h in [&ha, &hb] {
            assert_eq!(h.read(b"cash").unwrap().map(|r| r.spam_count), Some(2));
            let messages = h.get_metadata(MetaKey::MessageCount).unwrap();
            assert_eq!(messages.map(|r| r.spam_count), Some(2));
        }
        a.close(ha, true).unwrap();
        b.close(hb, true).unwrap();
    }

    #[test]
    fn test_read_folds_increments_over_stored_value() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut j = Journal::begin();
            j.write(&h, b"cash", &CounterRecord::new(4, 0, 20240101)).unwrap();
            j.commit(&ds, &mut [&mut h]).unwrap();

            j.increment(&h, b"cash", 2, 1, 20231231).unwrap();
            let projected = j.read(&h, b"cash").unwrap().unwrap();
            assert_eq!(projected, CounterRecord::new(6, 1, 20240101));

            j.write(&h, b"cash", &CounterRecord::counts(1, 0)).unwrap();
            assert_eq!(j.increment(&h, b"cash", -3, 0, 0).unwrap(), CounterRecord::counts(0, 0));
            j.commit(&ds, &mut [&mut h]).unwrap();
            assert_eq!(h.read(b"cash").unwrap(), Some(CounterRecord::counts(0, 0)));
            ds.close(h, true).unwrap();
        }
    }

    #[test]
    fn test_increment_or_remove_deletes_empty_records() {
        for ds in stores() {
            let tmp = TempDir::new().unwrap();
            let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
            let mut j = Journal::begin();
            j.write(&h, b"cash", &CounterRecord::counts(1, 2)).unwrap();
            j.write(&h, b"prize", &CounterRecord::counts(1, 0)).unwrap();
            j.commit(&ds, &mut [&mut h]).unwrap();

            let cash = j.increment_or_remove(&h, b"cash", -1, 0, 0).unwrap();
            assert_eq!(cash, Some(CounterRecord::counts(0, 2)));
            assert_eq!(j.increment_or_remove(&h, b"prize", -1, 0, 0).unwrap(), None);
            j.commit(&ds, &mut [&mut h]).unwrap();

            assert_eq!(h.read(b"cash").unwrap(), Some(CounterRecord::counts(0, 2)));
            assert_eq!(h.read(b"prize").unwrap(), None);
            ds.close(h, true).unwrap();
        }
    }

    #[test]
    fn test_transactional_batch_refuses_two_directories() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        let ds = transactional();
        let mut a = ds.open(one.path(), "spam", OpenMode::Write).unwrap();
        let mut b = ds.open(two.path(), "spam", OpenMode::Write).unwrap();

        let mut j = Journal::begin();
        j.write(&a, b"first", &CounterRecord::counts(1, 0)).unwrap();
        j.write(&b, b"second", &CounterRecord::counts(1, 0)).unwrap();
        let err = j.commit(&ds, &mut [&mut a, &mut b]).unwrap_err();
        assert!(matches!(err, StoreError::MultipleDirectories { ref dirs } if dirs.len() == 2));
        assert_eq!(j.len(), 2);
        assert!(!a.in_transaction() && !b.in_transaction());

        // the same refusal for a direct multi-handle commit, before any log write
        ds.begin(&mut a).unwrap();
        ds.begin(&mut b).unwrap();
        a.write(b"first", &CounterRecord::counts(1, 0)).unwrap();
        b.write(b"second", &CounterRecord::counts(1, 0)).unwrap();
        let err = ds.commit_all(&mut [&mut a, &mut b]).unwrap_err();
        assert!(matches!(err, StoreError::MultipleDirectories { .. }));
        assert!(a.in_transaction() && b.in_transaction());
        ds.abort(&mut a);
        ds.abort(&mut b);

        assert_eq!(a.read(b"first").unwrap(), None);
        assert_eq!(b.read(b"second").unwrap(), None);
        ds.close(a, false).unwrap();
        ds.close(b, false).unwrap();
    }
}
