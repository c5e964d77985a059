//! Word lists as a scoring engine sees them.
//!
//! A classifier consults several lists ordered by precedence. Lookups stop at
//! the first precedence level holding the token; registrations go to the
//! writable lists of the first level.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use wordstore_core::record::today;
use wordstore_core::{CounterRecord, Datastore, Handle, Journal, MetaKey, OpenMode, StoreError};

use crate::error::{ToolError, ToolResult};

/// Which counters a list holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// Spam counts only
    Spam,
    /// Non-spam counts only
    Good,
    /// Both counts in one record
    Combined,
}

impl ListKind {
    fn holds_spam(self) -> bool {
        matches!(self, ListKind::Spam | ListKind::Combined)
    }

    fn holds_good(self) -> bool {
        matches!(self, ListKind::Good | ListKind::Combined)
    }

    /// The part of `rec` this kind of list owns.
    fn visible(self, rec: &CounterRecord) -> (u32, u32) {
        match self {
            ListKind::Spam => (rec.spam_count, 0),
            ListKind::Good => (0, rec.good_count),
            ListKind::Combined => (rec.spam_count, rec.good_count),
        }
    }
}

/// Where a list lives and how it is consulted.
#[derive(Debug, Clone)]
pub struct ListSpec {
    pub dir: PathBuf,
    pub name: String,
    pub kind: ListKind,
    /// Lower levels are consulted first
    pub precedence: u32,
    pub writable: bool,
}

impl ListSpec {
    pub fn new(dir: &Path, name: &str, kind: ListKind, precedence: u32) -> Self {
        Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            kind,
            precedence,
            writable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

/// Writable lists sharing a precedence level must share a directory, since
/// a registration commits as one transaction.
fn check_single_directory_levels(sorted: &[ListSpec]) -> ToolResult<()> {
    for (i, a) in sorted.iter().enumerate().filter(|(_, s)| s.writable) {
        let clash = sorted[i + 1..]
            .iter()
            .find(|b| b.writable && b.precedence == a.precedence && b.dir != a.dir);
        if let Some(b) = clash {
            return Err(ToolError::InvalidLists(format!(
                "writable lists at precedence {} live in different directories ({} and {})",
                a.precedence,
                a.dir.display(),
                b.dir.display()
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
struct WordList {
    spec: ListSpec,
    handle: Handle,
}

/// Open word lists, sorted by precedence.
#[derive(Debug)]
pub struct WordLists {
    ds: Datastore,
    lists: Vec<WordList>,
}

impl WordLists {
    /// Open every list in `specs`. Writable lists are created when missing.
    pub fn open(ds: Datastore, specs: &[ListSpec]) -> ToolResult<Self> {
        if specs.is_empty() {
            return Err(ToolError::InvalidLists("no lists given".into()));
        }
        let mut sorted = specs.to_vec();
        sorted.sort_by_key(|s| s.precedence);
        if ds.supports_transactions() {
            check_single_directory_levels(&sorted)?;
        }

        let mut lists: Vec<WordList> = Vec::with_capacity(sorted.len());
        for spec in sorted {
            let mode = if spec.writable {
                OpenMode::Write
            } else {
                OpenMode::Read
            };
            let handle = match ds.open(&spec.dir, &spec.name, mode) {
                Ok(h) => h,
                Err(e) => {
                    for open in lists.drain(..) {
                        if let Err(close_err) = ds.close(open.handle, false) {
                            warn!(
                                list = %open.spec.name,
                                error = %close_err,
                                "Failed to close word list after open failure"
                            );
                        }
                    }
                    return Err(e.into());
                }
            };
            lists.push(WordList { spec, handle });
        }
        debug!(lists = lists.len(), "Opened word lists");
        Ok(Self { ds, lists })
    }

    /// Spam and good counts for `token` from the first precedence level that
    /// holds it, summed over that level's lists. `(0, 0)` when no list does.
    pub fn lookup(&self, token: &[u8]) -> ToolResult<(u32, u32)> {
        let mut level: Option<u32> = None;
        let (mut spam, mut good) = (0u32, 0u32);
        for list in &self.lists {
            if level.is_some_and(|l| l != list.spec.precedence) {
                break;
            }
            let Some(rec) = list.handle.read(token)? else {
                continue;
            };
            let (s, g) = list.spec.kind.visible(&rec);
            spam = spam.saturating_add(s);
            good = good.saturating_add(g);
            level = Some(list.spec.precedence);
        }
        Ok((spam, good))
    }

    /// Count one message of `tokens` as spam or good.
    pub fn register<T: AsRef<[u8]>>(&mut self, tokens: &[T], as_spam: bool) -> ToolResult<()> {
        self.apply(tokens, as_spam, 1)
    }

    /// Take back an earlier [`WordLists::register`]. Counts stop at zero.
    pub fn unregister<T: AsRef<[u8]>>(&mut self, tokens: &[T], as_spam: bool) -> ToolResult<()> {
        self.apply(tokens, as_spam, -1)
    }

    fn apply<T: AsRef<[u8]>>(&mut self, tokens: &[T], as_spam: bool, delta: i64) -> ToolResult<()> {
        let writable = self.lists.iter().find(|l| l.spec.writable);
        let Some(first) = writable.map(|l| l.spec.precedence) else {
            return Err(ToolError::InvalidLists("no writable list".into()));
        };
        let holds = |kind: ListKind| {
            if as_spam {
                kind.holds_spam()
            } else {
                kind.holds_good()
            }
        };
        let (delta_spam, delta_good) = if as_spam { (delta, 0) } else { (0, delta) };
        let date = if self.ds.config().timestamps {
            today()
        } else {
            0
        };
        let distinct: BTreeSet<&[u8]> = tokens.iter().map(|t| t.as_ref()).collect();

        let mut journal = Journal::begin();
        let mut targets: Vec<&mut Handle> = Vec::new();
        for list in self.lists.iter_mut() {
            if list.spec.precedence != first || !list.spec.writable || !holds(list.spec.kind) {
                continue;
            }
            let handle = &list.handle;
            for token in &distinct {
                match journal.increment_or_remove(handle, token, delta_spam, delta_good, date) {
                    // overlong tokens are never stored
                    Ok(_) | Err(StoreError::TokenTooLong { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            let messages = MetaKey::MessageCount.token();
            journal.increment(handle, messages, delta_spam, delta_good, 0)?;
            targets.push(&mut list.handle);
        }
        if targets.is_empty() {
            return Err(ToolError::InvalidLists(format!(
                "no writable {} list at precedence {first}",
                if as_spam { "spam" } else { "good" }
            )));
        }

        journal.commit(&self.ds, &mut targets)?;
        debug!(
            tokens = distinct.len(),
            as_spam,
            delta,
            lists = targets.len(),
            "Applied message to word lists"
        );
        Ok(())
    }

    /// Registered message totals `(spam, good)` over every list.
    pub fn message_counts(&self) -> ToolResult<(u32, u32)> {
        let (mut spam, mut good) = (0u32, 0u32);
        for list in &self.lists {
            if let Some(rec) = list.handle.get_metadata(MetaKey::MessageCount)? {
                let (s, g) = list.spec.kind.visible(&rec);
                spam = spam.saturating_add(s);
                good = good.saturating_add(g);
            }
        }
        Ok((spam, good))
    }

    pub fn datastore(&self) -> &Datastore {
        &self.ds
    }

    /// Close every list; the first failure is returned after all were tried.
    pub fn close(self, sync: bool) -> ToolResult<()> {
        let mut first_err = None;
        for list in self.lists {
            if let Err(e) = self.ds.close(list.handle, sync) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
