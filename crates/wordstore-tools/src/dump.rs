//! Text dump and load of a wordlist.
//!
//! One record per line: `<token> <count>[ <YYYYMMDD>]`. The date column is
//! present only for records that carry one.

use std::io::{BufRead, Write};

use tracing::{debug, info, warn};
use wordstore_core::record::{is_metadata_key, is_valid_date};
use wordstore_core::{CounterRecord, Datastore, Handle, Journal, MetaKey, StoreError, Visit};

use crate::error::{ToolError, ToolResult};

/// Staged records per journal commit while loading.
const LOAD_BATCH: usize = 1000;

/// Which counter a single-count dump line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountField {
    Spam,
    Good,
}

impl CountField {
    /// `good` lists count non-spam; every other list counts spam.
    pub fn for_list(name: &str) -> Self {
        if name == "good" {
            CountField::Good
        } else {
            CountField::Spam
        }
    }

    pub fn get(self, rec: &CounterRecord) -> u32 {
        match self {
            CountField::Spam => rec.spam_count,
            CountField::Good => rec.good_count,
        }
    }

    /// `(spam, good)` deltas that add `count` to this field.
    fn deltas(self, count: u32) -> (i64, i64) {
        match self {
            CountField::Spam => (i64::from(count), 0),
            CountField::Good => (0, i64::from(count)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpOptions {
    /// Counter to print; derived from the list name when unset
    pub field: Option<CountField>,
    /// Print bytes outside ASCII as `?`
    pub replace_non_ascii: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Counter the count column feeds; derived from the list name when unset
    pub field: Option<CountField>,
}

/// Outcome of [`load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Lines read, blank ones included
    pub lines: usize,
    /// Records merged into the list
    pub merged: usize,
    /// Records skipped (overlong tokens, schema version lines)
    pub skipped: usize,
}

/// Write every record of `handle` to `out`. Returns the number of lines.
pub fn dump<W: Write>(handle: &Handle, out: &mut W, options: &DumpOptions) -> ToolResult<usize> {
    let field = options.field.unwrap_or_else(|| CountField::for_list(handle.list()));
    let mut lines = 0usize;
    let mut failure: Option<std::io::Error> = None;
    let mut line = Vec::with_capacity(64);

    handle.for_each(|token, rec| {
        line.clear();
        if options.replace_non_ascii {
            line.extend(token.iter().map(|&b| if b.is_ascii() { b } else { b'?' }));
        } else {
            line.extend_from_slice(token);
        }
        line.extend_from_slice(format!(" {}", field.get(rec)).as_bytes());
        if rec.last_seen != 0 {
            line.extend_from_slice(format!(" {}", rec.last_seen).as_bytes());
        }
        line.push(b'\n');
        match out.write_all(&line) {
            Ok(()) => {
                lines += 1;
                Visit::Continue
            }
            Err(e) => {
                failure = Some(e);
                Visit::Stop
            }
        }
    })?;

    if let Some(e) = failure {
        return Err(e.into());
    }
    out.flush()?;
    debug!(list = %handle.list(), lines, "Dumped wordlist");
    Ok(lines)
}

/// One parsed dump line.
#[derive(Debug, PartialEq, Eq)]
struct DumpLine<'a> {
    token: &'a [u8],
    count: u32,
    date: u32,
}

fn parse_line(raw: &[u8], line: usize) -> ToolResult<Option<DumpLine<'_>>> {
    let mut fields = raw
        .split(|b| b.is_ascii_whitespace())
        .filter(|f| !f.is_empty());
    let Some(token) = fields.next() else {
        return Ok(None);
    };
    let fail = |reason: String| ToolError::Parse { line, reason };
    let number = |field: Option<&[u8]>, what: &str| -> ToolResult<Option<u32>> {
        let Some(field) = field else {
            return Ok(None);
        };
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(Some)
            .ok_or_else(|| fail(format!("invalid {what} '{}'", String::from_utf8_lossy(field))))
    };

    let Some(count) = number(fields.next(), "count")? else {
        return Err(fail("missing count".into()));
    };
    let date = number(fields.next(), "date")?.unwrap_or(0);
    if date != 0 && !is_valid_date(date) {
        return Err(fail(format!("invalid date {date}")));
    }
    if fields.next().is_some() {
        return Err(fail("trailing fields".into()));
    }
    Ok(Some(DumpLine { token, count, date }))
}

/// Merge a dump into `handle`: counts add to what is stored and the newer
/// date wins. Records are staged as increments in a [`Journal`] and committed
/// in batches, so a parse error leaves earlier batches applied and the
/// current one dropped.
pub fn load<R: BufRead>(
    ds: &Datastore,
    handle: &mut Handle,
    mut input: R,
    options: &LoadOptions,
) -> ToolResult<LoadStats> {
    let field = options.field.unwrap_or_else(|| CountField::for_list(handle.list()));
    let mut stats = LoadStats::default();
    let mut journal = Journal::begin();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if input.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        stats.lines += 1;
        let Some(parsed) = parse_line(&raw, stats.lines)? else {
            continue;
        };
        if parsed.token == MetaKey::WordlistVersion.token() {
            // the target list keeps its own schema version
            stats.skipped += 1;
            continue;
        }

        let (delta_spam, delta_good) = field.deltas(parsed.count);
        let date = if is_metadata_key(parsed.token) {
            0
        } else {
            parsed.date
        };
        match journal.increment(handle, parsed.token, delta_spam, delta_good, date) {
            Ok(_) => stats.merged += 1,
            Err(StoreError::TokenTooLong { len, max }) => {
                warn!(line = stats.lines, len, max, "Skipping overlong token");
                stats.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }

        if journal.len() >= LOAD_BATCH {
            journal.commit(ds, &mut [&mut *handle])?;
        }
    }
    journal.commit(ds, &mut [&mut *handle])?;

    info!(
        list = %handle.list(),
        lines = stats.lines,
        merged = stats.merged,
        skipped = stats.skipped,
        "Loaded wordlist"
    );
    Ok(stats)
}
