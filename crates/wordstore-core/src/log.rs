//! Shared write-ahead log for the transactional backend
//!
//! The log is a sequence of segments `log-<seq>.wsl` in the store directory.
//! Every transaction is appended as one contiguous batch:
//! 1. Put/Delete records for each buffered write, in order
//! 2. A Commit record carrying the same transaction id
//! 3. durable_sync() on the segment
//!
//! Replay applies only transactions whose Commit record made it to disk, so a
//! writer killed mid-append leaves nothing visible behind. Positions in the
//! log are [`Lsn`]s; the checkpoint file records the LSN up to which every
//! committed transaction has been folded into the data files.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::datafile::LoadMode;
use crate::error::{StoreError, StoreResult};
use crate::format::{
    decode_log_record, encode_log_record, next_valid, Frame, LogType, CHECKPOINT_MAGIC,
    CHECKPOINT_SIZE, LOG_MAGIC,
};
use crate::platform::{durable_sync, sync_dir};

/// Checkpoint file name
pub const CHECKPOINT_FILE: &str = "checkpoint";

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".wsl";

/// Log sequence number: a byte position in a numbered segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    /// Segment sequence number (first segment is 1)
    pub segment: u64,
    /// Byte offset inside the segment
    pub offset: u64,
}

impl Lsn {
    /// Beginning of the first segment.
    pub const START: Lsn = Lsn {
        segment: 1,
        offset: 0,
    };

    pub const fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// One buffered mutation; `value` is `None` for a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOp {
    pub list: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// A transaction whose Commit record is on disk.
#[derive(Debug, Clone)]
pub struct CommittedTxn {
    /// Transaction id
    pub id: u64,
    /// Mutations in write order
    pub ops: Vec<LogOp>,
    /// Position just past the Commit record
    pub end: Lsn,
}

/// Result of scanning the log forward from some LSN.
#[derive(Debug)]
pub struct LogScan {
    /// Committed transactions in log order
    pub txns: Vec<CommittedTxn>,
    /// Position just past the last Commit record (or the scan start)
    pub commit_end: Lsn,
    /// Position just past the last intact record (or the scan start)
    pub valid_end: Lsn,
    /// The start segment has already been purged
    pub missing: bool,
    /// Damaged records skipped by a lenient scan
    pub skipped: usize,
}

/// Path of segment `seq`.
pub fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, seq, SEGMENT_SUFFIX))
}

/// Sequence numbers of every segment in `dir`, ascending.
pub fn segments(dir: &Path) -> StoreResult<Vec<u64>> {
    let entries =
        fs::read_dir(dir).map_err(|e| StoreError::io(dir, e, "Failed to read log directory"))?;
    let mut seqs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let hex = name
            .to_str()
            .and_then(|n| n.strip_prefix(SEGMENT_PREFIX))
            .and_then(|n| n.strip_suffix(SEGMENT_SUFFIX));
        if let Some(seq) = hex.and_then(|h| u64::from_str_radix(h, 16).ok()) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

fn read_segment(path: &Path, from: u64, buffer_bytes: usize) -> StoreResult<Vec<u8>> {
    let file =
        File::open(path).map_err(|e| StoreError::io(path, e, "Failed to open log segment"))?;
    let mut reader = BufReader::with_capacity(buffer_bytes, file);
    reader
        .seek(SeekFrom::Start(from))
        .map_err(|e| StoreError::io(path, e, "Failed to seek log segment"))?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .map_err(|e| StoreError::io(path, e, "Failed to read log segment"))?;
    Ok(buf)
}

/// Scan committed transactions from `from` to the end of the log.
///
/// Strict mode treats a damaged record as the torn tail of a crashed append
/// when nothing intact follows it in the last segment, and as corruption
/// otherwise. Lenient mode resynchronises on the next record magic.
pub fn scan(dir: &Path, from: Lsn, mode: LoadMode, buffer_bytes: usize) -> StoreResult<LogScan> {
    let segs = segments(dir)?;
    let mut out = LogScan {
        txns: Vec::new(),
        commit_end: from,
        valid_end: from,
        missing: false,
        skipped: 0,
    };

    match segs.first() {
        None => return Ok(out),
        Some(&first) if from.segment < first => {
            out.missing = true;
            return Ok(out);
        }
        Some(_) => {}
    }

    let mut pending: HashMap<u64, Vec<LogOp>> = HashMap::new();
    let last = segs.last().copied().unwrap_or(from.segment);

    for &seq in segs.iter().filter(|&&s| s >= from.segment) {
        let path = segment_path(dir, seq);
        let len = fs::metadata(&path)
            .map_err(|e| StoreError::io(&path, e, "Failed to stat log segment"))?
            .len();
        let start = if seq == from.segment {
            from.offset.min(len)
        } else {
            0
        };
        let buf = read_segment(&path, start, buffer_bytes)?;
        let is_last = seq == last;
        let mut pos = 0usize;

        while pos < buf.len() {
            let at = start + pos as u64;
            match decode_log_record(&buf[pos..]) {
                Frame::Record(rec, n) => {
                    pos += n;
                    let here = Lsn::new(seq, start + pos as u64);
                    out.valid_end = here;
                    match rec.kind {
                        LogType::Put => pending.entry(rec.txn).or_default().push(LogOp {
                            list: rec.list,
                            key: rec.key,
                            value: Some(rec.value),
                        }),
                        LogType::Delete => pending.entry(rec.txn).or_default().push(LogOp {
                            list: rec.list,
                            key: rec.key,
                            value: None,
                        }),
                        LogType::Commit => {
                            let ops = pending.remove(&rec.txn).unwrap_or_default();
                            out.txns.push(CommittedTxn {
                                id: rec.txn,
                                ops,
                                end: here,
                            });
                            out.commit_end = here;
                        }
                    }
                }
                Frame::Incomplete if is_last => {
                    warn!(path = %path.display(), offset = at, "Torn record at end of log");
                    break;
                }
                Frame::Incomplete => {
                    if mode == LoadMode::Strict {
                        return Err(StoreError::Corrupted {
                            path: path.clone(),
                            offset: at,
                            reason: "truncated record inside a sealed segment".into(),
                        });
                    }
                    warn!(
                        path = %path.display(),
                        offset = at,
                        "Skipping truncated end of sealed segment"
                    );
                    out.skipped += 1;
                    break;
                }
                Frame::Invalid(reason) => {
                    let next = next_valid(&buf, pos + 1, &LOG_MAGIC, decode_log_record);
                    match (mode, next) {
                        (LoadMode::Strict, None) if is_last => {
                            warn!(
                                path = %path.display(),
                                offset = at,
                                %reason,
                                "Damaged record at end of log"
                            );
                            break;
                        }
                        (LoadMode::Strict, _) => {
                            return Err(StoreError::Corrupted {
                                path: path.clone(),
                                offset: at,
                                reason,
                            });
                        }
                        (LoadMode::Lenient, None) => {
                            warn!(
                                path = %path.display(),
                                offset = at,
                                %reason,
                                "Dropping damaged end of segment"
                            );
                            out.skipped += 1;
                            break;
                        }
                        (LoadMode::Lenient, Some(next)) => {
                            warn!(
                                path = %path.display(),
                                offset = at,
                                %reason,
                                "Skipping damaged log record"
                            );
                            out.skipped += 1;
                            pos = next;
                        }
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        debug!(
            dir = %dir.display(),
            uncommitted = pending.len(),
            "Ignoring uncommitted log records"
        );
    }
    Ok(out)
}

/// Cut the log back to `end`: later segments are removed and the segment
/// holding `end` is truncated there.
pub fn truncate_log(dir: &Path, end: Lsn) -> StoreResult<()> {
    for seq in segments(dir)? {
        let path = segment_path(dir, seq);
        if seq > end.segment {
            fs::remove_file(&path)
                .map_err(|e| StoreError::io(&path, e, "Failed to remove log segment"))?;
        } else if seq == end.segment {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e, "Failed to open log segment"))?;
            let len = file
                .metadata()
                .map_err(|e| StoreError::io(&path, e, "Failed to stat log segment"))?
                .len();
            if len > end.offset {
                warn!(
                    path = %path.display(),
                    from = len,
                    to = end.offset,
                    "Truncating log after last commit"
                );
                file.set_len(end.offset)
                    .map_err(|e| StoreError::io(&path, e, "Failed to truncate log segment"))?;
                durable_sync(&file)
                    .map_err(|e| StoreError::io(&path, e, "Failed to sync log segment"))?;
            }
        }
    }
    sync_dir(dir).map_err(|e| StoreError::io(dir, e, "Failed to sync log directory"))
}

/// Delete every segment numbered below `keep_from`. Returns how many went.
pub fn remove_segments_before(dir: &Path, keep_from: u64) -> StoreResult<usize> {
    let mut removed = 0;
    for seq in segments(dir)?.into_iter().filter(|&s| s < keep_from) {
        let path = segment_path(dir, seq);
        fs::remove_file(&path)
            .map_err(|e| StoreError::io(&path, e, "Failed to remove log segment"))?;
        removed += 1;
    }
    if removed > 0 {
        sync_dir(dir).map_err(|e| StoreError::io(dir, e, "Failed to sync log directory"))?;
    }
    Ok(removed)
}

/// Last checkpoint LSN, or [`Lsn::START`] when none was written yet.
pub fn read_checkpoint(dir: &Path) -> StoreResult<Lsn> {
    let path = dir.join(CHECKPOINT_FILE);
    let data = match fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lsn::START),
        Err(e) => return Err(StoreError::io(&path, e, "Failed to read checkpoint")),
    };
    if data.len() != CHECKPOINT_SIZE || data[0..4] != CHECKPOINT_MAGIC {
        return Err(StoreError::Corrupted {
            path,
            offset: 0,
            reason: "malformed checkpoint file".into(),
        });
    }
    let stored = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
    let computed = crc32c::crc32c(&data[..20]);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            path,
            expected: stored,
            actual: computed,
            offset: 20,
        });
    }
    let mut seg = [0u8; 8];
    let mut off = [0u8; 8];
    seg.copy_from_slice(&data[4..12]);
    off.copy_from_slice(&data[12..20]);
    Ok(Lsn::new(u64::from_le_bytes(seg), u64::from_le_bytes(off)))
}

/// Durably record `lsn` as the checkpoint.
pub fn write_checkpoint(dir: &Path, lsn: Lsn) -> StoreResult<()> {
    let path = dir.join(CHECKPOINT_FILE);
    let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
    let mut data = Vec::with_capacity(CHECKPOINT_SIZE);
    data.extend_from_slice(&CHECKPOINT_MAGIC);
    data.extend_from_slice(&lsn.segment.to_le_bytes());
    data.extend_from_slice(&lsn.offset.to_le_bytes());
    data.extend_from_slice(&crc32c::crc32c(&data).to_le_bytes());

    let mut file =
        File::create(&tmp).map_err(|e| StoreError::io(&tmp, e, "Failed to create checkpoint"))?;
    file.write_all(&data)
        .map_err(|e| StoreError::io(&tmp, e, "Failed to write checkpoint"))?;
    durable_sync(&file).map_err(|e| StoreError::io(&tmp, e, "Failed to sync checkpoint"))?;
    drop(file);
    fs::rename(&tmp, &path)
        .map_err(|e| StoreError::io(&path, e, "Failed to install checkpoint"))?;
    sync_dir(dir).map_err(|e| StoreError::io(dir, e, "Failed to sync directory after checkpoint"))
}

/// Appends transactions to the tail segment.
///
/// The writer must only be used while holding the exclusive transaction lock;
/// it re-resolves the tail before each append because other processes share
/// the log.
#[derive(Debug)]
pub struct LogWriter {
    dir: PathBuf,
    segment_bytes: u64,
    current: Option<(u64, File)>,
    known_end: Lsn,
}

/// Outcome of appending one transaction.
#[derive(Debug, Clone, Copy)]
pub struct Appended {
    /// Transaction id written into every record
    pub txn: u64,
    /// Position just past the Commit record
    pub end: Lsn,
    /// Bytes written
    pub bytes: u64,
}

impl LogWriter {
    pub fn new(dir: &Path, segment_bytes: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            segment_bytes,
            current: None,
            known_end: Lsn::new(0, 0),
        }
    }

    fn open_segment(&mut self, seq: u64, create_new: bool) -> StoreResult<()> {
        let path = segment_path(&self.dir, seq);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e, "Failed to open log segment"))?;
        if create_new {
            sync_dir(&self.dir)
                .map_err(|e| StoreError::io(&self.dir, e, "Failed to sync log directory"))?;
            debug!(path = %path.display(), "Created log segment");
        }
        self.current = Some((seq, file));
        Ok(())
    }

    /// Locate the end of the last intact record, discarding any torn tail a
    /// crashed writer left behind.
    pub fn resolve_tail(&mut self) -> StoreResult<Lsn> {
        let last = match segments(&self.dir)?.last() {
            Some(&s) => s,
            None => {
                self.open_segment(Lsn::START.segment, true)?;
                self.known_end = Lsn::START;
                return Ok(Lsn::START);
            }
        };
        if self.current.as_ref().map(|(s, _)| *s) != Some(last) {
            self.open_segment(last, false)?;
        }
        let path = segment_path(&self.dir, last);
        let Some((_, file)) = self.current.as_mut() else {
            return Err(StoreError::NotFound {
                what: "log segment",
                path,
            });
        };
        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e, "Failed to stat log segment"))?
            .len();
        if self.known_end == Lsn::new(last, len) {
            return Ok(self.known_end);
        }

        // resume from the last known end when it is still inside the segment
        let start = if self.known_end.segment == last && self.known_end.offset <= len {
            self.known_end.offset
        } else {
            0
        };
        file.seek(SeekFrom::Start(start))
            .map_err(|e| StoreError::io(&path, e, "Failed to seek log segment"))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| StoreError::io(&path, e, "Failed to read log segment"))?;

        let mut pos = 0usize;
        while let Frame::Record(_, n) = decode_log_record(&buf[pos..]) {
            pos += n;
        }
        let valid = start + pos as u64;
        if valid < len {
            warn!(path = %path.display(), valid, len, "Discarding torn log tail");
            file.set_len(valid)
                .map_err(|e| StoreError::io(&path, e, "Failed to truncate log segment"))?;
            durable_sync(file)
                .map_err(|e| StoreError::io(&path, e, "Failed to sync log segment"))?;
        }
        self.known_end = Lsn::new(last, valid);
        Ok(self.known_end)
    }

    /// Start a new segment after the current tail.
    pub fn rotate(&mut self) -> StoreResult<Lsn> {
        let tail = self.resolve_tail()?;
        if tail.offset == 0 {
            return Ok(tail);
        }
        if let Some((_, file)) = self.current.as_ref() {
            let path = segment_path(&self.dir, tail.segment);
            durable_sync(file)
                .map_err(|e| StoreError::io(&path, e, "Log sync before rotation failed"))?;
        }
        let next = tail.segment + 1;
        self.open_segment(next, true)?;
        self.known_end = Lsn::new(next, 0);
        Ok(self.known_end)
    }

    /// Append `ops` as one committed transaction and make it durable.
    ///
    /// On failure the segment is cut back to where the batch began so no
    /// partial transaction is left for the next writer to trip over.
    pub fn append_txn(&mut self, ops: &[LogOp]) -> StoreResult<Appended> {
        let mut at = self.resolve_tail()?;
        if at.offset >= self.segment_bytes {
            at = self.rotate()?;
        }
        let txn = (at.segment << 40) | at.offset;

        let mut batch = Vec::new();
        for op in ops {
            let rec = match &op.value {
                Some(v) => encode_log_record(LogType::Put, txn, &op.list, &op.key, v),
                None => encode_log_record(LogType::Delete, txn, &op.list, &op.key, &[]),
            };
            batch.extend_from_slice(&rec);
        }
        batch.extend_from_slice(&encode_log_record(LogType::Commit, txn, "", &[], &[]));

        let path = segment_path(&self.dir, at.segment);
        let Some((_, file)) = self.current.as_mut() else {
            return Err(StoreError::NotFound {
                what: "log segment",
                path,
            });
        };
        let written = file
            .seek(SeekFrom::Start(at.offset))
            .and_then(|_| file.write_all(&batch))
            .and_then(|_| durable_sync(file));
        if let Err(e) = written {
            if let Err(undo) = file.set_len(at.offset) {
                warn!(
                    path = %path.display(),
                    error = %undo,
                    "Failed to cut back partial log append"
                );
            }
            self.known_end = Lsn::new(0, 0);
            return Err(StoreError::io(&path, e, "Log append failed"));
        }

        let end = Lsn::new(at.segment, at.offset + batch.len() as u64);
        self.known_end = end;
        debug!(txn, ops = ops.len(), %end, "Committed log transaction");
        Ok(Appended {
            txn,
            end,
            bytes: batch.len() as u64,
        })
    }
}
