//! Per-list data files
//!
//! A list lives in `<dir>/<list>.db`: a [`FileHeader`] followed by data
//! records, last record per token wins. Loading folds the records into an
//! ordered map. Rewrites use the atomic rename pattern:
//! 1. Write live entries to `<list>.db.compact`
//! 2. durable_sync the temp file
//! 3. Rename temp file over the original (atomic on POSIX)
//! 4. durable_sync the directory

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::format::{
    decode_data_record, encode_data_record, next_valid, FileHeader, Frame, FILE_HEADER_SIZE,
    RECORD_MAGIC,
};
use crate::platform::{durable_sync, sync_dir};

/// Data file extension
pub const DATA_EXTENSION: &str = "db";

/// How damaged files are treated while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Bad records before the tail are errors; a torn tail is ignored
    Strict,
    /// Bad records are skipped by resynchronising on the next record magic
    Lenient,
}

/// Everything a load recovers from a data file.
#[derive(Debug)]
pub struct DataFileContents {
    /// Parsed header
    pub header: FileHeader,
    /// Live entries in token order
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Offset just past the last good record
    pub valid_len: u64,
    /// Length of the file on disk
    pub file_len: u64,
    /// Bad records skipped by a lenient load
    pub skipped: usize,
}

/// Reject names that could escape the directory or collide with environment files.
pub fn validate_list_name(name: &str) -> StoreResult<()> {
    let ok_chars = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    let dotted = name.starts_with('.') || name.ends_with('.') || name.contains("..");
    if name.is_empty() || !ok_chars || dotted {
        return Err(StoreError::InvalidListName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Path of the data file for `list`.
pub fn data_file_path(dir: &Path, list: &str) -> PathBuf {
    dir.join(format!("{}.{}", list, DATA_EXTENSION))
}

/// Names of every list with a data file in `dir`, sorted.
pub fn list_names(dir: &Path) -> StoreResult<Vec<String>> {
    let entries =
        fs::read_dir(dir).map_err(|e| StoreError::io(dir, e, "Failed to read store directory"))?;
    let mut names = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if validate_list_name(stem).is_ok() {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Load a data file into memory.
pub fn read_data_file(
    path: &Path,
    mode: LoadMode,
    buffer_bytes: usize,
) -> StoreResult<DataFileContents> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound {
            what: "list",
            path: path.to_path_buf(),
        },
        _ => StoreError::io(path, e, "Failed to open data file"),
    })?;
    read_from(file, path, mode, buffer_bytes)
}

/// Load a data file from an already open descriptor.
pub fn read_from(
    file: File,
    path: &Path,
    mode: LoadMode,
    buffer_bytes: usize,
) -> StoreResult<DataFileContents> {
    let mut buf = Vec::new();
    let mut reader = BufReader::with_capacity(buffer_bytes, file);
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| StoreError::io(path, e, "Failed to seek data file"))?;
    reader
        .read_to_end(&mut buf)
        .map_err(|e| StoreError::io(path, e, "Failed to read data file"))?;
    parse(path, &buf, mode)
}

fn parse(path: &Path, buf: &[u8], mode: LoadMode) -> StoreResult<DataFileContents> {
    let header = match FileHeader::from_bytes(path, buf) {
        Ok(h) => h,
        Err(StoreError::Corrupted { .. }) if mode == LoadMode::Lenient => {
            warn!(
                path = %path.display(),
                "Data file header unreadable; assuming native byte order"
            );
            FileHeader::native()
        }
        Err(e) => return Err(e),
    };

    let mut entries = BTreeMap::new();
    let mut skipped = 0usize;
    let mut offset = FILE_HEADER_SIZE.min(buf.len());
    let mut valid_len = offset;

    while offset < buf.len() {
        match decode_data_record(&buf[offset..]) {
            Frame::Record(rec, n) => {
                match rec.value {
                    Some(v) => entries.insert(rec.key, v),
                    None => entries.remove(&rec.key),
                };
                offset += n;
                valid_len = offset;
            }
            Frame::Incomplete => {
                warn!(
                    path = %path.display(),
                    offset,
                    "Ignoring incomplete record at end of data file"
                );
                break;
            }
            Frame::Invalid(reason) => {
                let next = next_valid(buf, offset + 1, &RECORD_MAGIC, decode_data_record);
                match (mode, next) {
                    (_, None) => {
                        warn!(
                            path = %path.display(),
                            offset,
                            %reason,
                            "Ignoring damaged tail of data file"
                        );
                        break;
                    }
                    (LoadMode::Strict, Some(_)) => {
                        return Err(StoreError::Corrupted {
                            path: path.to_path_buf(),
                            offset: offset as u64,
                            reason,
                        });
                    }
                    (LoadMode::Lenient, Some(next)) => {
                        warn!(
                            path = %path.display(),
                            offset,
                            %reason,
                            "Skipping damaged data record"
                        );
                        skipped += 1;
                        offset = next;
                    }
                }
            }
        }
    }

    debug!(path = %path.display(), entries = entries.len(), skipped, "Loaded data file");
    Ok(DataFileContents {
        header,
        entries,
        valid_len: valid_len as u64,
        file_len: buf.len() as u64,
        skipped,
    })
}

/// Atomically replace `path` with a file holding exactly `entries`.
pub fn write_data_file<'a, I>(
    path: &Path,
    header: &FileHeader,
    entries: I,
    buffer_bytes: usize,
) -> StoreResult<u64>
where
    I: IntoIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".compact");
    let tmp = PathBuf::from(tmp);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| StoreError::io(&tmp, e, "Failed to create compact file"))?;

    let mut out = BufWriter::with_capacity(buffer_bytes, file);
    let mut written = FILE_HEADER_SIZE as u64;
    out.write_all(&header.to_bytes())
        .map_err(|e| StoreError::io(&tmp, e, "Failed to write data file header"))?;
    for (key, value) in entries {
        let rec = encode_data_record(key, Some(value.as_slice()));
        out.write_all(&rec)
            .map_err(|e| StoreError::io(&tmp, e, "Failed to write compacted record"))?;
        written += rec.len() as u64;
    }
    let file = out
        .into_inner()
        .map_err(|e| StoreError::io(&tmp, e.into_error(), "Failed to flush compact file"))?;
    durable_sync(&file)
        .map_err(|e| StoreError::io(&tmp, e, "Failed to sync compact file"))?;
    drop(file);

    fs::rename(&tmp, path)
        .map_err(|e| StoreError::io(path, e, "Failed to rename compact file"))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)
            .map_err(|e| StoreError::io(parent, e, "Failed to sync directory after rewrite"))?;
    }
    debug!(path = %path.display(), bytes = written, "Rewrote data file");
    Ok(written)
}

/// Appends records to a data file held open by a single writer.
#[derive(Debug)]
pub struct DataFileWriter {
    file: File,
    path: PathBuf,
    len: u64,
}

impl DataFileWriter {
    /// Wrap an open descriptor; the file is cut back to `valid_len` first so
    /// new records never follow a torn one.
    pub fn new(file: File, path: &Path, valid_len: u64, file_len: u64) -> StoreResult<Self> {
        if valid_len < file_len {
            warn!(path = %path.display(), valid_len, file_len, "Truncating torn tail of data file");
            file.set_len(valid_len)
                .map_err(|e| StoreError::io(path, e, "Failed to truncate data file"))?;
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len: valid_len,
        })
    }

    /// The underlying descriptor.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Append a put (`Some`) or tombstone (`None`) record.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> StoreResult<()> {
        let rec = encode_data_record(key, value);
        self.file
            .seek(SeekFrom::Start(self.len))
            .map_err(|e| StoreError::io(&self.path, e, "Failed to seek data file"))?;
        self.file
            .write_all(&rec)
            .map_err(|e| StoreError::io(&self.path, e, "Data file write failed"))?;
        self.len += rec.len() as u64;
        Ok(())
    }

    /// Flush appended records to persistent storage.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StoreError::io(&self.path, e, "Data file durable_sync failed"))
    }

    /// Current length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }
}
