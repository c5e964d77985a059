//! Binary framing for data files, log segments and the checkpoint file
//!
//! Data file:
//!   FileHeader (16 bytes) followed by DataRecords
//!
//! DataRecord:
//!   [0..4]   magic:     "WREC"
//!   [4..6]   key_len:   u16 LE
//!   [6..10]  value_len: u32 LE
//!   [10..14] checksum:  u32 LE - CRC32C of (key_bytes + value_bytes)
//!   [14]     flags:     u8     - bit 0 = tombstone
//!   [15]     reserved
//!   key_bytes + value_bytes
//!
//! LogRecord:
//!   [0..4]   magic:     "WLOG"
//!   [4..8]   length:    u32 LE - payload length
//!   [8..12]  checksum:  u32 LE - CRC32C of payload
//!   [12]     type:      u8     - Put=1, Delete=2, Commit=3
//!   [13..16] reserved
//!   payload: txn(u64) + list_len(u16) + key_len(u16) + value_len(u32) + list + key + value

use std::path::Path;

use crate::codec::ByteOrder;
use crate::error::{StoreError, StoreResult};

/// Data file magic
pub const FILE_MAGIC: [u8; 4] = *b"WSDB";

/// Current data file format version
pub const FILE_VERSION: u16 = 1;

/// Data file header size
pub const FILE_HEADER_SIZE: usize = 16;

/// Data record magic
pub const RECORD_MAGIC: [u8; 4] = *b"WREC";

/// Data record header size
pub const RECORD_HEADER_SIZE: usize = 16;

/// Log record magic
pub const LOG_MAGIC: [u8; 4] = *b"WLOG";

/// Log record header size
pub const LOG_HEADER_SIZE: usize = 16;

/// Fixed part of a log payload: txn + list_len + key_len + value_len
const LOG_FIXED_PAYLOAD: usize = 8 + 2 + 2 + 4;

/// Checkpoint file magic
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"WCKP";

/// Checkpoint file size: magic + segment + offset + crc
pub const CHECKPOINT_SIZE: usize = 4 + 8 + 8 + 4;

/// Largest value blob a record may carry
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

const FLAG_TOMBSTONE: u8 = 0x01;

/// Data file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version
    pub version: u16,
    /// Byte order of the value blobs
    pub byte_order: ByteOrder,
}

impl FileHeader {
    /// Header for a new file written by this machine.
    pub fn native() -> Self {
        Self {
            version: FILE_VERSION,
            byte_order: ByteOrder::native(),
        }
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.byte_order.tag();
        buf
    }

    /// Parse and validate a header read from `path`.
    pub fn from_bytes(path: &Path, buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < FILE_HEADER_SIZE || buf[0..4] != FILE_MAGIC {
            return Err(StoreError::Corrupted {
                path: path.to_path_buf(),
                offset: 0,
                reason: "missing data file header".into(),
            });
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > FILE_VERSION {
            return Err(StoreError::VersionMismatch {
                path: path.to_path_buf(),
                found: version as u32,
                supported: FILE_VERSION as u32,
            });
        }
        let byte_order = ByteOrder::from_tag(buf[6]).ok_or_else(|| StoreError::Corrupted {
            path: path.to_path_buf(),
            offset: 6,
            reason: format!("unknown byte-order tag 0x{:02x}", buf[6]),
        })?;
        Ok(Self { version, byte_order })
    }
}

/// One data record; `value` is `None` for a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Serialize a data record (header + key + value).
pub fn encode_data_record(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let body = value.unwrap_or(&[]);
    let mut crc = crc32c::crc32c(key);
    crc = crc32c::crc32c_append(crc, body);

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + key.len() + body.len());
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.push(if value.is_none() { FLAG_TOMBSTONE } else { 0 });
    buf.push(0);
    buf.extend_from_slice(key);
    buf.extend_from_slice(body);
    buf
}

/// Outcome of decoding one framed record from a buffer.
#[derive(Debug)]
pub enum Frame<T> {
    /// A verified record and its total encoded size
    Record(T, usize),
    /// The buffer ends inside the record
    Incomplete,
    /// Bad magic, checksum or structure
    Invalid(String),
}

/// Decode the data record at the start of `buf`.
pub fn decode_data_record(buf: &[u8]) -> Frame<DataRecord> {
    if buf.len() < RECORD_HEADER_SIZE {
        return if buf.len() >= 4 && buf[0..4] != RECORD_MAGIC {
            Frame::Invalid("bad record magic".into())
        } else {
            Frame::Incomplete
        };
    }
    if buf[0..4] != RECORD_MAGIC {
        return Frame::Invalid("bad record magic".into());
    }
    let key_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    let value_len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    let checksum = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let flags = buf[14];

    if value_len > MAX_VALUE_SIZE {
        return Frame::Invalid(format!("value_len {} exceeds {}", value_len, MAX_VALUE_SIZE));
    }
    let total = RECORD_HEADER_SIZE + key_len + value_len;
    if buf.len() < total {
        return Frame::Incomplete;
    }
    let key = &buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len];
    let value = &buf[RECORD_HEADER_SIZE + key_len..total];
    let computed = crc32c::crc32c_append(crc32c::crc32c(key), value);
    if computed != checksum {
        return Frame::Invalid(format!(
            "checksum mismatch: expected 0x{checksum:08x}, got 0x{computed:08x}"
        ));
    }
    let value = if flags & FLAG_TOMBSTONE != 0 {
        None
    } else {
        Some(value.to_vec())
    };
    let key = key.to_vec();
    Frame::Record(DataRecord { key, value }, total)
}

/// Log record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogType {
    /// Insert or replace a token's value
    Put = 1,
    /// Remove a token
    Delete = 2,
    /// Marks every earlier record of the transaction as committed
    Commit = 3,
}

impl LogType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(LogType::Put),
            2 => Some(LogType::Delete),
            3 => Some(LogType::Commit),
            _ => None,
        }
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: LogType,
    pub txn: u64,
    pub list: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Serialize a log record (header + payload).
pub fn encode_log_record(kind: LogType, txn: u64, list: &str, key: &[u8], value: &[u8]) -> Vec<u8> {
    let payload_len = LOG_FIXED_PAYLOAD + list.len() + key.len() + value.len();
    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&txn.to_le_bytes());
    payload.extend_from_slice(&(list.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.extend_from_slice(list.as_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let mut buf = Vec::with_capacity(LOG_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&LOG_MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&payload);
    buf
}

/// Decode the log record at the start of `buf`.
pub fn decode_log_record(buf: &[u8]) -> Frame<LogRecord> {
    if buf.len() < LOG_HEADER_SIZE {
        return if buf.len() >= 4 && buf[0..4] != LOG_MAGIC {
            Frame::Invalid("bad log magic".into())
        } else {
            Frame::Incomplete
        };
    }
    if buf[0..4] != LOG_MAGIC {
        return Frame::Invalid("bad log magic".into());
    }
    let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let checksum = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let Some(kind) = LogType::from_u8(buf[12]) else {
        return Frame::Invalid(format!("invalid record type {}", buf[12]));
    };
    if length > MAX_VALUE_SIZE + u16::MAX as usize * 2 + LOG_FIXED_PAYLOAD {
        return Frame::Invalid(format!("payload length {} is implausible", length));
    }
    let total = LOG_HEADER_SIZE + length;
    if buf.len() < total {
        return Frame::Incomplete;
    }
    let payload = &buf[LOG_HEADER_SIZE..total];
    let computed = crc32c::crc32c(payload);
    if computed != checksum {
        return Frame::Invalid(format!(
            "checksum mismatch: expected 0x{checksum:08x}, got 0x{computed:08x}"
        ));
    }
    if payload.len() < LOG_FIXED_PAYLOAD {
        return Frame::Invalid("payload too short for header fields".into());
    }

    let mut txn = [0u8; 8];
    txn.copy_from_slice(&payload[0..8]);
    let list_len = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    let key_len = u16::from_le_bytes([payload[10], payload[11]]) as usize;
    let value_len =
        u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
    let list_end = LOG_FIXED_PAYLOAD + list_len;
    let key_end = list_end + key_len;
    if payload.len() != key_end + value_len {
        return Frame::Invalid("payload field lengths disagree with record length".into());
    }
    let Ok(list) = std::str::from_utf8(&payload[LOG_FIXED_PAYLOAD..list_end]) else {
        return Frame::Invalid("list name is not UTF-8".into());
    };

    Frame::Record(
        LogRecord {
            kind,
            txn: u64::from_le_bytes(txn),
            list: list.to_string(),
            key: payload[list_end..key_end].to_vec(),
            value: payload[key_end..].to_vec(),
        },
        total,
    )
}

/// Scan forward in `buf` for the next occurrence of `magic` at or after `start`.
pub fn find_next_magic(buf: &[u8], start: usize, magic: &[u8; 4]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (start..=buf.len() - 4).find(|&i| &buf[i..i + 4] == magic)
}

/// Offset of the next record at or after `start` that decodes cleanly.
pub fn next_valid<T>(
    buf: &[u8],
    start: usize,
    magic: &[u8; 4],
    decode: fn(&[u8]) -> Frame<T>,
) -> Option<usize> {
    let mut from = start;
    while let Some(pos) = find_next_magic(buf, from, magic) {
        if let Frame::Record(..) = decode(&buf[pos..]) {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}
