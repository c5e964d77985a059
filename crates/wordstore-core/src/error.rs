//! Error types for wordstore operations
//!
//! All storage errors are represented by the StoreError enum. Errors are
//! returned as values; nothing in this crate terminates the process. Callers
//! use [`StoreError::is_fatal`] to decide whether the store may still be used.

use std::path::{Path, PathBuf};

use thiserror::Error;

fn show(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}

/// wordstore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", show(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// List or directory does not exist
    #[error("{what} not found: {}", .path.display())]
    NotFound {
        /// What was looked up ("list", "directory")
        what: &'static str,
        /// Path that was probed
        path: PathBuf,
    },

    /// The OS refused access to a store file
    #[error("Permission denied: {}", .path.display())]
    PermissionDenied {
        /// File that could not be opened
        path: PathBuf,
    },

    /// Stored schema version is newer than this build understands
    #[error("Wordlist {} has schema version {found}, newest is {supported}", .path.display())]
    VersionMismatch {
        /// Data file carrying the version record
        path: PathBuf,
        /// Version found on disk
        found: u32,
        /// Newest version this build supports
        supported: u32,
    },

    /// Encoded counter record has an impossible length
    #[error("Malformed counter record: {len} bytes (expected 8 or 12)")]
    MalformedRecord {
        /// Length of the raw value
        len: usize,
    },

    /// Lock still held by someone else after all retries
    #[error("Lock contention on {} after {attempts} attempts", .resource.display())]
    LockContention {
        /// Locked file
        resource: PathBuf,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Every cell of the process table is claimed
    #[error("Process table {} is full ({cells} cells)", .path.display())]
    LockTableFull {
        /// Lock-cell file
        path: PathBuf,
        /// Number of cells in the file
        cells: usize,
    },

    /// Write attempted on a transactional handle without `begin`
    #[error("No active transaction on list '{list}'")]
    NoActiveTransaction {
        /// List name
        list: String,
    },

    /// `begin` called on a handle that already has a transaction
    #[error("Transaction already active on list '{list}'")]
    TransactionActive {
        /// List name
        list: String,
    },

    /// Write attempted on a handle opened for reading
    #[error("List '{list}' is open read-only")]
    ReadOnly {
        /// List name
        list: String,
    },

    /// The list is already open in this process
    #[error("List '{list}' in {} is already open", .dir.display())]
    AlreadyOpen {
        /// Store directory
        dir: PathBuf,
        /// List name
        list: String,
    },

    /// Token exceeds the configured maximum
    #[error("Token too long: {len} bytes exceeds limit of {max} bytes")]
    TokenTooLong {
        /// Token length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// List name would collide with environment files or escape the directory
    #[error("Invalid list name '{name}'")]
    InvalidListName {
        /// Rejected name
        name: String,
    },

    /// Environment recovery could not repair the store
    #[error("Recovery failed in {}: {reason}", .dir.display())]
    RecoveryFailed {
        /// Store directory
        dir: PathBuf,
        /// Description of the last failure
        reason: String,
    },

    /// Environment is in the Failed state and refuses service
    #[error("Environment {} is unusable after a failed recovery", .dir.display())]
    EnvironmentFailed {
        /// Store directory
        dir: PathBuf,
    },

    /// Operation requires the store to be idle
    #[error("Store {} is busy: {reason}", .dir.display())]
    Busy {
        /// Store directory
        dir: PathBuf,
        /// Why the operation was refused
        reason: String,
    },

    /// Journal entry targets a handle that was not supplied to commit
    #[error("Journal entry targets list '{list}' whose handle was not supplied")]
    UnknownHandle {
        /// List name of the missing handle
        list: String,
    },

    /// One transactional commit asked to span more than one store directory
    #[error("Transaction spans {} directories; a commit covers one", .dirs.len())]
    MultipleDirectories {
        /// The directories involved
        dirs: Vec<PathBuf>,
    },

    /// Checksum verification failed
    #[error(
        "Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// Structural corruption in a data file or log segment
    #[error("Corruption in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// Corrupted file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &Path, err: std::io::Error, message: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path: path.to_path_buf(),
            },
            kind => StoreError::Io {
                path: Some(path.to_path_buf()),
                kind,
                message: format!("{}: {}", message, err),
            },
        }
    }

    /// Errors after which the store must not be used for classification.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::RecoveryFailed { .. }
                | StoreError::EnvironmentFailed { .. }
                | StoreError::VersionMismatch { .. }
                | StoreError::NoActiveTransaction { .. }
        )
    }

    /// Transient errors worth retrying after a pause.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockContention { .. })
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for wordstore operations
pub type StoreResult<T> = Result<T, StoreError>;
