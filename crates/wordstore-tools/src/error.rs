//! Error types for the maintenance tools.

use std::path::PathBuf;

use thiserror::Error;
use wordstore_core::StoreError;

/// Result type alias for tool operations
pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A dump line that cannot be parsed
    #[error("Line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Word-list setup that cannot work
    #[error("Invalid word lists: {0}")]
    InvalidLists(String),

    #[error("Verification of {} found {problems} problem(s)", .dir.display())]
    VerifyFailed { dir: PathBuf, problems: usize },
}

impl ToolError {
    /// Whether the CLI should stop without touching the store again.
    pub fn is_fatal(&self) -> bool {
        match self {
            ToolError::Store(e) => e.is_fatal(),
            ToolError::VerifyFailed { .. } => true,
            _ => false,
        }
    }
}
