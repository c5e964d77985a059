//! Wordstore Tools: maintenance and scoring adapters
//!
//! Builds on `wordstore-core` to provide what a spam filter needs around its
//! token store:
//!
//! - [`dump`]: text dump and merge-load of a wordlist
//! - [`prune`]: threshold pruning of rare, stale and overlong tokens
//! - [`maintenance`]: forced recovery, log purging and verification
//! - [`wordlists`]: precedence-ordered lists for lookups and message
//!   registration

pub mod dump;
pub mod error;
pub mod maintenance;
pub mod prune;
pub mod wordlists;

pub use dump::{dump, load, CountField, DumpOptions, LoadOptions, LoadStats};
pub use error::{ToolError, ToolResult};
pub use maintenance::{purge_logs, recover, verify, ListReport, VerifyReport};
pub use prune::prune;
pub use wordlists::{ListKind, ListSpec, WordLists};
