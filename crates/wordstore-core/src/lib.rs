//! Wordstore Core: Crash-Safe Token Counts for Bayesian Filters
//!
//! A small storage engine for the per-token spam/good counters a statistical
//! spam classifier learns from. Each wordlist is a file of token → counter
//! records inside a store directory.
//!
//! # Architecture
//!
//! - **Traditional backend**: lists are read into memory and written straight
//!   back under whole-file locks; one writer at a time
//! - **Transactional backend**: writes go to a shared write-ahead log first and
//!   reach the list files at checkpoints; many writers, crash recovery
//! - **Lock cells**: a per-directory process table detects writers that died
//!   without closing, triggering recovery on the next open
//! - **Journal**: stages writes across lists and applies them as one batch
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use wordstore_core::{Config, Datastore, OpenMode};
//!
//! let ds = Datastore::new(Config::transactional())?;
//! let mut spam = ds.open(Path::new("/var/lib/filter"), "spam", OpenMode::Write)?;
//! ds.begin(&mut spam)?;
//! spam.increment(b"lottery", 1, 0)?;
//! ds.commit(&mut spam)?;
//! ds.close(spam, true)?;
//! # Ok::<(), wordstore_core::StoreError>(())
//! ```

pub(crate) mod backend;
pub mod codec;
pub mod config;
pub mod datafile;
pub mod datastore;
pub mod env;
pub mod error;
pub mod format;
pub mod handle;
pub mod journal;
pub mod lockcell;
pub mod log;
pub mod platform;
pub mod record;
pub mod retry;
pub mod table;

// Re-export key types for convenience
pub use codec::Codec;
pub use config::{BackendKind, Config, PruneThresholds};
pub use datastore::Datastore;
pub use env::{recover_directory, EnvState, Environment, RecoveryKind, RecoveryReport};
pub use error::{StoreError, StoreResult};
pub use handle::{Handle, OpenMode, Visit};
pub use journal::Journal;
pub use lockcell::{check_zombies, ZombieCheck};
pub use record::{CounterRecord, MetaKey, SCHEMA_VERSION};
