//! Configuration management for wordstore
//!
//! Provides presets for the two backend strategies and the knobs that are
//! fixed for the lifetime of a [`Datastore`](crate::Datastore).

/// Which backend strategy a datastore uses. Chosen once, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Single writer per list, whole-file advisory lock, no transactions.
    Traditional,
    /// Shared environment with a write-ahead log, transactions and recovery.
    Transactional,
}

/// Thresholds used by maintenance pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneThresholds {
    /// Records whose relevant count is below this are pruned (0 disables)
    pub min_count: u32,
    /// Records last seen before this YYYYMMDD date are pruned (0 disables)
    pub min_date: u32,
    /// Tokens longer than this are pruned (0 disables)
    pub max_token_len: usize,
}

/// wordstore configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend strategy
    pub backend: BackendKind,
    /// Read-buffer budget for data-file and log scans (MB)
    pub cache_size_mb: u32,
    /// Record a last-seen date with every counter update
    pub timestamps: bool,
    /// Maximum token size in bytes
    pub max_token_len: usize,
    /// Number of cells in a newly created process table
    pub max_writers: usize,
    /// Log segment rotation threshold (bytes)
    pub log_segment_bytes: u64,
    /// Checkpoint after this many KB of log written (0 disables)
    pub checkpoint_log_kb: u64,
    /// Checkpoint when the last one is older than this many minutes (0 disables)
    pub checkpoint_age_min: u64,
    /// Attempts made on a contended lock before giving up
    pub lock_retries: u32,
    /// Maintenance pruning thresholds
    pub prune: PruneThresholds,
}

impl Config {
    /// Transactional store: logged, recoverable, many writers.
    pub fn transactional() -> Self {
        Self {
            backend: BackendKind::Transactional,
            cache_size_mb: 4,
            timestamps: true,
            max_token_len: 30,
            max_writers: 1024,
            log_segment_bytes: 4 * 1024 * 1024,
            checkpoint_log_kb: 1024,
            checkpoint_age_min: 10,
            lock_retries: 1000,
            prune: PruneThresholds::default(),
        }
    }

    /// Traditional store: one writer at a time, fast, not crash-safe.
    pub fn traditional() -> Self {
        Self {
            backend: BackendKind::Traditional,
            ..Self::transactional()
        }
    }

    /// Scan buffer size derived from `cache_size_mb`, clamped to [64KB, 64MB].
    pub fn scan_buffer_bytes(&self) -> usize {
        let bytes = (self.cache_size_mb as usize).saturating_mul(1024 * 1024);
        bytes.clamp(64 * 1024, 64 * 1024 * 1024)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_token_len == 0 || self.max_token_len > u16::MAX as usize {
            return Err("max_token_len must be in [1, 65535]".into());
        }
        if self.max_writers == 0 || self.max_writers > 65536 {
            return Err("max_writers must be in [1, 65536]".into());
        }
        if self.log_segment_bytes < 64 * 1024 {
            return Err("log_segment_bytes must be >= 64KB".into());
        }
        if self.lock_retries == 0 {
            return Err("lock_retries must be > 0".into());
        }
        if self.prune.min_date != 0 && !crate::record::is_valid_date(self.prune.min_date) {
            return Err("prune.min_date must be a YYYYMMDD date or 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::transactional()
    }
}
