//! Bounded, jittered retry for contended locks.
//!
//! Every lock this crate takes without blocking goes through [`Backoff`]:
//! sleep a randomized, exponentially growing pause between attempts and give
//! up with [`StoreError::LockContention`] once the attempt budget is spent.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::platform::try_lock_file;

/// First pause between attempts.
const INITIAL_DELAY: Duration = Duration::from_micros(50);

/// Largest pause between attempts.
const MAX_DELAY: Duration = Duration::from_millis(5);

/// Growth factor applied after each failed attempt.
const MULTIPLIER: f64 = 2.0;

/// Fraction of randomness applied to each pause.
const JITTER: f64 = 0.5;

/// Exponential backoff state for one lock acquisition.
#[derive(Debug)]
pub struct Backoff {
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Backoff {
    /// New backoff allowing `max_attempts` tries (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts: max_attempts.max(1),
            delay: INITIAL_DELAY,
        }
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt and sleep; returns false once the budget is spent.
    pub fn wait(&mut self) -> bool {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return false;
        }
        std::thread::sleep(apply_jitter(self.delay));
        let next = (self.delay.as_nanos() as f64 * MULTIPLIER) as u64;
        self.delay = Duration::from_nanos(next).min(MAX_DELAY);
        true
    }
}

fn apply_jitter(dur: Duration) -> Duration {
    let base = dur.as_nanos() as f64;
    let nanos = rand::thread_rng().gen_range(base * (1.0 - JITTER)..=base * (1.0 + JITTER));
    Duration::from_nanos(nanos as u64)
}

/// Run `attempt` until it reports success, retrying with backoff.
///
/// `attempt` returns `Ok(Some(v))` on success, `Ok(None)` when the lock is
/// held elsewhere, and `Err` for failures that must not be retried.
pub fn with_backoff<T, F>(resource: &Path, max_attempts: u32, mut attempt: F) -> StoreResult<T>
where
    F: FnMut() -> StoreResult<Option<T>>,
{
    let mut backoff = Backoff::new(max_attempts);
    loop {
        if let Some(v) = attempt()? {
            return Ok(v);
        }
        if !backoff.wait() {
            debug!(
                path = %resource.display(),
                attempts = backoff.attempts(),
                "Giving up on contended lock"
            );
            return Err(StoreError::LockContention {
                resource: resource.to_path_buf(),
                attempts: backoff.attempts(),
            });
        }
    }
}

/// Take a whole-file lock on `file`, retrying while it is contended.
pub fn lock_file_with_backoff(
    file: &File,
    path: &Path,
    exclusive: bool,
    max_attempts: u32,
) -> StoreResult<()> {
    with_backoff(path, max_attempts, || {
        try_lock_file(file, exclusive)
            .map(|held| held.then_some(()))
            .map_err(|e| StoreError::io(path, e, "Failed to lock file"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_succeeds_after_retries() {
        let mut calls = 0;
        let v = with_backoff(Path::new("/x"), 10, || {
            calls += 1;
            Ok(if calls == 3 { Some(42) } else { None })
        })
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_with_contention() {
        let err = with_backoff::<(), _>(Path::new("/x/spam.db"), 4, || Ok(None)).unwrap_err();
        match err {
            StoreError::LockContention { resource, attempts } => {
                assert_eq!(resource, PathBuf::from("/x/spam.db"));
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hard_errors_not_retried() {
        let mut calls = 0;
        let err = with_backoff::<(), _>(Path::new("/x"), 100, || {
            calls += 1;
            Err(StoreError::InvalidConfig("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut b = Backoff::new(64);
        for _ in 0..20 {
            b.wait();
        }
        assert!(b.delay <= MAX_DELAY);
    }
}
