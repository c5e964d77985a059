//! Platform-specific durability and locking primitives
//!
//! `durable_sync` maps to the strongest flush each platform offers.
//! `try_lock_range` takes POSIX byte-range advisory locks. On Linux these are
//! open-file-description locks, so two descriptors for the same file conflict
//! even inside one process and closing an unrelated descriptor never drops a
//! lock. Other Unix systems fall back to classic per-process `F_SETLK` locks.

use std::fs::File;
use std::io;
use std::path::Path;

use fs2::FileExt;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC), the only flush that reaches physical media
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// The caller must not hold locks that other processes wait on for long,
/// since the call may block for extended periods during heavy I/O.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fdatasync operates on a descriptor obtained from a live File.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: F_FULLFSYNC operates on a descriptor obtained from a live File.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: FlushFileBuffers on a handle obtained from a live File.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (renames, creations) of `dir`.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        // Directory handles cannot be flushed here; NTFS journals metadata.
        let _ = dir;
        Ok(())
    }
}

/// Byte-range lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLock {
    /// Read lock; compatible with other read locks
    Shared,
    /// Write lock; excludes every other lock on the range
    Exclusive,
    /// Release whatever this descriptor holds on the range
    Unlock,
}

/// Attempt a non-blocking byte-range lock on `[start, start + len)`.
///
/// Returns `Ok(true)` if the lock was granted, `Ok(false)` if a conflicting
/// lock is held elsewhere, and `Err` for real I/O errors.
#[cfg(unix)]
pub fn try_lock_range(file: &File, kind: RangeLock, start: u64, len: u64) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let l_type = match kind {
        RangeLock::Shared => libc::F_RDLCK as libc::c_int,
        RangeLock::Exclusive => libc::F_WRLCK as libc::c_int,
        RangeLock::Unlock => libc::F_UNLCK as libc::c_int,
    };

    // SAFETY: an all-zero flock is a valid value; OFD locks require l_pid == 0.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;

    #[cfg(target_os = "linux")]
    let cmd = libc::F_OFD_SETLK;
    #[cfg(not(target_os = "linux"))]
    let cmd = libc::F_SETLK;

    // SAFETY: fcntl receives a descriptor from a live File and a pointer to a
    // properly initialised flock that outlives the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl as *mut libc::flock) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
        _ => Err(err),
    }
}

/// Byte-range locks are only implemented for Unix targets.
#[cfg(not(unix))]
pub fn try_lock_range(_file: &File, _kind: RangeLock, _start: u64, _len: u64) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "byte-range locks require a Unix platform",
    ))
}

/// Attempt a non-blocking whole-file lock.
///
/// Returns `Ok(false)` when another descriptor holds a conflicting lock.
pub fn try_lock_file(file: &File, exclusive: bool) -> io::Result<bool> {
    let result = if exclusive {
        FileExt::try_lock_exclusive(file)
    } else {
        FileExt::try_lock_shared(file)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e)
            if e.kind() == fs2::lock_contended_error().kind()
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Whether `file` is still the file currently linked at `path`.
///
/// A rewrite renames a new file over the old one, so a descriptor opened
/// before the rename refers to an unlinked inode.
pub fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let held = file.metadata()?;
        let linked = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(held.dev() == linked.dev() && held.ino() == linked.ino())
    }

    #[cfg(not(unix))]
    {
        let _ = (file, path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"spam 12 20240101").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(sync_dir(dir.path()).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_range_locks_conflict_across_descriptors() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(16).unwrap();
        let a = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let b = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();

        assert!(try_lock_range(&a, RangeLock::Exclusive, 3, 1).unwrap());
        assert!(!try_lock_range(&b, RangeLock::Shared, 3, 1).unwrap());
        assert!(!try_lock_range(&b, RangeLock::Exclusive, 3, 1).unwrap());
        // neighbouring byte is unaffected
        assert!(try_lock_range(&b, RangeLock::Exclusive, 4, 1).unwrap());

        assert!(try_lock_range(&a, RangeLock::Unlock, 3, 1).unwrap());
        assert!(try_lock_range(&b, RangeLock::Shared, 3, 1).unwrap());
    }

    #[test]
    fn test_whole_file_locks_conflict() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let a = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        let b = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();

        assert!(try_lock_file(&a, false).unwrap());
        assert!(try_lock_file(&b, false).unwrap());
        assert!(!try_lock_file(&b, true).unwrap());
        FileExt::unlock(&a).unwrap();
        assert!(try_lock_file(&b, true).unwrap());
        assert!(!try_lock_file(&a, false).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_same_file_detects_rename() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("spam.db");
        std::fs::write(&path, b"old").unwrap();
        let held = File::open(&path).unwrap();
        assert!(same_file(&held, &path).unwrap());

        let replacement = dir.path().join("spam.db.compact");
        std::fs::write(&replacement, b"new").unwrap();
        std::fs::rename(&replacement, &path).unwrap();
        assert!(!same_file(&held, &path).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_released_when_descriptor_closes() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4).unwrap();
        {
            let a = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
            assert!(try_lock_range(&a, RangeLock::Exclusive, 0, 1).unwrap());
        }
        let b = OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap();
        assert!(try_lock_range(&b, RangeLock::Exclusive, 0, 1).unwrap());
    }
}
