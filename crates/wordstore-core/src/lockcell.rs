//! Crash detection through a slotted process table.
//!
//! `<dir>/process-table` holds one byte per cell, `0` for Free and `1` for
//! InUse. A writer claims a cell by taking a non-blocking write lock on that
//! byte, re-reading it, and marking it InUse while the lock is held. The
//! operating system drops the lock when the process dies, so an InUse cell
//! whose lock can be taken by someone else belongs to a process that crashed
//! without cleaning up: a zombie.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::platform::{durable_sync, try_lock_range, RangeLock};

/// Lock-cell file name
pub const PROCESS_TABLE_FILE: &str = "process-table";

const FREE: u8 = 0;
const IN_USE: u8 = 1;

/// Index of a cell in the process table.
pub type CellId = usize;

/// Result of a zombie scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZombieCheck {
    /// Every InUse cell is held by a live process
    Clean,
    /// InUse cells nobody holds
    Zombies(Vec<CellId>),
    /// The directory has no process table yet
    NoLockFile,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLock {
    /// The cell is ours until `clear_lock`
    Claimed(CellId),
    /// The cell was InUse under our lock; its owner died
    ZombieFound(CellId),
}

/// Open process table for one store directory.
#[derive(Debug)]
pub struct LockCellTable {
    file: File,
    path: PathBuf,
    cells: usize,
    claimed: Option<CellId>,
}

impl LockCellTable {
    /// Open the table, creating it with `cells` Free cells if absent.
    ///
    /// The cell count of an existing table is whatever it was created with.
    pub fn open_or_create(dir: &Path, cells: usize) -> StoreResult<Self> {
        let path = dir.join(PROCESS_TABLE_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e, "Failed to open process table"))?;
        let mut len = file
            .metadata()
            .map_err(|e| StoreError::io(&path, e, "Failed to stat process table"))?
            .len();
        if len == 0 {
            // zero-filled extension is all Free cells
            file.set_len(cells as u64)
                .map_err(|e| StoreError::io(&path, e, "Failed to size process table"))?;
            durable_sync(&file)
                .map_err(|e| StoreError::io(&path, e, "Failed to sync process table"))?;
            len = cells as u64;
            debug!(path = %path.display(), cells, "Created process table");
        }
        Ok(Self {
            file,
            path,
            cells: len as usize,
            claimed: None,
        })
    }

    /// Open an existing table, if any.
    pub fn open_existing(dir: &Path) -> StoreResult<Option<Self>> {
        let path = dir.join(PROCESS_TABLE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Self::open_or_create(dir, 0).map(Some)
    }

    /// Number of cells.
    pub fn cells(&self) -> usize {
        self.cells
    }

    /// Cell claimed by this table, if any.
    pub fn claimed(&self) -> Option<CellId> {
        self.claimed
    }

    fn read_cell(&self, cell: CellId) -> StoreResult<u8> {
        let mut byte = [0u8; 1];
        let mut f = &self.file;
        f.seek(SeekFrom::Start(cell as u64))
            .and_then(|_| f.read_exact(&mut byte))
            .map_err(|e| StoreError::io(&self.path, e, "Failed to read process table cell"))?;
        Ok(byte[0])
    }

    fn write_cell(&self, cell: CellId, value: u8) -> StoreResult<()> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(cell as u64))
            .and_then(|_| f.write_all(&[value]))
            .and_then(|_| durable_sync(&self.file))
            .map_err(|e| StoreError::io(&self.path, e, "Failed to write process table cell"))
    }

    fn lock(&self, cell: CellId, kind: RangeLock) -> StoreResult<bool> {
        try_lock_range(&self.file, kind, cell as u64, 1)
            .map_err(|e| StoreError::io(&self.path, e, "Failed to lock process table cell"))
    }

    /// Scan every cell for InUse entries whose owner is gone.
    ///
    /// Our own claimed cell is never reported.
    pub fn check_zombies(&self) -> StoreResult<ZombieCheck> {
        let mut zombies = Vec::new();
        for cell in 0..self.cells {
            if Some(cell) == self.claimed || self.read_cell(cell)? != IN_USE {
                continue;
            }
            // a shared probe only succeeds when no live writer holds the cell
            if self.lock(cell, RangeLock::Shared)? {
                self.lock(cell, RangeLock::Unlock)?;
                zombies.push(cell);
            }
        }
        if zombies.is_empty() {
            Ok(ZombieCheck::Clean)
        } else {
            warn!(
                path = %self.path.display(),
                count = zombies.len(),
                "Found abandoned process table cells"
            );
            Ok(ZombieCheck::Zombies(zombies))
        }
    }

    /// Number of InUse cells held by live processes other than us.
    pub fn live_writers(&self) -> StoreResult<usize> {
        let mut live = 0;
        for cell in 0..self.cells {
            if Some(cell) == self.claimed || self.read_cell(cell)? != IN_USE {
                continue;
            }
            if self.lock(cell, RangeLock::Shared)? {
                self.lock(cell, RangeLock::Unlock)?;
            } else {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Claim a Free cell. Never blocks.
    pub fn set_lock(&mut self) -> StoreResult<SetLock> {
        if let Some(cell) = self.claimed {
            return Ok(SetLock::Claimed(cell));
        }
        for cell in 0..self.cells {
            if self.read_cell(cell)? != FREE || !self.lock(cell, RangeLock::Exclusive)? {
                continue;
            }
            if self.read_cell(cell)? != FREE {
                self.lock(cell, RangeLock::Unlock)?;
                return Ok(SetLock::ZombieFound(cell));
            }
            if let Err(e) = self.write_cell(cell, IN_USE) {
                let _ = self.lock(cell, RangeLock::Unlock);
                return Err(e);
            }
            self.claimed = Some(cell);
            debug!(path = %self.path.display(), cell, "Claimed process table cell");
            return Ok(SetLock::Claimed(cell));
        }
        Err(StoreError::LockTableFull {
            path: self.path.clone(),
            cells: self.cells,
        })
    }

    /// Release our cell: mark it Free, flush, then unlock.
    pub fn clear_lock(&mut self) -> StoreResult<()> {
        let Some(cell) = self.claimed.take() else {
            return Ok(());
        };
        self.write_cell(cell, FREE)?;
        self.lock(cell, RangeLock::Unlock)?;
        debug!(path = %self.path.display(), cell, "Released process table cell");
        Ok(())
    }

    /// Reset a dead process's cell. Returns false if the cell turned out to be
    /// held by a live process after all.
    pub fn clear_zombie(&self, cell: CellId) -> StoreResult<bool> {
        if !self.lock(cell, RangeLock::Exclusive)? {
            return Ok(false);
        }
        let result = self.write_cell(cell, FREE);
        self.lock(cell, RangeLock::Unlock)?;
        result?;
        info!(path = %self.path.display(), cell, "Cleared abandoned process table cell");
        Ok(true)
    }
}

/// Scan `dir`'s process table without creating one.
pub fn check_zombies(dir: &Path) -> StoreResult<ZombieCheck> {
    match LockCellTable::open_existing(dir)? {
        Some(table) => table.check_zombies(),
        None => Ok(ZombieCheck::NoLockFile),
    }
}
