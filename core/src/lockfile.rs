//! Cross-process sandbox lock.
//!
//! Slot allocation and metadata commits race between concurrent creations in
//! the same or different processes, so both happen under an exclusive
//! advisory lock on `sandboxes_dir/.lock`. The guard releases on every exit
//! path, including panic and cancellation, because release is tied to drop.

use std::fs::File;
use std::fs::OpenOptions;

use fd_lock::RwLock;
use fd_lock::RwLockWriteGuard;

use crate::error::Result;
use crate::paths::Paths;

pub struct SandboxLock {
    lock: RwLock<File>,
}

impl SandboxLock {
    /// Open (creating if necessary) the lock file. Does not take the lock.
    pub fn open(paths: &Paths) -> Result<Self> {
        std::fs::create_dir_all(&paths.sandboxes_dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(paths.lock_path())?;
        Ok(Self {
            lock: RwLock::new(file),
        })
    }

    /// Block until the exclusive lock is held.
    pub fn acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        Ok(self.lock.write()?)
    }
}
