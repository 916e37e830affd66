//! Process-wide advisory lock guaranteeing only one orchestrator instance runs at a
//! time on a given host, grounded in the `try_lock_exclusive` pattern used by
//! Bottlerocket's update dispatcher.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::lock::LockError;

/// Held for the whole run (acquire at `Start`, release at `End` on every path,
/// including an early return or panic unwind, since `Drop` calls `unlock`).
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// A second instance calling this while the first holds the lock gets
    /// `LockError::AlreadyHeld` immediately; it never blocks.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::AlreadyHeld {
                path: path.to_path_buf(),
            })?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
