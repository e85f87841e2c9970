//! Advisory lock serializing engines across processes.
//!
//! Read-only engines share the lock, a read-write engine holds it alone and
//! writes its pid into the file so a refused engine can name the holder.
//! The lock is taken without blocking and released when dropped.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, StorageError};

/// How the engine holds the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held `flock(2)` on the engine lock file.
pub struct EngineLock {
    file: Flock<File>,
    path: PathBuf,
    mode: LockMode,
}

impl EngineLock {
    /// Take the lock at `path` in `mode`; fails with `Locked` when it is held.
    pub fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };
        let mut file = match Flock::lock(file, arg) {
            Ok(locked) => locked,
            Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                let who = if holder.is_empty() {
                    "another reader".to_string()
                } else {
                    format!("pid {}", holder)
                };
                return Err(StorageError::Locked(format!("{} is held by {}", path.display(), who)));
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        if mode == LockMode::Exclusive {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()?;
        }
        debug!(path = %path.display(), ?mode, "Engine lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for EngineLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLock")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        if self.mode == LockMode::Exclusive {
            let _ = self.file.set_len(0);
        }
        debug!(path = %self.path.display(), "Engine lock released");
    }
}
