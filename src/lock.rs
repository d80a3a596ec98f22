//! Exclusive lock file guarding a receiver's target directory.

use anyhow::{Context, Result};
use nix::fcntl::{flock, FlockArg};
use std::{
    fs::File,
    io::Write,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

/// An `flock`-held lock file, released when dropped.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Acquire an exclusive, non-blocking lock on `path`, writing the current PID into it.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("create lock file '{}'", path.display()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .with_context(|| format!("lock file '{}' is held by another process", path.display()))?;

        let mut file = file;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { path, file })
    }

    /// Path to the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::UnlockNonblock);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".target.dropbox.lock");
        let first = LockFile::acquire(path.clone()).unwrap();
        assert!(LockFile::acquire(path.clone()).is_err());
        drop(first);
        assert!(LockFile::acquire(path).is_ok());
    }
}
