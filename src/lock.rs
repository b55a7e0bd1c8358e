//! Advisory file locks
//!
//! Every jail has a lock file in the run directory. Holding it makes a
//! lifecycle operation the only one in flight for that jail, whether the
//! competitor is another thread or another process. The host-wide
//! allocators (devfs rulesets, NAT blocks) take their own lock around the
//! pick-and-publish step.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// An exclusive `flock(2)` held until dropped
#[derive(Debug)]
pub struct FileLock {
    _lock: Flock<File>,
    path: PathBuf,
}

fn open(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}

impl FileLock {
    /// Take a jail's lock without waiting
    ///
    /// Fails with `Busy` when another operation on the same jail holds it.
    pub fn try_jail(path: &Path, jail: &str) -> Result<Self> {
        match Flock::lock(open(path)?, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::trace!(jail, path = %path.display(), "jail lock taken");
                Ok(Self {
                    _lock: lock,
                    path: path.to_path_buf(),
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(Error::Busy {
                jail: jail.to_string(),
            }),
            Err((_, errno)) => Err(Error::Io(errno.into())),
        }
    }

    /// Block until a host-wide lock is ours
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock = Flock::lock(open(path)?, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(errno.into()))?;
        tracing::trace!(path = %path.display(), "host lock taken");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
