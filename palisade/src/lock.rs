//! Single-instance lock.
//!
//! One lock holder per machine; a second instance prints where the running
//! UI can be reached and exits with a status supervisors can tell apart
//! from a crash.

use thiserror::Error;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{Flock, FlockArg};

pub const LOCK_PATH: &str = "/var/run/palisade_api.lock";

/// 30 s of 500 ms probes.
const LOCK_ATTEMPTS: u32 = 60;
const LOCK_PROBE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum Error {
    #[error("another instance holds the lock at `{0}`")]
    Held(PathBuf),
    #[error("IO error on lock file `{path}`: {error}")]
    IO { path: PathBuf, error: std::io::Error },
}

/// Held for the process lifetime; dropping releases the lock.
pub struct InstanceLock {
    _flock: Flock<std::fs::File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire with retry. `O_CLOEXEC` keeps the fd out of the API child.
    pub async fn acquire(path: &Path) -> Result<Self, Error> {
        for attempt in 0..LOCK_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .custom_flags(libc::O_CLOEXEC)
                .open(path)
                .map_err(|error| Error::IO {
                    path: path.to_path_buf(),
                    error,
                })?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    if attempt > 0 {
                        tracing::info!(path = %path.display(), attempt, "instance lock acquired after retry");
                    }
                    return Ok(InstanceLock {
                        _flock: flock,
                        path: path.to_path_buf(),
                    });
                }
                Err((_file, _errno)) => {
                    tokio::time::sleep(LOCK_PROBE).await;
                }
            }
        }
        Err(Error::Held(path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_fails_while_first_lives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let first = InstanceLock::acquire(&path).await.unwrap();

        // single fast probe: lower the retry budget by checking directly
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert!(Flock::lock(file, FlockArg::LockExclusiveNonblock).is_err());

        drop(first);
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(Flock::lock(file, FlockArg::LockExclusiveNonblock).is_ok());
    }
}
