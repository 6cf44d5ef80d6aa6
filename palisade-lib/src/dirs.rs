use thiserror::Error;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/palisade";
pub const ENV_VAR_STATE_DIR: &str = "PALISADE_STATE_DIR";

pub const ROLLBACK_CHECKPOINT: &str = "/tmp/firewall_rollback.nft";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// On-disk layout under the state directory.
///
/// `certs/` is keyed material (0700), `auth.json` holds credentials (0600),
/// `api_state.db` is the embedded store, `iplists/` is the download cache.
#[derive(Clone, Debug)]
pub struct StateDirs {
    root: PathBuf,
}

impl StateDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StateDirs { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var(ENV_VAR_STATE_DIR).unwrap_or_else(|_| DEFAULT_STATE_DIR.to_string());
        StateDirs::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.root.join("auth.json")
    }

    pub fn store_db(&self) -> PathBuf {
        self.root.join("api_state.db")
    }

    pub fn iplists_dir(&self) -> PathBuf {
        self.root.join("iplists")
    }

    /// Create the directory tree with its permission contract.
    pub fn ensure(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.root)?;
        create_dir_with_mode(&self.certs_dir(), 0o700)?;
        fs::create_dir_all(self.iplists_dir())?;
        if self.auth_file().exists() {
            fs::set_permissions(self.auth_file(), fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<(), Error> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = StateDirs::new(tmp.path().join("state"));
        dirs.ensure().unwrap();

        let meta = fs::metadata(dirs.certs_dir()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        assert!(dirs.iplists_dir().is_dir());
    }
}
