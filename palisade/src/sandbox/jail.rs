//! Chroot jail entry and privilege drop for the API child.

use std::fs;
use std::path::Path;

use nix::unistd::{chdir, chroot, setgid, setgroups, setuid, Gid, Uid, User};

use super::Error;

/// Resolved before the chroot cuts us off from the passwd database.
pub struct DropTarget {
    pub uid: Uid,
    pub gid: Gid,
}

pub fn resolve_user(name: &str) -> Result<DropTarget, Error> {
    let user = User::from_name(name)
        .map_err(|e| Error::step("user-lookup", e))?
        .ok_or_else(|| Error::step("user-lookup", format!("user `{name}` not found")))?;
    Ok(DropTarget {
        uid: user.uid,
        gid: user.gid,
    })
}

/// Enter the jail: chroot, then drop groups, gid and uid in that order so
/// no step can be skipped if a later one fails.
pub fn enter(jail: &Path, target: &DropTarget) -> Result<(), Error> {
    fs::create_dir_all(jail).map_err(|e| Error::step("jail-create", e))?;

    chroot(jail).map_err(|e| Error::step("chroot", e))?;
    chdir("/").map_err(|e| Error::step("chdir", e))?;

    setgroups(&[target.gid]).map_err(|e| Error::step("setgroups", e))?;
    setgid(target.gid).map_err(|e| Error::step("setgid", e))?;
    setuid(target.uid).map_err(|e| Error::step("setuid", e))?;

    // dropping back must now be impossible
    if setuid(Uid::from_raw(0)).is_ok() {
        return Err(Error::step("privilege-drop", "uid 0 still reachable after drop"));
    }
    Ok(())
}
