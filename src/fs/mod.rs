//! Filesystem primitives for the secrets store.

pub mod mount;
pub mod symlink;

use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{fchown, DirBuilderExt, OpenOptionsExt, PermissionsExt};

use tracing::debug;

use crate::entry::{self, Entry};
use crate::error::{InstallError, Result};
use crate::types::*;

pub use mount::mount_secrets_fs;
pub use symlink::{atomic_symlink, secure_symlink_chown, symlink_entries, symlink_securely};

/// Mode of the mount point, generation directories and their subdirectories.
pub const RESTRICTED_DIR_MODE: u32 = 0o751;

pub(crate) fn chown_path(path: &Path, owner: u32, group: u32) -> Result<()> {
    std::os::unix::fs::chown(path, Some(owner), Some(group)).map_err(|e| {
        InstallError::io(
            format!("cannot change owner/group of '{}' to {}/{}", path.display(), owner, group),
            e,
        )
    })
}

/// Create `path` (not its parents) with the restricted directory mode,
/// tolerating an existing directory. Outside user mode it is given to
/// `root:<keys_gid>`.
pub(crate) fn create_restricted_dir(path: &Path, keys_gid: u32, user_mode: bool) -> Result<()> {
    match DirBuilder::new().mode(RESTRICTED_DIR_MODE).create(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
        Err(e) => {
            return Err(InstallError::io(format!("Cannot create directory '{}'", path.display()), e));
        }
    }
    if !user_mode {
        chown_path(path, 0, keys_gid)?;
    }
    Ok(())
}

/// Write every entry into `generation_dir`, creating intermediate
/// directories as needed.
pub fn write_entries(generation_dir: &Path, entries: &[Entry], keys_gid: u32, user_mode: bool) -> Result<()> {
    for entry in entries {
        entry::check_name(&entry.name)?;
        let file_path = generation_dir.join(&entry.relative);

        let mut dir = generation_dir.to_path_buf();
        if let Some(parents) = entry.relative.parent() {
            for component in parents.components() {
                dir.push(component);
                create_restricted_dir(&dir, keys_gid, user_mode)
                    .map_err(|e| e.during("Cannot create directory for secret"))?;
            }
        }

        write_secret_file(&file_path, &entry.value, entry.mode, entry.owner, entry.group, user_mode)?;
        debug!(file = %file_path.display(), mode = format_args!("{:04o}", entry.mode), "wrote");
    }
    Ok(())
}

/// Create a fresh file holding `value`. The file is owner-only until the
/// final mode is applied, and it is chowned through the open handle.
fn write_secret_file(path: &Path, value: &[u8], mode: u32, owner: u32, group: u32, user_mode: bool) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| InstallError::io(format!("Cannot write {}", path.display()), e))?;

    file.write_all(value)
        .map_err(|e| InstallError::io(format!("Cannot write {}", path.display()), e))?;

    if !user_mode {
        fchown(&file, Some(owner), Some(group)).map_err(|e| {
            InstallError::io(
                format!("Cannot change owner/group of '{}' to {}/{}", path.display(), owner, group),
                e,
            )
        })?;
    }

    // set explicitly so the umask does not apply
    file.set_permissions(Permissions::from_mode(mode))
        .map_err(|e| InstallError::io(format!("Cannot set mode of {}", path.display()), e))?;
    file.sync_all()
        .map_err(|e| InstallError::io(format!("Cannot write {}", path.display()), e))
}

/// Read a published file, treating a missing one as absent.
pub(crate) fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(InstallError::io(format!("Cannot read {}", path.display()), e)),
    }
}
