use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, MetadataExt, OpenOptionsExt};

use nix::fcntl::{readlinkat, AtFlags, OFlag};
use nix::unistd::{fchownat, Gid, Uid};
use tracing::debug;

use crate::entry::Entry;
use crate::error::{InstallError, Result};
use crate::types::*;

/// Change the owner of the symlink at `path`, but only if it still points
/// to `expected_target`.
///
/// The link itself is opened (never followed) and both the target check and
/// the chown go through that descriptor, so a link swapped in after the open
/// is never touched.
pub fn secure_symlink_chown(path: &Path, expected_target: &Path, owner: u32, group: u32) -> Result<()> {
    let link = OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_PATH.bits() | OFlag::O_NOFOLLOW.bits())
        .open(path)
        .map_err(|e| InstallError::io(format!("Failed to open {}", path.display()), e))?;

    let target = readlinkat(&link, "")
        .map_err(|e| InstallError::os(format!("couldn't readlinkat {}", path.display()), e))?;
    // byte comparison: Path equality ignores trailing and doubled slashes
    if target.as_bytes() != expected_target.as_os_str().as_bytes() {
        return Err(InstallError::SymlinkMismatch {
            path: path.to_path_buf(),
            expected: expected_target.to_path_buf(),
        });
    }

    fchownat(
        &link,
        "",
        Some(Uid::from_raw(owner)),
        Some(Gid::from_raw(group)),
        AtFlags::AT_EMPTY_PATH,
    )
    .map_err(|e| {
        InstallError::os(
            format!("cannot change owner of '{}' to {}/{}", path.display(), owner, group),
            e,
        )
    })
}

/// Make `path` a symlink to `target` owned by `owner:group`.
///
/// Whatever occupies `path` is removed and the check starts over, until the
/// link is in place. An existing correct link is left alone. Ownership is
/// only managed outside user mode.
pub fn symlink_securely(target: &Path, path: &Path, owner: u32, group: u32, user_mode: bool) -> Result<()> {
    loop {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                symlink(target, path).map_err(|e| {
                    InstallError::io(format!("Cannot create symlink '{}'", path.display()), e)
                })?;
                if !user_mode {
                    secure_symlink_chown(path, target, owner, group)
                        .map_err(|e| e.during("Cannot chown symlink"))?;
                }
                return Ok(());
            }
            Err(e) => {
                return Err(InstallError::io(format!("Cannot stat '{}'", path.display()), e));
            }
        };

        if meta.file_type().is_symlink() {
            match fs::read_link(path) {
                // raced with a removal
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(InstallError::io(
                        format!("Cannot read symlink '{}'", path.display()),
                        e,
                    ));
                }
                Ok(current) => {
                    let owned = user_mode || (meta.uid() == owner && meta.gid() == group);
                    if current == target && owned {
                        return Ok(());
                    }
                }
            }
        }

        debug!(path = %path.display(), "replacing");
        if let Err(e) = remove_any(path) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(InstallError::io(format!("Cannot override {}", path.display()), e));
            }
        }
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    }
}

/// Point each entry's declared path at its file under `symlink_root`.
///
/// Entries without a path, or whose path already is that location, are
/// skipped.
pub fn symlink_entries(symlink_root: &Path, entries: &[Entry], user_mode: bool) -> Result<()> {
    for entry in entries {
        let Some(path) = entry.path.as_deref() else {
            continue;
        };
        let target = symlink_root.join(&entry.relative);
        if target == path {
            continue;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                InstallError::io(
                    format!("Cannot create parent directory of '{}'", path.display()),
                    e,
                )
            })?;
        }
        symlink_securely(&target, path, entry.owner, entry.group, user_mode)
            .map_err(|e| e.during("Failed to symlink secret"))?;
    }
    Ok(())
}

/// Atomically point `link` at `target`.
///
/// A missing `link` is created directly. Otherwise a new link is made in a
/// sibling temporary directory and renamed over `link`, so readers always
/// see either the old or the new target.
pub fn atomic_symlink(target: &Path, link: &Path) -> Result<()> {
    match symlink(target, link) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(InstallError::io(format!("Cannot create symlink '{}'", link.display()), e));
        }
    }

    let parent = link
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = format!(
        ".{}",
        link.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    // removed on drop, whether or not the rename happens
    let staging = tempfile::Builder::new()
        .prefix(&prefix)
        .tempdir_in(parent)
        .map_err(|e| InstallError::io(format!("Cannot create temporary directory in '{}'", parent.display()), e))?;

    let staged = staging.path().join("tmp.symlink");
    symlink(target, &staged)
        .map_err(|e| InstallError::io(format!("Cannot create symlink '{}'", staged.display()), e))?;
    fs::rename(&staged, link).map_err(|e| {
        InstallError::io(
            format!("Cannot rename '{}' to '{}'", staged.display(), link.display()),
            e,
        )
    })?;

    staging
        .close()
        .map_err(|e| InstallError::io("Cannot remove temporary directory", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use crate::error::ErrorKind;
    use crate::resolve::identity::current_ids;
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    #[test]
    fn test_secure_chown_accepts_matching_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "x").unwrap();
        symlink(&target, &link).unwrap();

        let (uid, gid) = current_ids();
        secure_symlink_chown(&link, &target, uid, gid).unwrap();
    }

    #[test]
    fn test_secure_chown_rejects_swapped_target() {
        let dir = TempDir::new().unwrap();
        let expected = dir.path().join("expected");
        let attacker = dir.path().join("attacker");
        let link = dir.path().join("link");
        fs::write(&expected, "x").unwrap();
        fs::write(&attacker, "y").unwrap();

        // the link was replaced between creation and chown
        symlink(&attacker, &link).unwrap();
        let before = fs::symlink_metadata(&link).unwrap();

        let (uid, gid) = current_ids();
        let err = secure_symlink_chown(&link, &expected, uid, gid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("does not point to"));

        let after = fs::symlink_metadata(&link).unwrap();
        assert_eq!((before.uid(), before.gid()), (after.uid(), after.gid()));
        assert_eq!(fs::read_link(&link).unwrap(), attacker);
    }

    #[test]
    fn test_secure_chown_rejects_prefix_of_target() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("link");
        symlink("/run/secrets.d/12", &link).unwrap();

        let (uid, gid) = current_ids();
        let err = secure_symlink_chown(&link, Path::new("/run/secrets.d/1"), uid, gid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_secure_chown_requires_exact_target_bytes() {
        let dir = TempDir::new().unwrap();
        let (uid, gid) = current_ids();

        for (i, target) in ["/run/secrets.d/1/", "/run//secrets.d/1", "/run/./secrets.d/1"].iter().enumerate() {
            let link = dir.path().join(format!("link{i}"));
            symlink(target, &link).unwrap();
            let err = secure_symlink_chown(&link, Path::new("/run/secrets.d/1"), uid, gid).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Integrity, "{target}");
        }
    }

    #[test]
    fn test_secure_chown_refuses_regular_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();

        let (uid, gid) = current_ids();
        assert!(secure_symlink_chown(&file, Path::new("/x"), uid, gid).is_err());
    }

    #[test]
    fn test_symlink_securely_replaces_occupants() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let path = dir.path().join("path");
        let (uid, gid) = current_ids();

        // a regular file
        fs::write(&path, "stale").unwrap();
        symlink_securely(&target, &path, uid, gid, false).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), target);

        // a directory
        fs::remove_file(&path).unwrap();
        fs::create_dir_all(path.join("nested")).unwrap();
        symlink_securely(&target, &path, uid, gid, true).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), target);

        // a link elsewhere
        let other = dir.path().join("other");
        fs::remove_file(&path).unwrap();
        symlink(&other, &path).unwrap();
        symlink_securely(&target, &path, uid, gid, false).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), target);

        // already correct
        symlink_securely(&target, &path, uid, gid, false).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), target);
    }

    #[test]
    fn test_symlink_entries_skips_in_place_and_pathless() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("secrets");
        let entry = |name: &str, path: Option<PathBuf>| Entry {
            kind: EntryKind::Secret,
            name: name.into(),
            relative: PathBuf::from(name),
            path,
            mode: 0o400,
            owner: 0,
            group: 0,
            value: Zeroizing::new(Vec::new()),
            restart_units: vec![],
            reload_units: vec![],
        };
        let elsewhere = dir.path().join("etc/app/token");
        let entries = vec![
            entry("none", None),
            entry("inplace", Some(root.join("inplace"))),
            entry("token", Some(elsewhere.clone())),
        ];

        symlink_entries(&root, &entries, true).unwrap();
        assert!(fs::symlink_metadata(root.join("inplace")).is_err());
        assert_eq!(fs::read_link(&elsewhere).unwrap(), root.join("token"));
    }

    #[test]
    fn test_atomic_symlink_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let link = dir.path().join("secrets");
        let first = dir.path().join("secrets.d/1");
        let second = dir.path().join("secrets.d/2");

        atomic_symlink(&first, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), first);

        atomic_symlink(&second, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), second);

        // no staging directories left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".secrets"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
