use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sys::statfs::{statfs, FsType, TMPFS_MAGIC};
use tracing::{info, warn};

use super::{chown_path, RESTRICTED_DIR_MODE};
use crate::error::{InstallError, Result};
use crate::types::*;

const BASE_OPTIONS: &str = "mode=0751";

// not exported by nix
const RAMFS_MAGIC: FsType = FsType(0x8584_58f6u32 as _);

/// Backing filesystem for the secrets mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Ramfs,
    Tmpfs,
}

impl Backend {
    fn fstype(self) -> &'static str {
        match self {
            Backend::Ramfs => "ramfs",
            Backend::Tmpfs => "tmpfs",
        }
    }

    fn magic(self) -> FsType {
        match self {
            Backend::Ramfs => RAMFS_MAGIC,
            Backend::Tmpfs => TMPFS_MAGIC,
        }
    }

    fn options(self) -> String {
        match self {
            Backend::Ramfs => BASE_OPTIONS.to_string(),
            Backend::Tmpfs => format!("{},noswap", BASE_OPTIONS),
        }
    }
}

/// Make `mount_point` a memory-backed filesystem owned by `root:<keys_gid>`.
///
/// In user mode only the directory is created. Remounting is skipped when
/// the directory already is a mount of the expected type.
pub fn mount_secrets_fs(mount_point: &Path, keys_gid: u32, use_tmpfs: bool, user_mode: bool) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(RESTRICTED_DIR_MODE)
        .create(mount_point)
        .map_err(|e| {
            InstallError::io(format!("cannot create directory '{}'", mount_point.display()), e)
        })?;

    if user_mode {
        return Ok(());
    }

    let backend = if use_tmpfs { Backend::Tmpfs } else { Backend::Ramfs };

    let stat = statfs(mount_point).map_err(|e| {
        InstallError::os(format!("cannot get statfs for directory '{}'", mount_point.display()), e)
    })?;
    let mounted = is_mount_point(mount_point)?;

    if !mounted || stat.filesystem_type() != backend.magic() {
        mount_backend(mount_point, backend)?;
        info!(mount_point = %mount_point.display(), fstype = backend.fstype(), "mounted secrets filesystem");
    }

    chown_path(mount_point, 0, keys_gid)
}

fn mount_backend(mount_point: &Path, backend: Backend) -> Result<()> {
    let flags = MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;
    let options = backend.options();

    match mount(Some("none"), mount_point, Some(backend.fstype()), flags, Some(options.as_str())) {
        Ok(()) => Ok(()),
        // kernels before 6.4 reject noswap
        Err(Errno::EINVAL) if backend == Backend::Tmpfs => {
            warn!("tmpfs does not support noswap, mounting without it");
            mount(Some("none"), mount_point, Some(backend.fstype()), flags, Some(BASE_OPTIONS))
                .map_err(|e| InstallError::os("cannot mount (fallback without noswap failed)", e))
        }
        Err(e) => Err(InstallError::os("cannot mount", e)),
    }
}

/// A directory is a mount point when it sits on a different device than
/// its parent.
fn is_mount_point(path: &Path) -> Result<bool> {
    let meta = fs::metadata(path)
        .map_err(|e| InstallError::io(format!("cannot stat '{}'", path.display()), e))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(true),
    };
    let parent_meta = fs::metadata(parent)
        .map_err(|e| InstallError::io(format!("cannot stat '{}'", parent.display()), e))?;
    Ok(meta.dev() != parent_meta.dev())
}
