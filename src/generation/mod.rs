//! Numbered generation directories under the secrets mount point.

use std::fs;
use std::io;

use tracing::{debug, info, warn};

use crate::error::{InstallError, Result};
use crate::fs::create_restricted_dir;
use crate::types::*;

/// The generation the public symlink currently points at, or 0 when there is
/// none (or it points outside the mount point).
pub fn current_generation(mount_point: &Path, symlink_path: &Path) -> Result<u64> {
    let target = match fs::read_link(symlink_path) {
        Ok(target) => target,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(InstallError::io(format!("Cannot access {}", symlink_path.display()), e));
        }
    };

    if target.parent() != Some(mount_point) {
        debug!(target = %target.display(), "public symlink points outside the mount point");
        return Ok(0);
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.parse::<u64>()
        .map_err(|_| InstallError::CorruptGeneration { name, target })
}

/// Create the directory for the next generation and return its path.
///
/// A leftover directory with the same number (from a run that failed before
/// publishing) is removed first.
pub fn prepare_next_generation(
    mount_point: &Path,
    symlink_path: &Path,
    keys_gid: u32,
    user_mode: bool,
) -> Result<PathBuf> {
    let generation = current_generation(mount_point, symlink_path)? + 1;
    let dir = mount_point.join(generation.to_string());

    match fs::symlink_metadata(&dir) {
        Ok(meta) => {
            warn!(dir = %dir.display(), "removing stale generation directory");
            let removed = if meta.is_dir() {
                fs::remove_dir_all(&dir)
            } else {
                fs::remove_file(&dir)
            };
            removed.map_err(|e| InstallError::io(format!("Cannot remove existing {}", dir.display()), e))?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(InstallError::io(format!("Cannot access {}", dir.display()), e)),
    }

    create_restricted_dir(&dir, keys_gid, user_mode)?;
    info!(generation, dir = %dir.display(), "prepared generation");
    Ok(dir)
}

/// Remove generations older than `keep` behind `current_dir`. `keep == 0`
/// keeps everything. The current generation is never removed.
///
/// Failing to list the mount point is an error; failing to remove a single
/// old generation is only logged.
pub fn prune_generations(mount_point: &Path, current_dir: &Path, keep: u64) -> Result<()> {
    if keep == 0 {
        return Ok(());
    }

    let current_name = current_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let current = current_name
        .parse::<u64>()
        .map_err(|_| InstallError::CorruptGeneration {
            name: current_name,
            target: current_dir.to_path_buf(),
        })?;

    let entries = fs::read_dir(mount_point)
        .map_err(|e| InstallError::io(format!("Cannot open {}", mount_point.display()), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| InstallError::io(format!("Cannot read {}", mount_point.display()), e))?;
        let Some(generation) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if generation == current || generation.saturating_add(keep) > current {
            continue;
        }

        let path = entry.path();
        debug!(generation, "pruning");
        if let Err(e) = fs::remove_dir_all(&path) {
            warn!(dir = %path.display(), error = %e, "cannot prune old generation");
        }
    }
    Ok(())
}
