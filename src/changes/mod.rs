//! Change detection against the published generation.
//!
//! Entries that are new or whose bytes differ queue their restart/reload
//! units in the list files the activation script consumes.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::Activation;
use crate::entry::Entry;
use crate::error::{InstallError, Result};
use crate::fs::read_if_exists;
use crate::types::*;

/// What an install changes relative to the published generation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    /// Only filled when removals were asked for.
    pub removed: BTreeSet<String>,
    pub restart: Vec<String>,
    pub reload: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// One human readable line per non-empty category.
    pub fn summary(&self, activation: Activation) -> Vec<String> {
        let categories = [
            (&self.added, "adding", "would add"),
            (&self.modified, "modifying", "would modify"),
            (&self.removed, "removing", "would remove"),
        ];
        categories
            .into_iter()
            .filter(|(names, _, _)| !names.is_empty())
            .map(|(names, verb, dry_verb)| {
                let verb = if activation.is_dry() { dry_verb } else { verb };
                let plural = if names.len() == 1 { "" } else { "s" };
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                format!("{} secret{}: {}", verb, plural, names.join(", "))
            })
            .collect()
    }
}

/// Compare the freshly written `generation_dir` with what `symlink_path`
/// currently publishes.
///
/// Returns `None` when nothing is published yet.
pub fn detect_changes(
    symlink_path: &Path,
    generation_dir: &Path,
    entries: &[Entry],
    find_removed: bool,
) -> Result<Option<ChangeSet>> {
    if !symlink_path.exists() {
        debug!(path = %symlink_path.display(), "nothing published yet");
        return Ok(None);
    }

    let mut changes = ChangeSet::default();
    for entry in entries {
        let name = entry.relative.to_string_lossy().into_owned();
        let old = read_if_exists(&symlink_path.join(&entry.relative))?;
        let new_path = generation_dir.join(&entry.relative);

        let changed = match old {
            None => {
                changes.added.insert(name);
                true
            }
            Some(old) => {
                let new = std::fs::read(&new_path)
                    .map_err(|e| InstallError::io(format!("Cannot read {}", new_path.display()), e))?;
                if old != new {
                    changes.modified.insert(name);
                    true
                } else {
                    false
                }
            }
        };

        if changed {
            changes.restart.extend(entry.restart_units.iter().cloned());
            changes.reload.extend(entry.reload_units.iter().cloned());
        }
    }

    if find_removed {
        changes.removed = removed_entries(symlink_path, entries)?;
    }
    Ok(Some(changes))
}

/// Files reachable under `symlink_path`, following nested symlinks, that no
/// entry accounts for any more.
fn removed_entries(symlink_path: &Path, entries: &[Entry]) -> Result<BTreeSet<String>> {
    let current: BTreeSet<&Path> = entries.iter().map(|e| e.relative.as_path()).collect();
    let mut removed = BTreeSet::new();

    for item in WalkDir::new(symlink_path).follow_links(true) {
        let item = item.map_err(|e| {
            InstallError::io(format!("Cannot walk {}", symlink_path.display()), io::Error::from(e))
        })?;
        if item.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = item.path().strip_prefix(symlink_path) else {
            continue;
        };
        if !current.contains(relative) {
            removed.insert(relative.to_string_lossy().into_owned());
        }
    }
    Ok(removed)
}

fn list_file(activation_dir: &Path, activation: Activation, kind: &str) -> PathBuf {
    let prefix = if activation.is_dry() {
        "dry-activation"
    } else {
        "activation"
    };
    activation_dir.join(format!("{}-{}-list", prefix, kind))
}

fn append_lines(path: &Path, lines: &[String]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| InstallError::io(format!("Cannot open {}", path.display()), e))?;

    let mut buf = String::new();
    for line in lines {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes())
        .map_err(|e| InstallError::io(format!("Cannot write {}", path.display()), e))
}

/// Append queued units to the restart and reload list files.
pub fn append_unit_lists(activation_dir: &Path, activation: Activation, changes: &ChangeSet) -> Result<()> {
    append_lines(&list_file(activation_dir, activation, "restart"), &changes.restart)?;
    append_lines(&list_file(activation_dir, activation, "reload"), &changes.reload)
}
