use std::fmt;
use std::path::Component;

use zeroize::Zeroizing;

use crate::error::{InstallError, Result};
use crate::types::*;

/// Subdirectory of a generation holding rendered templates.
pub const RENDERED_DIR: &str = "rendered";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Secret,
    Template,
}

/// One file to install into a generation: a decrypted secret or a rendered
/// template.
pub struct Entry {
    pub kind: EntryKind,
    pub name: String,
    /// Location inside a generation directory (and under the public symlink).
    pub relative: PathBuf,
    /// Where the manifest wants a symlink to this file, if anywhere.
    pub path: Option<PathBuf>,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub value: Zeroizing<Vec<u8>>,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
}

impl Entry {
    /// Relative location of a secret or template named `name`.
    pub fn relative_path(kind: EntryKind, name: &str) -> PathBuf {
        match kind {
            EntryKind::Secret => PathBuf::from(name),
            EntryKind::Template => Path::new(RENDERED_DIR).join(name),
        }
    }
}

/// Check that `name` stays inside the directory it is joined onto: not
/// empty, not absolute, and made of plain components only.
pub fn check_name(name: &str) -> Result<()> {
    // components() drops interior "." segments, so check the raw segments too
    let confined = !name.is_empty()
        && !name.split('/').any(|segment| segment == "." || segment == "..")
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if confined {
        Ok(())
    } else {
        Err(InstallError::InvalidName {
            name: name.to_string(),
        })
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("relative", &self.relative)
            .field("path", &self.path)
            .field("mode", &format_args!("{:04o}", self.mode))
            .field("owner", &self.owner)
            .field("group", &self.group)
            .field("value", &"<redacted>")
            .finish()
    }
}
