use nix::unistd::{getgid, getuid, Group, User};

use crate::error::{InstallError, Result};

/// Group that owns the secrets mount and generation directories.
pub const KEYS_GROUP: &str = "keys";
/// Used where no `keys` group exists (e.g. macOS).
pub const FALLBACK_KEYS_GROUP: &str = "admin";

pub fn lookup_user(name: &str) -> Result<u32> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(lookup_error("user", name, "no such user".to_string())),
        Err(e) => Err(lookup_error("user", name, e.to_string())),
    }
}

pub fn lookup_group(name: &str) -> Result<u32> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(lookup_error("group", name, "no such group".to_string())),
        Err(e) => Err(lookup_error("group", name, e.to_string())),
    }
}

/// The gid of the privileged keys group, trying the fallback name if the
/// primary one does not exist.
pub fn keys_group() -> Result<u32> {
    lookup_group(KEYS_GROUP).or_else(|primary| {
        lookup_group(FALLBACK_KEYS_GROUP).map_err(|_| InstallError::Lookup {
            kind: "group",
            name: format!("{}' nor '{}", KEYS_GROUP, FALLBACK_KEYS_GROUP),
            reason: primary.to_string(),
        })
    })
}

/// uid/gid of the invoking process.
pub fn current_ids() -> (u32, u32) {
    (getuid().as_raw(), getgid().as_raw())
}

fn lookup_error(kind: &'static str, name: &str, reason: String) -> InstallError {
    InstallError::Lookup {
        kind,
        name: name.to_string(),
        reason,
    }
}
