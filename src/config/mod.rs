use std::env;

use crate::types::*;

/// Environment variable the activation script sets to `dry-activate` for previews.
pub const ACTION_ENV: &str = "NIXOS_ACTION";
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

/// Where the activation script picks up restart/reload unit lists.
pub const DEFAULT_ACTIVATION_DIR: &str = "/run/nixos";

/// Prefix of error and key-import lines.
pub const PROGRAM_NAME: &str = "sops-install-secrets";

/// How far to go: validate only, or install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum CheckMode {
    /// Validate, then install.
    #[default]
    Off,
    /// Validate manifest structure only.
    Manifest,
    /// Also check that declared keys exist in the (still encrypted) source files.
    Sopsfile,
}

/// Whether this is a real activation or a dry-run preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Real,
    Dry,
}

impl Activation {
    pub fn from_env() -> Self {
        match env::var(ACTION_ENV) {
            Ok(action) if action == "dry-activate" => Activation::Dry,
            _ => Activation::Real,
        }
    }

    pub fn is_dry(&self) -> bool {
        *self == Activation::Dry
    }
}

/// Everything about one invocation that does not come from the manifest.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub check_mode: CheckMode,
    /// Skip passwd/group lookups; everything is owned by root (or the
    /// invoking user in user mode).
    pub ignore_passwd: bool,
    pub activation: Activation,
    /// Directory holding the restart/reload list files.
    pub activation_dir: PathBuf,
    /// Substituted for `%r` in user mode. `None` falls back to `/run/user/<uid>`.
    pub runtime_dir: Option<PathBuf>,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            check_mode: CheckMode::Off,
            ignore_passwd: false,
            activation: Activation::Real,
            activation_dir: PathBuf::from(DEFAULT_ACTIVATION_DIR),
            runtime_dir: None,
        }
    }
}

impl InstallOptions {
    /// Options for a CLI invocation, reading the activation environment.
    pub fn from_env(check_mode: CheckMode, ignore_passwd: bool) -> Self {
        Self {
            check_mode,
            ignore_passwd,
            activation: Activation::from_env(),
            runtime_dir: env::var_os(RUNTIME_DIR_ENV).map(PathBuf::from),
            ..Self::default()
        }
    }

    /// The user-mode runtime directory.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/run/user/{}", nix::unistd::getuid().as_raw()))
        })
    }
}

/// Locations of the external programs the installer drives.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub sops: PathBuf,
    pub ssh_to_pgp: PathBuf,
    pub ssh_to_age: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            sops: PathBuf::from("sops"),
            ssh_to_pgp: PathBuf::from("ssh-to-pgp"),
            ssh_to_age: PathBuf::from("ssh-to-age"),
        }
    }
}
