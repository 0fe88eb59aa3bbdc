//! The JSON manifest produced by the system configuration.
//!
//! Example:
//! ```json
//! {
//!   "secrets": [{
//!     "name": "db/password", "key": "db/password", "path": "/run/secrets/db/password",
//!     "owner": "postgres", "uid": 0, "group": "postgres", "gid": 0,
//!     "sopsFile": "/etc/secrets.yaml", "format": "yaml", "mode": "0400",
//!     "restartUnits": ["postgresql.service"], "reloadUnits": []
//!   }],
//!   "templates": [],
//!   "placeholderBySecretName": {},
//!   "secretsMountPoint": "/run/secrets.d",
//!   "symlinkPath": "/run/secrets",
//!   "keepGenerations": 1,
//!   "sshKeyPaths": [], "gnupgHome": "", "ageKeyFile": "", "ageSshKeyPaths": [],
//!   "useTmpfs": false, "userMode": false,
//!   "logging": { "keyImport": true, "secretChanges": false }
//! }
//! ```

pub mod secret;

use std::fs;

use serde::Deserializer;

use crate::error::{InstallError, Result};
use crate::types::*;
pub use secret::{Secret, Template};

/// Placeholder for the per-user runtime directory in user-mode paths.
pub const RUNTIME_DIR_PLACEHOLDER: &str = "%r";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub key_import: bool,
    #[serde(default)]
    pub secret_changes: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Secret name -> literal token that templates use to reference it.
    #[serde(default)]
    pub placeholder_by_secret_name: HashMap<String, String>,
    pub secrets_mount_point: PathBuf,
    pub symlink_path: PathBuf,
    /// How many generations to retain besides the current one. 0 keeps all.
    #[serde(default)]
    pub keep_generations: u64,
    #[serde(default)]
    pub ssh_key_paths: Vec<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub gnupg_home: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub age_key_file: Option<PathBuf>,
    #[serde(default)]
    pub age_ssh_key_paths: Vec<PathBuf>,
    #[serde(default)]
    pub use_tmpfs: bool,
    #[serde(default)]
    pub user_mode: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path).map_err(|source| InstallError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Replace the runtime-dir placeholder in every path the manifest
    /// declares. Only meaningful in user mode.
    pub fn substitute_runtime_dir(&mut self, runtime_dir: &Path) {
        let rundir = runtime_dir.to_string_lossy();
        let replace = |p: &mut PathBuf| {
            let s = p.to_string_lossy();
            if s.contains(RUNTIME_DIR_PLACEHOLDER) {
                *p = PathBuf::from(s.replace(RUNTIME_DIR_PLACEHOLDER, &rundir));
            }
        };

        replace(&mut self.secrets_mount_point);
        replace(&mut self.symlink_path);
        for secret in &mut self.secrets {
            if let Some(path) = secret.path.as_mut() {
                replace(path);
            }
        }
        for template in &mut self.templates {
            if let Some(path) = template.path.as_mut() {
                replace(path);
            }
        }
    }

    /// Checks that depend only on the manifest itself.
    pub fn validate_key_sources(&self) -> Result<()> {
        if self.gnupg_home.is_some() {
            if !self.ssh_key_paths.is_empty() {
                return Err(InstallError::ConflictingKeySources("sshKeyPaths"));
            }
            if self.age_key_file.is_some() {
                return Err(InstallError::ConflictingKeySources("ageKeyFile"));
            }
        }
        Ok(())
    }
}

/// Deserialize an optional path where `""` means unset.
pub(crate) fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(PathBuf::from))
}

/// Deserialize an optional name where `""` means unset.
pub(crate) fn empty_string_as_none<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
