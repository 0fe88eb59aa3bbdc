//! Decryption key material.
//!
//! SSH host keys are converted by external tools: `ssh-to-pgp` into a
//! throwaway GnuPG keyring, `ssh-to-age` into a generated age key file. The
//! resulting locations are handed to the decryptor as a [`DecryptionEnv`].

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::process::{Command, Output, Stdio};

use chrono::{SecondsFormat, Utc};
use tempfile::TempDir;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::config::{ToolPaths, PROGRAM_NAME};
use crate::decrypt::DecryptionEnv;
use crate::error::{InstallError, Result};
use crate::manifest::{LoggingConfig, Manifest};
use crate::types::*;

pub const AGE_KEY_FILE_NAME: &str = "age-keys.txt";
const SECRING_NAME: &str = "secring.gpg";
const AGE_SECRET_KEY_PREFIX: &str = "AGE-SECRET-KEY-";

/// An OpenPGP secret key packet converted from an SSH key.
pub struct PgpKey {
    pub packet: Zeroizing<Vec<u8>>,
    pub fingerprint: String,
}

/// Converts SSH private keys into other key formats.
pub trait KeyConverter {
    fn ssh_to_pgp(&self, key_path: &Path) -> Result<PgpKey>;

    /// An `AGE-SECRET-KEY-...` identity string.
    fn ssh_to_age(&self, key_path: &Path) -> Result<Zeroizing<String>>;
}

/// Runs the `ssh-to-pgp` and `ssh-to-age` binaries.
#[derive(Debug, Clone)]
pub struct ExternalKeyConverter {
    ssh_to_pgp: PathBuf,
    ssh_to_age: PathBuf,
}

impl ExternalKeyConverter {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            ssh_to_pgp: tools.ssh_to_pgp.clone(),
            ssh_to_age: tools.ssh_to_age.clone(),
        }
    }

    fn run(binary: &Path, args: &[&str], key_path: &Path) -> Result<Output> {
        let output = Command::new(binary)
            .args(args)
            .arg("-i")
            .arg(key_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| InstallError::KeyConversion {
                path: key_path.to_path_buf(),
                reason: format!("failed to run '{}': {}", binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstallError::KeyConversion {
                path: key_path.to_path_buf(),
                reason: match stderr.trim() {
                    "" => format!("{} exited with {}", binary.display(), output.status),
                    msg => msg.to_string(),
                },
            });
        }
        Ok(output)
    }
}

impl KeyConverter for ExternalKeyConverter {
    fn ssh_to_pgp(&self, key_path: &Path) -> Result<PgpKey> {
        let output = Self::run(
            &self.ssh_to_pgp,
            &["-private-key", "-format", "binary"],
            key_path,
        )?;
        if output.stdout.is_empty() {
            return Err(InstallError::KeyConversion {
                path: key_path.to_path_buf(),
                reason: "no key material produced".to_string(),
            });
        }
        // the fingerprint is the last line on stderr
        let fingerprint = String::from_utf8_lossy(&output.stderr)
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(PgpKey {
            packet: Zeroizing::new(output.stdout),
            fingerprint,
        })
    }

    fn ssh_to_age(&self, key_path: &Path) -> Result<Zeroizing<String>> {
        let output = Self::run(&self.ssh_to_age, &["-private-key"], key_path)?;
        let stdout = Zeroizing::new(output.stdout);
        let text = std::str::from_utf8(&stdout).map_err(|e| InstallError::KeyConversion {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Zeroizing::new(text.trim().to_string()))
    }
}

/// A GnuPG home holding keys converted for this install. The directory is
/// removed when the keyring is dropped.
pub struct GpgKeyring {
    dir: TempDir,
}

impl GpgKeyring {
    pub fn create(
        parent: &Path,
        key_paths: &[PathBuf],
        converter: &dyn KeyConverter,
        logging: &LoggingConfig,
    ) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("gpg")
            .tempdir_in(parent)
            .map_err(|e| {
                InstallError::io(format!("Cannot create gpg home in '{}'", parent.display()), e)
            })?;

        let secring_path = dir.path().join(SECRING_NAME);
        let mut secring = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&secring_path)
            .map_err(|e| InstallError::io(format!("Cannot create {}", secring_path.display()), e))?;

        for key_path in key_paths {
            let key = converter.ssh_to_pgp(key_path)?;
            secring
                .write_all(&key.packet)
                .map_err(|e| InstallError::io("Cannot write secring", e))?;

            if logging.key_import {
                println!(
                    "{}: Imported {} with fingerprint {}",
                    PROGRAM_NAME,
                    key_path.display(),
                    key.fingerprint
                );
            }
            debug!(key = %key_path.display(), fingerprint = %key.fingerprint, "imported ssh key into gpg keyring");
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Write `<mount_point>/age-keys.txt` from converted SSH keys and an
/// existing age key file. Returns the path written.
pub fn write_age_key_file(
    mount_point: &Path,
    ssh_key_paths: &[PathBuf],
    key_file: Option<&Path>,
    converter: &dyn KeyConverter,
) -> Result<PathBuf> {
    let mut content = Zeroizing::new(format!(
        "# generated by {} at {}\n",
        PROGRAM_NAME,
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    for key_path in ssh_key_paths {
        let identity = converter.ssh_to_age(key_path)?;
        check_age_identity(key_path, &identity)?;
        content.push_str(&identity);
        content.push('\n');
    }

    if let Some(key_file) = key_file {
        let existing = Zeroizing::new(fs::read_to_string(key_file).map_err(|e| {
            InstallError::io(format!("Cannot read keyfile '{}'", key_file.display()), e)
        })?);
        for line in existing.lines().map(str::trim) {
            if line.starts_with(AGE_SECRET_KEY_PREFIX) {
                check_age_identity(key_file, line)?;
            }
        }
        content.push_str(&existing);
        content.push('\n');
    }

    let path = mount_point.join(AGE_KEY_FILE_NAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| InstallError::io(format!("Cannot create '{}'", path.display()), e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| InstallError::io("Cannot write key to age file", e))?;

    info!(path = %path.display(), "wrote age key file");
    Ok(path)
}

fn check_age_identity(source: &Path, identity: &str) -> Result<()> {
    identity
        .parse::<age::x25519::Identity>()
        .map(|_| ())
        .map_err(|e: &str| InstallError::InvalidAgeKey {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Key material prepared for one install. Keeps the temporary keyring alive
/// until dropped.
pub struct KeyMaterial {
    _keyring: Option<GpgKeyring>,
    env: DecryptionEnv,
}

impl KeyMaterial {
    pub fn setup(manifest: &Manifest, converter: &dyn KeyConverter) -> Result<Self> {
        let mut env = DecryptionEnv::default();

        let keyring = if !manifest.ssh_key_paths.is_empty() {
            let keyring = GpgKeyring::create(
                &manifest.secrets_mount_point,
                &manifest.ssh_key_paths,
                converter,
                &manifest.logging,
            )
            .map_err(|e| e.during("Error setting up gpg keyring"))?;
            env.gnupg_home = Some(keyring.path().to_path_buf());
            Some(keyring)
        } else {
            env.gnupg_home = manifest.gnupg_home.clone();
            None
        };

        if !manifest.age_ssh_key_paths.is_empty() || manifest.age_key_file.is_some() {
            env.age_key_file = Some(write_age_key_file(
                &manifest.secrets_mount_point,
                &manifest.age_ssh_key_paths,
                manifest.age_key_file.as_deref(),
                converter,
            )?);
        }

        Ok(Self {
            _keyring: keyring,
            env,
        })
    }

    pub fn env(&self) -> &DecryptionEnv {
        &self.env
    }
}
