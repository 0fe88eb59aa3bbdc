//! The decryption backend.
//!
//! Decryption is delegated to `sops`. Key locations are passed per call in a
//! [`DecryptionEnv`] and handed to the child process only, so the
//! installer's own environment is never modified.

use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{InstallError, Result};
use crate::format::Format;
use crate::types::*;

const GNUPG_HOME_ENV: &str = "GNUPGHOME";
const AGE_KEY_FILE_ENV: &str = "SOPS_AGE_KEY_FILE";

/// Key material locations a decryption call may use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptionEnv {
    pub gnupg_home: Option<PathBuf>,
    pub age_key_file: Option<PathBuf>,
}

/// Turns an encrypted file into its plaintext.
pub trait Decrypt {
    fn decrypt(&self, path: &Path, format: Format, env: &DecryptionEnv) -> Result<Vec<u8>>;
}

/// Runs the `sops` binary.
#[derive(Debug, Clone)]
pub struct SopsDecryptor {
    binary: PathBuf,
}

impl SopsDecryptor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, path: &Path, format: Format, env: &DecryptionEnv) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--decrypt")
            .args(["--input-type", format.as_str()])
            .args(["--output-type", format.as_str()])
            .arg(path)
            .stdin(Stdio::null());

        if let Some(home) = &env.gnupg_home {
            cmd.env(GNUPG_HOME_ENV, home);
        }
        if let Some(key_file) = &env.age_key_file {
            cmd.env(AGE_KEY_FILE_ENV, key_file);
        }
        cmd
    }
}

impl Decrypt for SopsDecryptor {
    fn decrypt(&self, path: &Path, format: Format, env: &DecryptionEnv) -> Result<Vec<u8>> {
        debug!(file = %path.display(), %format, "decrypting");

        let output = self
            .command(path, format, env)
            .output()
            .map_err(|e| InstallError::Decryption {
                path: path.to_path_buf(),
                reason: format!("failed to run '{}': {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InstallError::Decryption {
                path: path.to_path_buf(),
                reason: match stderr.trim() {
                    "" => format!("sops exited with {}", output.status),
                    msg => msg.to_string(),
                },
            });
        }

        Ok(output.stdout)
    }
}
