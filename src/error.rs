use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::format::PathError;

/// Failure categories. Every category is fatal; they differ in how far the
/// install got before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed manifest, mode or format. Nothing has been mutated yet.
    Config,
    /// Unknown user or group.
    Lookup,
    /// Backend failure or corrupt plaintext.
    Decryption,
    /// Mount, chown, write or rename failure.
    Filesystem,
    /// Symlink target mismatch or corrupt generation naming.
    Integrity,
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to open manifest '{}': {source}", path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse manifest: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("gnupgHome and {0} were specified in the manifest. Both options are mutually exclusive.")]
    ConflictingKeySources(&'static str),

    #[error("Invalid mode '{mode}' for {name}: expected an octal number")]
    InvalidMode { name: String, mode: String },

    #[error("Unsupported format {format} for secret {name}")]
    UnsupportedFormat { name: String, format: String },

    #[error(
        "secret {name} defined the format of {} as {format}, but it was specified as {first_format} in {first_name} before",
        file.display()
    )]
    FormatMismatch {
        name: String,
        file: PathBuf,
        format: String,
        first_name: String,
        first_format: String,
    },

    #[error("secret {name} in {} is not valid: {source}", file.display())]
    InvalidSecret {
        name: String,
        file: PathBuf,
        #[source]
        source: PathError,
    },

    #[error("Invalid name '{name}': must be a relative path without '.' or '..' components")]
    InvalidName { name: String },

    #[error("template {name} must set exactly one of 'content' or 'file'")]
    TemplateSource { name: String },

    #[error("placeholder for unknown secret '{0}'")]
    UnknownPlaceholder(String),

    #[error("Failed to lookup {kind} '{name}': {reason}")]
    Lookup {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Failed to decrypt '{}': {reason}", path.display())]
    Decryption { path: PathBuf, reason: String },

    #[error("Cannot parse {format} of '{}': {reason}", path.display())]
    Parse {
        format: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("Cannot convert ssh key '{}': {reason}", path.display())]
    KeyConversion { path: PathBuf, reason: String },

    #[error("Invalid age identity in '{}': {reason}", path.display())]
    InvalidAgeKey { path: PathBuf, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: nix::Error,
    },

    #[error("symlink {} does not point to {}", path.display(), expected.display())]
    SymlinkMismatch { path: PathBuf, expected: PathBuf },

    #[error("Cannot parse {name} of {} as a number", target.display())]
    CorruptGeneration { name: String, target: PathBuf },

    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<InstallError>,
    },
}

impl InstallError {
    /// Wrap an io error with the operation and path it came from.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        InstallError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn os(context: impl Into<String>, source: nix::Error) -> Self {
        InstallError::Os {
            context: context.into(),
            source,
        }
    }

    /// Attach the orchestrator step this error aborted.
    pub fn during(self, step: &'static str) -> Self {
        InstallError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The taxonomy category, looking through step context.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::ManifestRead { .. }
            | InstallError::ManifestParse(_)
            | InstallError::ConflictingKeySources(_)
            | InstallError::InvalidMode { .. }
            | InstallError::UnsupportedFormat { .. }
            | InstallError::FormatMismatch { .. }
            | InstallError::InvalidSecret { .. }
            | InstallError::InvalidName { .. }
            | InstallError::TemplateSource { .. }
            | InstallError::UnknownPlaceholder(_) => ErrorKind::Config,
            InstallError::Lookup { .. } => ErrorKind::Lookup,
            InstallError::Decryption { .. }
            | InstallError::Parse { .. }
            | InstallError::KeyConversion { .. }
            | InstallError::InvalidAgeKey { .. } => ErrorKind::Decryption,
            InstallError::Io { .. } | InstallError::Os { .. } => ErrorKind::Filesystem,
            InstallError::SymlinkMismatch { .. } | InstallError::CorruptGeneration { .. } => {
                ErrorKind::Integrity
            }
            InstallError::Step { source, .. } => source.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;
