//! sops-install-secrets: installs sops-encrypted secrets at activation time.
//!
//! Secrets listed in a JSON manifest are decrypted into a numbered generation
//! directory on a memory-backed mount, then published by atomically
//! repointing a public symlink at that directory. Units depending on changed
//! secrets are queued for restart or reload, and old generations are pruned.
//!
//! # Example
//!
//! ```no_run
//! use sops_install::config::{CheckMode, InstallOptions, ToolPaths};
//! use sops_install::decrypt::SopsDecryptor;
//! use sops_install::install::Installer;
//! use sops_install::keys::ExternalKeyConverter;
//! use sops_install::manifest::Manifest;
//!
//! let tools = ToolPaths::default();
//! let options = InstallOptions::from_env(CheckMode::Off, false);
//! let decryptor = SopsDecryptor::new(&tools.sops);
//! let converter = ExternalKeyConverter::new(&tools);
//!
//! let manifest = Manifest::load("/etc/secrets/manifest.json".as_ref())?;
//! Installer::new(&options, &decryptor, &converter).install(manifest)?;
//! # Ok::<(), sops_install::error::InstallError>(())
//! ```

pub mod changes;
pub mod config;
pub mod decrypt;
pub mod entry;
pub mod error;
pub mod format;
pub mod fs;
pub mod generation;
pub mod install;
pub mod keys;
pub mod logging;
pub mod manifest;
pub mod resolve;
pub mod template;
pub mod types;
