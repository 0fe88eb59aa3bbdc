//! The install sequence.
//!
//! Everything up to and including validation leaves the system untouched.
//! After that, any failure before the final symlink swap leaves the
//! previously published generation in place; the half-built generation
//! directory is replaced by the next run.

use tracing::info;

use crate::changes::{self, ChangeSet};
use crate::config::{CheckMode, InstallOptions};
use crate::decrypt::Decrypt;
use crate::error::Result;
use crate::fs::{self, mount_secrets_fs};
use crate::generation;
use crate::keys::{KeyConverter, KeyMaterial};
use crate::manifest::Manifest;
use crate::resolve::{self, identity, Resolver, SourceCache};
use crate::template;
use crate::types::*;

/// How far an install went.
#[derive(Debug)]
pub enum Outcome {
    /// A check mode was requested; nothing was written.
    Validated,
    /// Dry activation: the generation was written but not published.
    DryRun {
        generation: PathBuf,
        changes: Option<ChangeSet>,
    },
    Published {
        generation: PathBuf,
        changes: Option<ChangeSet>,
    },
}

pub struct Installer<'a> {
    options: &'a InstallOptions,
    decryptor: &'a dyn Decrypt,
    converter: &'a dyn KeyConverter,
}

impl<'a> Installer<'a> {
    pub fn new(options: &'a InstallOptions, decryptor: &'a dyn Decrypt, converter: &'a dyn KeyConverter) -> Self {
        Self {
            options,
            decryptor,
            converter,
        }
    }

    pub fn install(&self, manifest: Manifest) -> Result<Outcome> {
        self.install_with_cache(manifest, &mut SourceCache::new())
    }

    /// Install with a caller-provided source cache, which may already hold
    /// decrypted files.
    pub fn install_with_cache(&self, mut manifest: Manifest, cache: &mut SourceCache) -> Result<Outcome> {
        let opts = self.options;
        let user_mode = manifest.user_mode;

        if user_mode {
            manifest.substitute_runtime_dir(&opts.runtime_dir());
        }

        manifest
            .validate_key_sources()
            .map_err(|e| e.during("Manifest is not valid"))?;
        let plan = Resolver::new(opts, user_mode, cache)
            .validate(&manifest)
            .map_err(|e| e.during("Manifest is not valid"))?;

        if opts.check_mode != CheckMode::Off {
            return Ok(Outcome::Validated);
        }

        let keys_gid = if opts.ignore_passwd {
            0
        } else if user_mode {
            identity::current_ids().1
        } else {
            identity::keys_group()?
        };

        mount_secrets_fs(&manifest.secrets_mount_point, keys_gid, manifest.use_tmpfs, user_mode)
            .map_err(|e| e.during("Failed to mount filesystem for secrets"))?;

        let keys = KeyMaterial::setup(&manifest, self.converter)?;

        let mut entries = resolve::decrypt_secrets(&plan.secrets, cache, self.decryptor, keys.env())?;
        let rendered = template::render_templates(
            &plan.templates,
            &manifest.placeholder_by_secret_name,
            &entries,
        )
        .map_err(|e| e.during("Cannot render templates"))?;
        entries.extend(rendered);

        let generation_dir = generation::prepare_next_generation(
            &manifest.secrets_mount_point,
            &manifest.symlink_path,
            keys_gid,
            user_mode,
        )
        .map_err(|e| e.during("Failed to prepare new secrets directory"))?;

        fs::write_entries(&generation_dir, &entries, keys_gid, user_mode)
            .map_err(|e| e.during("Cannot write secrets"))?;

        let changes = self
            .handle_changes(&manifest, &generation_dir, &entries)
            .map_err(|e| e.during("Cannot request units to restart"))?;

        if opts.activation.is_dry() {
            return Ok(Outcome::DryRun {
                generation: generation_dir,
                changes,
            });
        }

        fs::symlink_entries(&manifest.symlink_path, &entries, user_mode)
            .map_err(|e| e.during("Failed to prepare symlinks to secret store"))?;
        fs::atomic_symlink(&generation_dir, &manifest.symlink_path)
            .map_err(|e| e.during("Cannot update secrets symlink"))?;
        info!(generation = %generation_dir.display(), link = %manifest.symlink_path.display(), "published");

        generation::prune_generations(
            &manifest.secrets_mount_point,
            &generation_dir,
            manifest.keep_generations,
        )
        .map_err(|e| e.during("Cannot prune old secrets generations"))?;

        Ok(Outcome::Published {
            generation: generation_dir,
            changes,
        })
    }

    /// Diff against the published generation. Units are only queued and
    /// changes only reported outside user mode, where the activation script
    /// consumes them.
    fn handle_changes(
        &self,
        manifest: &Manifest,
        generation_dir: &Path,
        entries: &[crate::entry::Entry],
    ) -> Result<Option<ChangeSet>> {
        let log_changes = manifest.logging.secret_changes && !manifest.user_mode;
        let Some(changes) =
            changes::detect_changes(&manifest.symlink_path, generation_dir, entries, log_changes)?
        else {
            return Ok(None);
        };

        if !manifest.user_mode {
            changes::append_unit_lists(&self.options.activation_dir, self.options.activation, &changes)?;
            if log_changes {
                for line in changes.summary(self.options.activation) {
                    println!("{}", line);
                }
            }
        }
        Ok(Some(changes))
    }
}
