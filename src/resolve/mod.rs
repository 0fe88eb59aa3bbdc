//! Manifest validation and secret extraction.
//!
//! [`Resolver::validate`] runs before anything on disk is touched: it parses
//! modes, resolves ownership, checks formats and (outside `manifest` check
//! mode) key paths. [`decrypt_secrets`] later turns the validated plan into
//! plaintext [`Entry`] values.

pub mod cache;
pub mod identity;

use tracing::debug;
use zeroize::Zeroizing;

pub use cache::{Plaintext, SourceCache, SourceFile};

use crate::config::{CheckMode, InstallOptions};
use crate::decrypt::{Decrypt, DecryptionEnv};
use crate::entry::{self, Entry, EntryKind};
use crate::error::{InstallError, Result};
use crate::format::{self, Format};
use crate::manifest::{Manifest, Secret, Template};
use crate::template::TemplateSource;
use crate::types::*;

const MAX_MODE: u32 = 0o7777;

#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub name: String,
    pub key: String,
    pub path: Option<PathBuf>,
    pub sops_file: PathBuf,
    pub format: Format,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
}

impl ResolvedSecret {
    pub fn entry(&self, value: Zeroizing<Vec<u8>>) -> Entry {
        Entry {
            kind: EntryKind::Secret,
            name: self.name.clone(),
            relative: Entry::relative_path(EntryKind::Secret, &self.name),
            path: self.path.clone(),
            mode: self.mode,
            owner: self.owner,
            group: self.group,
            value,
            restart_units: self.restart_units.clone(),
            reload_units: self.reload_units.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    pub name: String,
    pub source: TemplateSource,
    pub path: Option<PathBuf>,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    pub restart_units: Vec<String>,
    pub reload_units: Vec<String>,
}

impl ResolvedTemplate {
    pub fn entry(&self, value: Zeroizing<Vec<u8>>) -> Entry {
        Entry {
            kind: EntryKind::Template,
            name: self.name.clone(),
            relative: Entry::relative_path(EntryKind::Template, &self.name),
            path: self.path.clone(),
            mode: self.mode,
            owner: self.owner,
            group: self.group,
            value,
            restart_units: self.restart_units.clone(),
            reload_units: self.reload_units.clone(),
        }
    }
}

/// The validated manifest, in manifest order.
#[derive(Debug, Default)]
pub struct Plan {
    pub secrets: Vec<ResolvedSecret>,
    pub templates: Vec<ResolvedTemplate>,
}

pub struct Resolver<'a> {
    options: &'a InstallOptions,
    user_mode: bool,
    cache: &'a mut SourceCache,
}

impl<'a> Resolver<'a> {
    pub fn new(options: &'a InstallOptions, user_mode: bool, cache: &'a mut SourceCache) -> Self {
        Self {
            options,
            user_mode,
            cache,
        }
    }

    pub fn validate(&mut self, manifest: &Manifest) -> Result<Plan> {
        let mut plan = Plan::default();
        for secret in &manifest.secrets {
            plan.secrets.push(self.validate_secret(secret)?);
        }

        let mut unknown: Vec<&String> = manifest
            .placeholder_by_secret_name
            .keys()
            .filter(|name| !manifest.secrets.iter().any(|s| &s.name == *name))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(InstallError::UnknownPlaceholder(name.to_string()));
        }

        for template in &manifest.templates {
            plan.templates.push(self.validate_template(template)?);
        }
        Ok(plan)
    }

    fn validate_secret(&mut self, secret: &Secret) -> Result<ResolvedSecret> {
        entry::check_name(&secret.name)?;
        let mode = parse_mode(&secret.name, &secret.mode)?;
        let (owner, group) = self.resolve_ids(
            secret.owner.as_deref(),
            secret.uid,
            secret.group.as_deref(),
            secret.gid,
        )?;
        let format = Format::parse(&secret.format).ok_or_else(|| InstallError::UnsupportedFormat {
            name: secret.name.clone(),
            format: secret.format.clone(),
        })?;

        let check_keys = self.options.check_mode != CheckMode::Manifest;
        let file = self.cache.load(&secret.sops_file, format, check_keys)?;

        match file.first_secret.as_deref() {
            Some(first) if file.format != format => {
                return Err(InstallError::FormatMismatch {
                    name: secret.name.clone(),
                    file: secret.sops_file.clone(),
                    format: format.to_string(),
                    first_name: first.to_string(),
                    first_format: file.format.to_string(),
                });
            }
            Some(_) => {}
            None => file.first_secret = Some(secret.name.clone()),
        }

        if check_keys {
            if let Some(tree) = file.tree() {
                format::check_key(format, &secret.key, tree).map_err(|source| {
                    InstallError::InvalidSecret {
                        name: secret.name.clone(),
                        file: secret.sops_file.clone(),
                        source,
                    }
                })?;
            }
        }

        Ok(ResolvedSecret {
            name: secret.name.clone(),
            key: secret.key.clone(),
            path: secret.path.clone(),
            sops_file: secret.sops_file.clone(),
            format,
            mode,
            owner,
            group,
            restart_units: secret.restart_units.clone(),
            reload_units: secret.reload_units.clone(),
        })
    }

    fn validate_template(&mut self, template: &Template) -> Result<ResolvedTemplate> {
        entry::check_name(&template.name)?;
        let source = TemplateSource::from_template(template)?;
        let mode = parse_mode(&template.name, &template.mode)?;
        let (owner, group) = self.resolve_ids(
            template.owner.as_deref(),
            template.uid,
            template.group.as_deref(),
            template.gid,
        )?;

        Ok(ResolvedTemplate {
            name: template.name.clone(),
            source,
            path: template.path.clone(),
            mode,
            owner,
            group,
            restart_units: template.restart_units.clone(),
            reload_units: template.reload_units.clone(),
        })
    }

    fn resolve_ids(
        &self,
        owner: Option<&str>,
        uid: u32,
        group: Option<&str>,
        gid: u32,
    ) -> Result<(u32, u32)> {
        if self.options.ignore_passwd || self.options.activation.is_dry() {
            return Ok(if self.user_mode {
                identity::current_ids()
            } else {
                (0, 0)
            });
        }
        // passwd is only consulted for a real install
        if self.options.check_mode != CheckMode::Off {
            return Ok((uid, gid));
        }

        let (current_uid, current_gid) = identity::current_ids();
        let owner = match owner {
            Some(name) => identity::lookup_user(name)?,
            None if self.user_mode => current_uid,
            None => uid,
        };
        let group = match group {
            Some(name) => identity::lookup_group(name)?,
            None if self.user_mode => current_gid,
            None => gid,
        };
        Ok((owner, group))
    }
}

/// Parse an octal permission string such as `"0440"`.
pub fn parse_mode(name: &str, mode: &str) -> Result<u32> {
    u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= MAX_MODE)
        .ok_or_else(|| InstallError::InvalidMode {
            name: name.to_string(),
            mode: mode.to_string(),
        })
}

/// Decrypt every secret's source file (once per file) and extract its value.
pub fn decrypt_secrets(
    secrets: &[ResolvedSecret],
    cache: &mut SourceCache,
    decryptor: &dyn Decrypt,
    env: &DecryptionEnv,
) -> Result<Vec<Entry>> {
    secrets
        .iter()
        .map(|secret| {
            let plaintext = cache.plaintext(&secret.sops_file, secret.format, decryptor, env)?;
            let value = format::extract(
                secret.format,
                &secret.key,
                &plaintext.content,
                plaintext.tree.as_ref(),
            )
            .map_err(|source| InstallError::InvalidSecret {
                name: secret.name.clone(),
                file: secret.sops_file.clone(),
                source,
            })?;
            debug!(secret = %secret.name, bytes = value.len(), "extracted");
            Ok(secret.entry(Zeroizing::new(value)))
        })
        .collect()
}
