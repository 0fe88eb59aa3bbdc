//! Templates: files assembled from literal text with secret placeholders.
//!
//! Substitution runs once over the template text, left to right. At each
//! position the longest matching placeholder wins, and the inserted secret
//! value is never scanned again. A secret whose plaintext happens to contain
//! another secret's placeholder is therefore inserted as-is.

use std::fs;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::entry::{Entry, EntryKind};
use crate::error::{InstallError, Result};
use crate::manifest::Template;
use crate::resolve::ResolvedTemplate;
use crate::types::*;

/// Where a template's text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Inline(String),
    File(PathBuf),
}

impl TemplateSource {
    /// Exactly one of `content` and `file` must be set.
    pub fn from_template(template: &Template) -> Result<Self> {
        match (template.content.is_empty(), &template.file) {
            (false, None) => Ok(TemplateSource::Inline(template.content.clone())),
            (true, Some(file)) => Ok(TemplateSource::File(file.clone())),
            _ => Err(InstallError::TemplateSource {
                name: template.name.clone(),
            }),
        }
    }

    pub fn load(&self) -> Result<Vec<u8>> {
        match self {
            TemplateSource::Inline(text) => Ok(text.as_bytes().to_vec()),
            TemplateSource::File(path) => fs::read(path).map_err(|e| {
                InstallError::io(format!("Cannot read template file {}", path.display()), e)
            }),
        }
    }
}

/// One placeholder token and the plaintext that replaces it.
pub struct Substitution<'a> {
    pub secret: &'a str,
    pub token: &'a [u8],
    pub value: &'a [u8],
}

/// Replace every placeholder in `text` in a single pass.
pub fn substitute(text: &[u8], substitutions: &[Substitution<'_>]) -> Zeroizing<Vec<u8>> {
    let mut ordered: Vec<&Substitution<'_>> = substitutions
        .iter()
        .filter(|s| !s.token.is_empty())
        .collect();
    ordered.sort_by(|a, b| b.token.len().cmp(&a.token.len()));

    let mut out = Zeroizing::new(Vec::with_capacity(text.len()));
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        match ordered.iter().find(|s| rest.starts_with(s.token)) {
            Some(sub) => {
                out.extend_from_slice(sub.value);
                i += sub.token.len();
            }
            None => {
                out.push(text[i]);
                i += 1;
            }
        }
    }
    out
}

/// Render every template against the decrypted secrets.
pub fn render_templates(
    templates: &[ResolvedTemplate],
    placeholders: &HashMap<String, String>,
    secrets: &[Entry],
) -> Result<Vec<Entry>> {
    if templates.is_empty() {
        return Ok(Vec::new());
    }

    let mut substitutions = Vec::with_capacity(placeholders.len());
    for (name, token) in placeholders {
        let secret = secrets
            .iter()
            .find(|e| e.kind == EntryKind::Secret && &e.name == name)
            .ok_or_else(|| InstallError::UnknownPlaceholder(name.clone()))?;
        substitutions.push(Substitution {
            secret: name,
            token: token.as_bytes(),
            value: &secret.value,
        });
    }
    warn_on_nested_placeholders(&substitutions);

    templates
        .iter()
        .map(|template| {
            debug!(template = %template.name, "rendering");
            let text = Zeroizing::new(template.source.load()?);
            Ok(template.entry(substitute(&text, &substitutions)))
        })
        .collect()
}

fn warn_on_nested_placeholders(substitutions: &[Substitution<'_>]) {
    for sub in substitutions {
        for other in substitutions {
            if other.token.is_empty() || sub.value.len() < other.token.len() {
                continue;
            }
            if sub.value.windows(other.token.len()).any(|w| w == other.token) {
                warn!(
                    secret = sub.secret,
                    placeholder_of = other.secret,
                    "secret value contains a placeholder; it is inserted verbatim"
                );
            }
        }
    }
}
