use std::collections::hash_map::Entry;
use std::fs;

use zeroize::Zeroizing;

use crate::decrypt::{Decrypt, DecryptionEnv};
use crate::error::{InstallError, Result};
use crate::format::{self, Format, Value};
use crate::types::*;

/// Decrypted content of a source file.
pub struct Plaintext {
    pub content: Zeroizing<Vec<u8>>,
    /// Parsed tree for keyed formats; `None` for binary.
    pub tree: Option<Value>,
}

/// Everything known about one source file, shared by all secrets that
/// reference it.
pub struct SourceFile {
    pub format: Format,
    /// Name of the first secret that referenced this file.
    pub first_secret: Option<String>,
    /// Structure of the file as stored. sops leaves key names in clear, so
    /// key paths can be checked without decrypting.
    pub stored: Option<Value>,
    pub plaintext: Option<Plaintext>,
}

impl SourceFile {
    fn new(format: Format) -> Self {
        Self {
            format,
            first_secret: None,
            stored: None,
            plaintext: None,
        }
    }

    /// The best tree available for key checks.
    pub fn tree(&self) -> Option<&Value> {
        self.plaintext
            .as_ref()
            .and_then(|p| p.tree.as_ref())
            .or(self.stored.as_ref())
    }
}

/// Per-invocation cache of source files, keyed by path. Each file is read,
/// decrypted and parsed at most once.
#[derive(Default)]
pub struct SourceCache {
    files: HashMap<PathBuf, SourceFile>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache with already decrypted content, bypassing the backend.
    pub fn insert_plaintext(&mut self, path: impl Into<PathBuf>, format: Format, content: Vec<u8>) -> Result<()> {
        let path = path.into();
        let plaintext = parse_plaintext(&path, format, Zeroizing::new(content))?;
        let file = self
            .files
            .entry(path)
            .or_insert_with(|| SourceFile::new(format));
        file.format = format;
        file.plaintext = Some(plaintext);
        Ok(())
    }

    /// Look up or create the entry for `path`. With `read_stored`, a new
    /// entry also gets its stored structure parsed from disk.
    pub(crate) fn load(&mut self, path: &Path, format: Format, read_stored: bool) -> Result<&mut SourceFile> {
        match self.files.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut file = SourceFile::new(format);
                if read_stored {
                    file.stored = read_stored_structure(path, format)?;
                }
                Ok(entry.insert(file))
            }
        }
    }

    /// The plaintext of `path`, decrypting on first use.
    pub fn plaintext(
        &mut self,
        path: &Path,
        format: Format,
        decryptor: &dyn Decrypt,
        env: &DecryptionEnv,
    ) -> Result<&Plaintext> {
        let file = self
            .files
            .entry(path.to_path_buf())
            .or_insert_with(|| SourceFile::new(format));

        let plaintext = match file.plaintext.take() {
            Some(existing) => existing,
            None => {
                let content = Zeroizing::new(decryptor.decrypt(path, format, env)?);
                parse_plaintext(path, format, content)?
            }
        };
        Ok(file.plaintext.insert(plaintext))
    }
}

fn parse_plaintext(path: &Path, format: Format, content: Zeroizing<Vec<u8>>) -> Result<Plaintext> {
    let tree = format::parse(format, &content).map_err(|reason| InstallError::Parse {
        format: format.as_str(),
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(Plaintext { content, tree })
}

/// Parse a source file as stored on disk. Binary files are stored by sops
/// as a JSON envelope, which is checked but not kept.
fn read_stored_structure(path: &Path, format: Format) -> Result<Option<Value>> {
    let stored = fs::read(path).map_err(|e| InstallError::io(format!("Failed reading {}", path.display()), e))?;

    let parse_as = if format == Format::Binary { Format::Json } else { format };
    let tree = format::parse(parse_as, &stored).map_err(|reason| InstallError::Parse {
        format: parse_as.as_str(),
        path: path.to_path_buf(),
        reason,
    })?;

    Ok(if format == Format::Binary { None } else { tree })
}
