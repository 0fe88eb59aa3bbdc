use super::{empty_as_none, empty_string_as_none};
use crate::types::*;

/// A secret as declared in the manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Relative path under the secrets root.
    pub name: String,
    /// Slash-delimited path into the decrypted document. Empty means the whole file.
    #[serde(default)]
    pub key: String,
    /// Where a symlink to the installed secret should live.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub path: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub gid: u32,
    pub sops_file: PathBuf,
    /// Kept as text so an unsupported value is reported against the secret
    /// instead of failing the whole manifest parse.
    #[serde(default)]
    pub format: String,
    /// Octal permission string, e.g. "0400".
    pub mode: String,
    #[serde(default)]
    pub restart_units: Vec<String>,
    #[serde(default)]
    pub reload_units: Vec<String>,
}

/// A file rendered from literal or file content with secret placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    #[serde(default)]
    pub content: String,
    /// Path of a file to read the template text from instead of `content`.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub file: Option<PathBuf>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub path: Option<PathBuf>,
    pub mode: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub restart_units: Vec<String>,
    #[serde(default)]
    pub reload_units: Vec<String>,
}
