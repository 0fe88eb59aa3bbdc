//! Common re-exports shared across modules.

pub use std::collections::{BTreeSet, HashMap};
pub use std::path::{Path, PathBuf};

pub use serde::{Deserialize, Serialize};
