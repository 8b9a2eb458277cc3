use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SourceLocation;

/// Maximum length of a normalized debug identifier.
///
/// Breakpad identifiers are 33 characters, GNU build ids are usually 40. Anything much longer
/// than that is not a real identifier.
const MAX_DEBUG_ID_LEN: usize = 64;

/// An error when constructing a [`ModuleKey`] from user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidModuleKey {
    #[error("empty debug filename")]
    EmptyFilename,
    #[error("invalid debug filename `{0}`")]
    InvalidFilename(String),
    #[error("empty debug id")]
    EmptyDebugId,
    #[error("invalid debug id `{0}`")]
    InvalidDebugId(String),
}

/// Identifies the symbol file of one compiled module.
///
/// The `debug_id` is normalized to upper-case hex without dashes, so `44e4ec8c-2f41` and
/// `44E4EC8C2F41` refer to the same module. Keys are immutable after construction.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ModuleKey {
    debug_filename: String,
    debug_id: String,
}

impl ModuleKey {
    /// Validates and normalizes a module identity.
    pub fn new(debug_filename: &str, debug_id: &str) -> Result<Self, InvalidModuleKey> {
        let debug_filename = debug_filename.trim();
        if debug_filename.is_empty() {
            return Err(InvalidModuleKey::EmptyFilename);
        }
        if debug_filename == "."
            || debug_filename == ".."
            || debug_filename.contains(['/', '\\', '\0'])
        {
            return Err(InvalidModuleKey::InvalidFilename(debug_filename.to_owned()));
        }

        let normalized: String = debug_id
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() {
            return Err(InvalidModuleKey::EmptyDebugId);
        }
        if normalized.len() > MAX_DEBUG_ID_LEN || !normalized.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(InvalidModuleKey::InvalidDebugId(debug_id.to_owned()));
        }

        Ok(Self {
            debug_filename: debug_filename.to_owned(),
            debug_id: normalized,
        })
    }

    pub fn debug_filename(&self) -> &str {
        &self.debug_filename
    }

    pub fn debug_id(&self) -> &str {
        &self.debug_id
    }

    /// Returns the location of this module's symbol file on a symbol store.
    ///
    /// This follows the breakpad symbol store convention: `<debug_file>/<DEBUG_ID>/<stem>.sym`,
    /// where the stem is the debug file name with a trailing `.pdb`, `.exe` or `.dll` removed.
    pub fn symbol_location(&self) -> SourceLocation {
        let name = &self.debug_filename;
        let stem = [".pdb", ".exe", ".dll"]
            .iter()
            .find_map(|ext| {
                let split = name.len().checked_sub(ext.len())?;
                let (stem, suffix) = (name.get(..split)?, name.get(split..)?);
                suffix.eq_ignore_ascii_case(ext).then_some(stem)
            })
            .unwrap_or(name);

        SourceLocation::new(format!("{}/{}/{}.sym", name, self.debug_id, stem))
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.debug_filename, self.debug_id)
    }
}
