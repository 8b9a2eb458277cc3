use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{CommonSourceConfig, RemoteFile, SourceId, SourceLocation};

/// Configuration for reading from the local file system.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilesystemSourceConfig {
    /// Unique source identifier.
    pub id: SourceId,

    /// Path to symbol directory.
    pub path: PathBuf,

    /// Configuration common to all sources.
    #[serde(flatten)]
    pub files: CommonSourceConfig,
}

/// Filesystem-specific [`RemoteFile`].
#[derive(Debug, Clone)]
pub struct FilesystemRemoteFile {
    pub source: Arc<FilesystemSourceConfig>,
    pub(crate) location: SourceLocation,
}

impl From<FilesystemRemoteFile> for RemoteFile {
    fn from(source: FilesystemRemoteFile) -> Self {
        Self::Filesystem(source)
    }
}

impl FilesystemRemoteFile {
    /// Creates a new [`FilesystemRemoteFile`].
    pub fn new(source: Arc<FilesystemSourceConfig>, location: SourceLocation) -> Self {
        Self { source, location }
    }

    /// Returns the path from which to fetch this file.
    pub fn path(&self) -> PathBuf {
        self.source.path.join(self.location.path())
    }
}
