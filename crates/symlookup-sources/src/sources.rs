//! Symbol source configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{ModuleKey, RemoteFile};

mod filesystem;
mod http;
pub use filesystem::*;
pub use http::*;

/// An identifier for symbol sources.
///
/// This is essentially a newtype for a string.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SourceId(pub(crate) String);

impl SourceId {
    /// Creates a new [`SourceId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration shared by all source types.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommonSourceConfig {
    /// Whether this source holds symbols of try builds.
    ///
    /// Try sources are only consulted when a request explicitly asks for them, and always after
    /// every regular source.
    #[serde(default)]
    pub is_try: bool,
}

/// Configuration for an external source.
///
/// Sources provide the symbol files of modules. Their configuration is a combination of the
/// location of the source plus anything needed to access it.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Local file system.
    Filesystem(Arc<FilesystemSourceConfig>),
    /// Symbol server reachable via HTTP, using the breakpad directory layout.
    Http(Arc<HttpSourceConfig>),
}

impl SourceConfig {
    /// The unique identifier of this source.
    pub fn id(&self) -> &SourceId {
        match self {
            Self::Filesystem(x) => &x.id,
            Self::Http(x) => &x.id,
        }
    }

    /// The type of this source as a static string.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Filesystem(..) => "filesystem",
            Self::Http(..) => "http",
        }
    }

    pub fn files(&self) -> &CommonSourceConfig {
        match self {
            Self::Filesystem(x) => &x.files,
            Self::Http(x) => &x.files,
        }
    }

    pub fn is_try(&self) -> bool {
        self.files().is_try
    }

    /// Returns the [`RemoteFile`] holding the symbols of the given module on this source.
    pub fn remote_file(&self, key: &ModuleKey) -> RemoteFile {
        let location = key.symbol_location();
        match self {
            Self::Filesystem(source) => FilesystemRemoteFile::new(source.clone(), location).into(),
            Self::Http(source) => HttpRemoteFile::new(source.clone(), location).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        let yaml = r#"
- id: mozilla
  type: http
  url: https://symbols.example.com/
  headers:
    Authorization: token
- id: try
  type: http
  url: https://try.example.com/symbols
  is_try: true
- id: local
  type: filesystem
  path: /srv/symbols
"#;
        let sources: Vec<SourceConfig> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sources.len(), 3);

        assert_eq!(sources[0].id().as_str(), "mozilla");
        assert_eq!(sources[0].type_name(), "http");
        assert!(!sources[0].is_try());
        match &sources[0] {
            SourceConfig::Http(http) => {
                assert_eq!(http.headers["Authorization"], "token");
            }
            other => panic!("unexpected source {other:?}"),
        }

        assert!(sources[1].is_try());
        assert_eq!(sources[2].type_name(), "filesystem");
        assert!(!sources[2].is_try());
    }

    #[test]
    fn test_unknown_type() {
        let yaml = "- {id: bucket, type: s3, bucket: symbols}";
        assert!(serde_yaml::from_str::<Vec<SourceConfig>>(yaml).is_err());
    }
}
