use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{FilesystemRemoteFile, HttpRemoteFile, SourceId};

/// A location of a file on a symbol source.
///
/// It is essentially a `/`-separated relative path, valid on every source type.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SourceLocation(String);

impl SourceLocation {
    /// Creates a new [`SourceLocation`].
    pub fn new(loc: impl Into<String>) -> Self {
        SourceLocation(loc.into())
    }

    /// Return an iterator of the location segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Returns this location as a local (relative) Path.
    pub fn path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Returns this location joined to the given base URL.
    ///
    /// Each segment of the path is percent-encoded and empty segments are skipped. The base URL is
    /// treated as a directory, even if it does not end with a slash.
    ///
    /// Returns `Err` if the URL is cannot-be-a-base.
    pub fn to_url(&self, base: &Url) -> anyhow::Result<Url> {
        let mut joined = base.clone();
        joined
            .path_segments_mut()
            .map_err(|_| anyhow::Error::msg("URL cannot-be-a-base"))?
            .pop_if_empty()
            .extend(self.segments());
        Ok(joined)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single symbol file stored on a source.
#[derive(Debug, Clone)]
pub enum RemoteFile {
    /// A file on the local file system.
    Filesystem(FilesystemRemoteFile),
    /// A file on an HTTP symbol server.
    Http(HttpRemoteFile),
}

impl RemoteFile {
    /// The identifier of the source holding this file.
    pub fn source_id(&self) -> &SourceId {
        match self {
            Self::Filesystem(x) => &x.source.id,
            Self::Http(x) => &x.source.id,
        }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            Self::Filesystem(x) => &x.location,
            Self::Http(x) => &x.location,
        }
    }

    pub fn is_try(&self) -> bool {
        match self {
            Self::Filesystem(x) => x.source.files.is_try,
            Self::Http(x) => x.source.files.is_try,
        }
    }

    /// Returns a URI for this file, suitable for logging and diagnostics.
    ///
    /// Filesystem files are rendered as `file://` URIs without percent-encoding.
    pub fn uri(&self) -> String {
        match self {
            Self::Filesystem(x) => format!("file://{}", x.path().display()),
            Self::Http(x) => match x.url() {
                Ok(url) => url.into(),
                Err(_) => String::new(),
            },
        }
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uri(), self.source_id())
    }
}
