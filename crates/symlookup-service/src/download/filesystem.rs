//! Support to download from the local filesystem.
//!
//! It allows sources to be present on the local filesystem, mostly used for testing and for
//! symbol stores mounted over the network.

use std::io;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use symlookup_sources::FilesystemRemoteFile;

use crate::caching::{CacheEntry, CacheError};

/// Downloader implementation that supports the filesystem source.
#[derive(Debug, Default)]
pub struct FilesystemDownloader {}

impl FilesystemDownloader {
    pub fn new() -> Self {
        Self {}
    }

    /// Copies a symbol file from a filesystem source.
    pub async fn download_source(
        &self,
        file_source: &FilesystemRemoteFile,
        destination: &mut File,
    ) -> CacheEntry {
        let path = file_source.path();
        tracing::debug!("Fetching symbol file from {:?}", path);

        let mut file = File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::PermissionDenied => CacheError::PermissionDenied(e.to_string()),
            _ => e.into(),
        })?;
        tokio::io::copy(&mut file, destination).await?;
        destination.flush().await?;
        Ok(())
    }
}
