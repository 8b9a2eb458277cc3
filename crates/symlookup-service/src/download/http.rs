//! Support to download from HTTP symbol servers.

use futures::TryStreamExt;
use reqwest::{Client, StatusCode, header};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use symlookup_sources::HttpRemoteFile;

use crate::caching::{CacheEntry, CacheError};
use crate::utils::http::DownloadTimeouts;

use super::USER_AGENT;

/// Downloader implementation that supports the HTTP source.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
    timeouts: DownloadTimeouts,
}

impl HttpDownloader {
    pub fn new(client: Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }

    /// Downloads a symbol file hosted on an HTTP server.
    pub async fn download_source(
        &self,
        file_source: &HttpRemoteFile,
        destination: &mut File,
    ) -> CacheEntry {
        let download_url = file_source.url().map_err(|_| CacheError::NotFound)?;

        tracing::debug!("Fetching symbol file from `{}`", download_url);

        let mut builder = self.client.get(download_url.clone());
        for (key, value) in &file_source.source.headers {
            if let Ok(key) = header::HeaderName::from_bytes(key.as_bytes()) {
                builder = builder.header(key, value.as_str());
            }
        }
        builder = builder.header(header::USER_AGENT, USER_AGENT);

        let response = tokio::time::timeout(self.timeouts.head, builder.send())
            .await
            .map_err(|_| CacheError::Timeout(self.timeouts.head))??;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(download_url.as_str(), status));
        }

        tracing::trace!("Success hitting `{download_url}`");
        let mut stream = response.bytes_stream().map_err(CacheError::from);
        while let Some(chunk) = stream.try_next().await? {
            destination.write_all(&chunk).await?;
        }
        destination.flush().await?;

        Ok(())
    }
}

/// Infers the [`CacheError`] from the status code of an unsuccessful response.
fn status_error(source: &str, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{source}`: {status}");
        CacheError::PermissionDenied(status.to_string())
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        tracing::debug!("Symbol file not found at `{source}`: {status}");
        CacheError::NotFound
    } else {
        // Includes 408 and 429, which are transient and must be retried.
        tracing::debug!("Unexpected status code from `{source}`: {status}");
        CacheError::DownloadError(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use symlookup_sources::{SourceConfig, SourceLocation};
    use symlookup_test::{self as test, SymbolServer};

    use super::*;

    fn remote_file(source: SourceConfig, location: &str) -> HttpRemoteFile {
        match source {
            SourceConfig::Http(source) => HttpRemoteFile::new(source, SourceLocation::new(location)),
            _ => panic!("unexpected source"),
        }
    }

    async fn download(
        timeouts: DownloadTimeouts,
        file_source: &HttpRemoteFile,
    ) -> (CacheEntry, tempfile::NamedTempFile) {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let mut destination = File::create(tmpfile.path()).await.unwrap();

        let downloader = HttpDownloader::new(Client::new(), timeouts);
        let result = downloader
            .download_source(file_source, &mut destination)
            .await;
        (result, tmpfile)
    }

    #[tokio::test]
    async fn test_download_source() {
        test::setup();

        let server = SymbolServer::new();
        server.add_file("hello.txt", "hello world\n");
        let file_source = remote_file(server.source("local", "symbols/", false), "hello.txt");

        let (result, tmpfile) = download(Default::default(), &file_source).await;

        assert_eq!(result, Ok(()));
        let content = std::fs::read_to_string(tmpfile.path()).unwrap();
        assert_eq!(content, "hello world\n");
    }

    #[tokio::test]
    async fn test_download_source_missing() {
        test::setup();

        let server = SymbolServer::new();
        let file_source = remote_file(server.source("local", "symbols/", false), "i-do-not-exist");

        let (result, _) = download(Default::default(), &file_source).await;
        assert_eq!(result, Err(CacheError::NotFound));
    }

    #[tokio::test]
    async fn test_download_status_codes() {
        test::setup();

        let server = SymbolServer::new();

        let source = server.source("local", "respond_statuscode/403/", false);
        let (result, _) = download(Default::default(), &remote_file(source, "x.sym")).await;
        assert_eq!(
            result,
            Err(CacheError::PermissionDenied("403 Forbidden".into()))
        );

        let source = server.source("local", "respond_statuscode/503/", false);
        let (result, _) = download(Default::default(), &remote_file(source, "x.sym")).await;
        assert_eq!(
            result,
            Err(CacheError::DownloadError("503 Service Unavailable".into()))
        );

        let source = server.source("local", "respond_statuscode/429/", false);
        let (result, _) = download(Default::default(), &remote_file(source, "x.sym")).await;
        assert_eq!(
            result,
            Err(CacheError::DownloadError("429 Too Many Requests".into()))
        );

        let source = server.source("local", "respond_statuscode/410/", false);
        let (result, _) = download(Default::default(), &remote_file(source, "x.sym")).await;
        assert_eq!(result, Err(CacheError::NotFound));
    }

    #[tokio::test]
    async fn test_download_head_timeout() {
        test::setup();

        let server = SymbolServer::new();
        server.add_file("hello.txt", "hello world\n");
        let source = server.source("local", "delay/1h/symbols/", false);

        let timeouts = DownloadTimeouts {
            head: Duration::from_millis(100),
            ..Default::default()
        };
        let (result, _) = download(timeouts, &remote_file(source, "hello.txt")).await;
        assert_eq!(result, Err(CacheError::Timeout(Duration::from_millis(100))));
    }
}
