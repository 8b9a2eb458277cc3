//! Service which handles all downloading of symbol files.
//!
//! A single file is downloaded with [`DownloadService::download`], which applies the configured
//! timeouts and retries transient failures. [`DownloadService::fetch_first`] walks the candidates
//! of a module in order and stops at the first source that has the file.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Future;
use rand::Rng;

use symlookup_sources::RemoteFile;

use crate::caching::{CacheEntry, CacheError};
use crate::config::Config;
use crate::utils::http::{DownloadTimeouts, create_client};

mod filesystem;
mod http;

pub use self::filesystem::FilesystemDownloader;
pub use self::http::HttpDownloader;

/// The user agent sent to HTTP symbol servers.
pub const USER_AGENT: &str = concat!("symlookup/", env!("CARGO_PKG_VERSION"));

impl CacheError {
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

fn source_type(source: &RemoteFile) -> &'static str {
    match source {
        RemoteFile::Filesystem(_) => "filesystem",
        RemoteFile::Http(_) => "http",
    }
}

fn status_tag<T>(result: &CacheEntry<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(err) => err.as_str(),
    }
}

/// A service which can download symbol files from a [`RemoteFile`].
#[derive(Debug)]
pub struct DownloadService {
    timeouts: DownloadTimeouts,
    attempts: u32,
    backoff: Duration,
    http: HttpDownloader,
    fs: FilesystemDownloader,
}

impl DownloadService {
    pub fn new(config: &Config) -> reqwest::Result<Arc<Self>> {
        let timeouts = DownloadTimeouts::from_config(config);
        let client = create_client(&timeouts)?;

        Ok(Arc::new(Self {
            timeouts,
            attempts: config.fetch_retries.max(1),
            backoff: config.retry_backoff,
            http: HttpDownloader::new(client, timeouts),
            fs: FilesystemDownloader::new(),
        }))
    }

    /// Dispatches downloading of the given file to the appropriate downloader.
    async fn dispatch_download(&self, source: &RemoteFile, destination: &Path) -> CacheEntry {
        // The file is truncated, a previous attempt may have written part of it.
        let mut destination = tokio::fs::File::create(destination).await?;
        match source {
            RemoteFile::Http(source) => self.http.download_source(source, &mut destination).await,
            RemoteFile::Filesystem(source) => {
                self.fs.download_source(source, &mut destination).await
            }
        }
    }

    /// A single download attempt, bounded by `max_download_timeout`.
    async fn download_once(&self, source: &RemoteFile, destination: &Path) -> CacheEntry {
        let timeout = self.timeouts.max_download;
        let result = match tokio::time::timeout(timeout, self.dispatch_download(source, destination))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        metric!(
            counter("download.attempt") += 1,
            "source" => source_type(source),
            "status" => status_tag(&result),
        );
        result
    }

    /// Downloads a file from a source and stores it at `destination`.
    ///
    /// Transient failures are retried up to `fetch_retries` times in total. A `NotFound` or
    /// `PermissionDenied` answer is authoritative and returned right away.
    ///
    /// In case of any error, the contents of `destination` are considered garbage.
    pub async fn download(&self, source: &RemoteFile, destination: &Path) -> CacheEntry {
        let start = Instant::now();
        let result = retry(self.attempts, self.backoff, || {
            self.download_once(source, destination)
        })
        .await;

        metric!(
            timer("download.duration") = start.elapsed(),
            "source" => source_type(source),
            "status" => status_tag(&result),
        );

        match &result {
            Ok(()) => tracing::debug!("File `{}` fetched successfully", source),
            Err(err) => tracing::debug!("File `{}` fetching failed: {}", source, err),
        }

        result
    }

    /// Downloads the first of `candidates` that exists into `destination`.
    ///
    /// Candidates are tried strictly in order. Returns the file that was downloaded. If no
    /// candidate has the file, the result is [`CacheError::NotFound`], unless some candidate
    /// failed for another reason, in which case the first such error is returned. That way a
    /// flaky source does not lead to a long-lived "not found" entry.
    pub async fn fetch_first(
        &self,
        candidates: &[RemoteFile],
        destination: &Path,
    ) -> CacheEntry<RemoteFile> {
        let mut failure = None;

        for candidate in candidates {
            match self.download(candidate, destination).await {
                Ok(()) => return Ok(candidate.clone()),
                Err(CacheError::NotFound) => {}
                Err(CacheError::InternalError) => return Err(CacheError::InternalError),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        Err(failure.unwrap_or(CacheError::NotFound))
    }
}

/// Runs a future up to `attempts` times, with exponential backoff between attempts.
///
/// Only [retryable](CacheError::is_retryable) errors are retried. Each delay doubles the previous
/// one and adds up to 50% random jitter.
pub async fn retry<G, F, T>(attempts: u32, backoff: Duration, task_gen: G) -> CacheEntry<T>
where
    G: Fn() -> F,
    F: Future<Output = CacheEntry<T>>,
{
    let mut tries = 0;
    let mut delay = backoff;
    loop {
        tries += 1;
        let result = task_gen().await;

        let should_retry = matches!(&result, Err(err) if err.is_retryable());
        if !should_retry || tries >= attempts {
            break result;
        }

        let jitter_ms = rand::rng().random_range(0..=delay.as_millis() as u64 / 2);
        tracing::trace!(tries, ?delay, "Retrying failed download");
        tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
        delay = delay.saturating_mul(2);
    }
}
