use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Various timeouts for all the downloaders.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response headers.
    pub head: Duration,
    /// Global timeout for one download attempt.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        let config = Config::default();
        Self::from_config(&config)
    }
}

/// Creates the HTTP client used for all symbol downloads.
///
/// Redirects are followed up to a small limit, symbol servers commonly redirect to a CDN or an
/// object store.
pub fn create_client(timeouts: &DownloadTimeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}
