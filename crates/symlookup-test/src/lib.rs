//! Helpers for testing the lookup service and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Dropping it deletes the directory, and with it the cache.
//!
//!  - When using [`SymbolServer`], make sure that the server is held until all requests to it
//!    have been made. The server stops serving when it is dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract;
use axum::routing::get;
use axum::{Router, middleware};
use reqwest::{StatusCode, Url};
use tower_http::services::ServeDir;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use symlookup_sources::{
    CommonSourceConfig, FilesystemSourceConfig, HttpSourceConfig, SourceConfig, SourceId,
};

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: the logger only captures logs from the symlookup crates and mutes all other
/// logs (such as hyper or symbolic).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "symlookup_service=trace,symlookup_sources=trace,symlookup=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates an HTTP source with the given base URL.
pub fn http_source(id: &str, url: Url, is_try: bool) -> SourceConfig {
    SourceConfig::Http(Arc::new(HttpSourceConfig {
        id: SourceId::new(id),
        url,
        headers: Default::default(),
        files: CommonSourceConfig { is_try },
    }))
}

/// Creates a source reading symbol files from a local directory.
pub fn filesystem_source(id: &str, path: &Path, is_try: bool) -> SourceConfig {
    SourceConfig::Filesystem(Arc::new(FilesystemSourceConfig {
        id: SourceId::new(id),
        path: path.to_owned(),
        files: CommonSourceConfig { is_try },
    }))
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves the given router on an ephemeral port of localhost.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A symbol server that counts the requests it receives.
///
/// Files added with [`add_file`](Self::add_file) are served below `/symbols/`. In addition, the
/// server has these routes:
///
///  - `/respond_statuscode/:num/*tail` always answers with the given status code.
///  - `/delay/:time/*path` waits for the given `humantime` duration and then redirects to `/path`.
pub struct SymbolServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    root: TempDir,
}

impl SymbolServer {
    pub fn new() -> Self {
        let root = tempdir();
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .nest_service("/symbols", ServeDir::new(root.path()))
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits, root }
    }

    /// Serves `contents` at `/symbols/{path}`.
    pub fn add_file(&self, path: &str, contents: impl AsRef<[u8]>) {
        let full_path = self.root.path().join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full_path, contents).unwrap();
    }

    /// Returns the number of requests to the given path, e.g. `/symbols/a.pdb/ABC/a.sym`.
    pub fn hits(&self, path: &str) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }

    /// Returns the total number of requests and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// A source pointing at `path` on this server, e.g. `symbols/`.
    pub fn source(&self, id: &str, path: &str, is_try: bool) -> SourceConfig {
        http_source(id, self.url(path), is_try)
    }
}

impl Default for SymbolServer {
    fn default() -> Self {
        Self::new()
    }
}
