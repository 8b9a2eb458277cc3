//! Fetching lookup tables of modules through the shared cache.
//!
//! The [`SymCacheActor`] is the only way lookup workers get at a [`LookupTable`]. Within one
//! process it coalesces concurrent requests for the same [`CacheKey`] with an in-memory cache,
//! across processes the [`SymbolStore`] makes sure only one worker fetches and converts a module,
//! while all others poll its pending entry.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use symlookup_sources::{RemoteFile, SourceResolver};
use tempfile::NamedTempFile;

use crate::caching::{
    CacheEntry, CacheError, CacheKey, Completion, Lookup, Outcome, PendingOwner, SymbolStore,
};
use crate::convert::{Converter, LookupTable};
use crate::download::DownloadService;
use crate::utils::defer::defer;

/// Where the result of a module fetch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// The table was already loaded in this process.
    Memory,
    /// The table was loaded from the shared cache.
    File,
    /// This request fetched and converted the symbol file.
    Computed,
    /// Another worker fetched and converted the symbol file while this request waited.
    Waited,
    /// A cached negative result was returned.
    Negative,
    /// The module could not be resolved because of a local problem.
    Error,
}

/// The outcome of fetching the lookup table of a module.
#[derive(Clone)]
pub struct SymCacheFetch {
    pub table: CacheEntry<Arc<dyn LookupTable>>,
    pub status: CacheStatus,
    /// URI of the symbol file the table was converted from.
    pub source: Option<String>,
    /// Size of the converted artifact.
    pub size: Option<u64>,
    pub download_time: Option<Duration>,
    pub convert_time: Option<Duration>,
    /// Until when a negative result is remembered.
    pub expires_at: Option<SystemTime>,
}

impl std::fmt::Debug for SymCacheFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymCacheFetch")
            .field("found", &self.table.is_ok())
            .field("error", &self.table.as_ref().err())
            .field("status", &self.status)
            .field("source", &self.source)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl SymCacheFetch {
    fn new(table: CacheEntry<Arc<dyn LookupTable>>, status: CacheStatus) -> Self {
        Self {
            table,
            status,
            source: None,
            size: None,
            download_time: None,
            convert_time: None,
            expires_at: None,
        }
    }
}

/// A failure of the shared cache itself, as opposed to a failure of one module.
pub type StoreError = Arc<io::Error>;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When to evict this item from the in-memory cache.
    deadline: Instant,
    data: Result<SymCacheFetch, StoreError>,
}

type InMemoryCache = moka::future::Cache<CacheKey, InMemoryItem>;

/// A [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the explicit expiration time.
struct CacheExpiration;

fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<CacheKey, InMemoryItem> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// Loads, fetches and converts lookup tables.
#[derive(Clone)]
pub struct SymCacheActor {
    store: Arc<SymbolStore>,
    resolver: SourceResolver,
    downloader: Arc<DownloadService>,
    converter: Converter,
    cache: InMemoryCache,
}

impl std::fmt::Debug for SymCacheActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymCacheActor")
            .field("store", &self.store)
            .field("in-memory items", &self.cache.entry_count())
            .finish()
    }
}

impl SymCacheActor {
    pub fn new(
        store: Arc<SymbolStore>,
        resolver: SourceResolver,
        downloader: Arc<DownloadService>,
        converter: Converter,
    ) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(store.config().in_memory_capacity)
            .name("symcaches")
            .expire_after(CacheExpiration)
            .build();

        Self {
            store,
            resolver,
            downloader,
            converter,
            cache,
        }
    }

    pub fn store(&self) -> &Arc<SymbolStore> {
        &self.store
    }

    /// Returns the lookup table for `key`, fetching and converting it if necessary.
    ///
    /// Failures to resolve the module are part of the returned [`SymCacheFetch`]. Only problems
    /// with the cache directory itself are returned as an error.
    pub async fn fetch(&self, key: &CacheKey) -> Result<SymCacheFetch, StoreError> {
        metric!(counter("caches.access") += 1);

        let entry = self
            .cache
            .entry_by_ref(key)
            .or_insert_with(self.lookup_or_compute(key.clone()))
            .await;

        if entry.is_fresh() {
            return entry.into_value().data;
        }

        metric!(counter("caches.memory.hit") += 1);
        let mut fetch = entry.into_value().data?;
        fetch.status = CacheStatus::Memory;
        if fetch.table.is_ok() {
            let k = key.clone();
            if !self.blocking(move |store| store.touch(&k)).await? {
                // Evicted from the shared cache. The table stays valid for this request, the next
                // one goes through the store again.
                tracing::debug!(key = %key, "Dropping in-memory table of evicted cache entry");
                self.cache.invalidate(key).await;
            }
        }
        Ok(fetch)
    }

    async fn lookup_or_compute(&self, key: CacheKey) -> InMemoryItem {
        let data = self.resolve(&key).await.map_err(|err| {
            tracing::error!(
                key = %key,
                error = &err as &dyn std::error::Error,
                "Symbol cache unavailable"
            );
            Arc::new(err)
        });

        let now = Instant::now();
        let deadline = match &data {
            Ok(SymCacheFetch { table: Ok(_), .. }) => now + self.store.config().in_memory_ttl,
            Ok(SymCacheFetch {
                expires_at: Some(expires_at),
                ..
            }) => {
                let remaining = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                now + remaining
            }
            _ => now,
        };

        InMemoryItem { deadline, data }
    }

    /// Resolves `key` through the shared cache.
    async fn resolve(&self, key: &CacheKey) -> io::Result<SymCacheFetch> {
        let poll_interval = self.store.config().pending_poll_interval;
        let mut waited: Option<Instant> = None;
        let mut load_failures = 0;

        loop {
            let k = key.clone();
            let lookup = self.blocking(move |store| store.get_or_create(&k)).await?;

            match lookup {
                Lookup::Ready(entry) => {
                    let converter = self.converter.clone();
                    let path = entry.path.clone();
                    let loaded = tokio::task::spawn_blocking(move || converter.load(&path))
                        .await
                        .map_err(io::Error::other)?;

                    match loaded {
                        Ok(table) => {
                            metric!(counter("caches.file.hit") += 1);
                            let status = match waited {
                                Some(start) => {
                                    metric!(timer("caches.pending.wait") = start.elapsed());
                                    CacheStatus::Waited
                                }
                                None => CacheStatus::File,
                            };
                            let mut fetch = SymCacheFetch::new(Ok(table), status);
                            fetch.source = entry.source;
                            fetch.size = Some(entry.size);
                            return Ok(fetch);
                        }
                        Err(err) => {
                            tracing::warn!(
                                key = %key,
                                error = &err as &dyn std::error::Error,
                                "Failed to load cached symbols"
                            );
                            let artifact = entry.artifact;
                            let k = key.clone();
                            self.blocking(move |store| store.invalidate(&k, &artifact))
                                .await?;

                            load_failures += 1;
                            if load_failures >= 2 {
                                return Ok(SymCacheFetch::new(
                                    Err(CacheError::InternalError),
                                    CacheStatus::Error,
                                ));
                            }
                        }
                    }
                }
                Lookup::Negative(error, expires_at) => {
                    metric!(counter("caches.negative.hit") += 1, "reason" => error.as_str());
                    let mut fetch = SymCacheFetch::new(Err(error), CacheStatus::Negative);
                    fetch.expires_at = Some(expires_at);
                    return Ok(fetch);
                }
                Lookup::Pending => {
                    if waited.is_none() {
                        tracing::trace!(key = %key, "Waiting for pending cache entry");
                        waited = Some(Instant::now());
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Lookup::Owned(owner) => return self.compute_owned(owner).await,
            }
        }
    }

    /// Fetches and converts the symbols of an entry this worker owns, and completes the entry.
    ///
    /// If this future is dropped before completing, the entry is abandoned so other workers can
    /// take over right away.
    async fn compute_owned(&self, owner: PendingOwner) -> io::Result<SymCacheFetch> {
        metric!(counter("caches.computation") += 1);
        tracing::debug!(key = %owner.key(), "Computing symbol cache");

        let abandon_guard = {
            let store = self.store.clone();
            let owner = owner.clone();
            defer(move || abandon_in_background(store, owner))
        };

        let mut fetch = SymCacheFetch::new(Err(CacheError::InternalError), CacheStatus::Computed);
        let computed = {
            let compute = self.compute(owner.key(), &mut fetch);
            tokio::pin!(compute);

            // Keeps other workers from reclaiming the entry while fetching takes long.
            let period = (self.store.config().max_pending_age / 4).max(Duration::from_millis(10));
            let start = tokio::time::Instant::now() + period;
            let mut heartbeat = tokio::time::interval_at(start, period);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    computed = &mut compute => break computed,
                    _ = heartbeat.tick() => self.heartbeat(&owner).await,
                }
            }
        };

        let (outcome, table) = match computed {
            Ok((artifact, table, source)) => (
                Outcome::Ready {
                    artifact,
                    source: Some(source.uri()),
                },
                Ok(table),
            ),
            Err(CacheError::InternalError) => {
                abandon_guard.disarm();
                self.blocking(move |store| store.abandon(&owner)).await?;
                fetch.status = CacheStatus::Error;
                return Ok(fetch);
            }
            Err(error) => {
                metric!(counter("caches.computation.failed") += 1, "reason" => error.as_str());
                (Outcome::Failed(error.clone()), Err(error))
            }
        };

        let owner_ref = owner.clone();
        let completion = self
            .blocking(move |store| store.complete(&owner_ref, outcome))
            .await?;
        abandon_guard.disarm();

        match completion {
            Completion::Ready(entry) => {
                fetch.table = table;
                fetch.source = entry.source;
                fetch.size = Some(entry.size);
            }
            Completion::Negative(error, expires_at) => {
                fetch.table = Err(error);
                fetch.expires_at = Some(expires_at);
            }
            Completion::Abandoned => {
                fetch.table = Err(CacheError::InternalError);
                fetch.status = CacheStatus::Error;
            }
            Completion::Superseded => {
                // Only the requests coalesced in this process get to see this result.
                fetch.table = table;
            }
        }

        Ok(fetch)
    }

    async fn compute(
        &self,
        key: &CacheKey,
        fetch: &mut SymCacheFetch,
    ) -> CacheEntry<(NamedTempFile, Arc<dyn LookupTable>, RemoteFile)> {
        let candidates = self.resolver.resolve(key.module(), key.include_try());
        if candidates.is_empty() {
            tracing::debug!(key = %key, "No sources configured for module");
            return Err(CacheError::NotFound);
        }

        let download = self.store.tempfile()?;
        let start = Instant::now();
        let source = self
            .downloader
            .fetch_first(&candidates, download.path())
            .await;
        fetch.download_time = Some(start.elapsed());
        let source = source?;
        fetch.source = Some(source.uri());

        let artifact = self.store.tempfile()?;
        let start = Instant::now();
        let converted = self.converter.convert(download, artifact).await;
        fetch.convert_time = Some(start.elapsed());
        metric!(timer("caches.conversion.duration") = start.elapsed());
        let (artifact, table) = converted?;

        Ok((artifact, table, source))
    }

    async fn heartbeat(&self, owner: &PendingOwner) {
        let key = owner.key().clone();
        let owner = owner.clone();
        match self.blocking(move |store| store.heartbeat(&owner)).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %key, "Pending cache entry was taken over"),
            Err(err) => tracing::error!(
                key = %key,
                error = &err as &dyn std::error::Error,
                "Failed to refresh pending cache entry"
            ),
        }
    }

    /// Runs a store operation on the blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> io::Result<T>
    where
        F: FnOnce(&SymbolStore) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(io::Error::other)?
    }
}

fn abandon_in_background(store: Arc<SymbolStore>, owner: PendingOwner) {
    tracing::debug!(key = %owner.key(), "Computation dropped, abandoning cache entry");
    let abandon = move || {
        if let Err(err) = store.abandon(&owner) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "Failed to abandon cache entry"
            );
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(abandon);
        }
        Err(_) => abandon(),
    }
}
