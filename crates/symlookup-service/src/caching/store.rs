use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::CacheConfig;

use super::fs::{self, IndexLock};
use super::metadata::{EntryMetadata, EntryState};
use super::{CacheError, CacheKey};

const METADATA_EXTENSION: &str = "meta";
const ARTIFACT_EXTENSION: &str = "symc";

/// The cache directory name of converted symbol files.
pub const SYMCACHES_DIR: &str = "symcaches";

/// The shared on-disk symbol cache.
///
/// Many worker processes and one eviction process operate on the same directory concurrently. All
/// coordination state is persisted: each entry is a metadata document (see [`EntryMetadata`])
/// plus, once ready, an immutable artifact file next to it. Every read-modify-write of metadata
/// happens under a single advisory lock ([`IndexLock`]) and every file is written to a temporary
/// location first and then atomically renamed into place.
///
/// All methods block on file system I/O and should be called from a blocking context.
#[derive(Debug)]
pub struct SymbolStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    lock_path: PathBuf,
    config: CacheConfig,
}

/// A ready entry returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEntry {
    /// Absolute path of the artifact.
    pub path: PathBuf,
    /// File name of the artifact, identifies this generation of the entry.
    pub artifact: String,
    pub size: u64,
    /// URI of the symbol file the artifact was converted from.
    pub source: Option<String>,
}

/// The right to compute a pending entry.
///
/// Handed out by [`SymbolStore::get_or_create`] to exactly one caller per key. The holder must
/// eventually call [`SymbolStore::complete`] or [`SymbolStore::abandon`], otherwise the entry is
/// only released after `max_pending_age`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOwner {
    key: CacheKey,
    token: Uuid,
}

impl PendingOwner {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// The result of [`SymbolStore::get_or_create`].
#[derive(Debug)]
pub enum Lookup {
    /// The entry is ready, its `last_access` was bumped.
    Ready(ReadyEntry),
    /// Another caller is computing the entry. Check again later.
    Pending,
    /// The caller now owns the computation of this entry.
    Owned(PendingOwner),
    /// A negative result that has not expired yet.
    Negative(CacheError, SystemTime),
}

/// The outcome of a computation, see [`SymbolStore::complete`].
#[derive(Debug)]
pub enum Outcome {
    /// The converted artifact, fully written to a temporary file created by
    /// [`SymbolStore::tempfile`].
    Ready {
        artifact: NamedTempFile,
        source: Option<String>,
    },
    /// The computation failed.
    Failed(CacheError),
}

/// The result of [`SymbolStore::complete`].
#[derive(Debug)]
pub enum Completion {
    /// The artifact was registered.
    Ready(ReadyEntry),
    /// The error was registered until the given time.
    Negative(CacheError, SystemTime),
    /// The entry was released without a result, the next caller computes it again.
    Abandoned,
    /// The pending entry was reclaimed by another owner in the meantime, the outcome was
    /// discarded.
    Superseded,
}

/// Result of [`SymbolStore::evict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// The entry was removed, freeing the given number of bytes.
    Evicted(u64),
    /// The entry was read after the snapshot was taken and was kept.
    Recent,
    /// The entry is no longer ready or does not exist anymore.
    Gone,
}

/// One entry as seen by [`SymbolStore::scan`].
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub key: CacheKey,
    pub metadata: EntryMetadata,
}

/// A snapshot of the whole store.
///
/// Each entry is individually consistent, the snapshot as a whole is not: other processes keep
/// modifying the store while it is being read. Operations that act on a snapshot re-validate
/// every entry under the lock.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// Time at which the scan started.
    pub time: SystemTime,
    pub entries: Vec<ScannedEntry>,
    /// Files that are neither metadata nor the lock, along with their modification time.
    pub other_files: Vec<(PathBuf, SystemTime)>,
}

/// A ready entry as listed by [`SymbolStore::list_ready_by_lru`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruEntry {
    pub key: CacheKey,
    pub size: u64,
    pub last_access: SystemTime,
}

impl StoreSnapshot {
    /// Returns all ready entries, least recently used first.
    pub fn ready_by_lru(&self) -> Vec<LruEntry> {
        let mut ready: Vec<_> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.metadata.state {
                EntryState::Ready { size, .. } => Some(LruEntry {
                    key: entry.key.clone(),
                    size,
                    last_access: entry.metadata.last_access,
                }),
                _ => None,
            })
            .collect();
        ready.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.key.cache_path().cmp(&b.key.cache_path()))
        });
        ready
    }
}

impl SymbolStore {
    /// Opens the store below `cache_dir`, creating its directories if needed.
    pub fn open(cache_dir: &Path, config: CacheConfig) -> io::Result<Self> {
        let root = cache_dir.join(SYMCACHES_DIR);
        let tmp_dir = cache_dir.join("tmp");
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            lock_path: root.join(".lock"),
            root,
            tmp_dir,
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Create a new temporary file to write a download or an artifact to.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        fs::tempfile_in(&self.tmp_dir)
    }

    fn lock(&self) -> io::Result<IndexLock> {
        IndexLock::acquire(&self.lock_path)
    }

    fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.root.join(key.cache_path());
        path.set_extension(METADATA_EXTENSION);
        path
    }

    fn artifact_path(&self, key: &CacheKey, artifact: &str) -> PathBuf {
        self.metadata_path(key).with_file_name(artifact)
    }

    fn ready_entry(&self, key: &CacheKey, metadata: &EntryMetadata) -> Option<ReadyEntry> {
        match &metadata.state {
            EntryState::Ready {
                artifact,
                size,
                source,
            } => Some(ReadyEntry {
                path: self.artifact_path(key, artifact),
                artifact: artifact.clone(),
                size: *size,
                source: source.clone(),
            }),
            _ => None,
        }
    }

    /// Looks up `key`, or makes the caller responsible for computing it.
    ///
    /// - A ready entry is returned and its `last_access` is bumped. If its artifact has
    ///   disappeared, the entry is treated as absent.
    /// - A pending entry whose owner showed a sign of life within `max_pending_age` yields
    ///   [`Lookup::Pending`]. Otherwise it is reclaimed from its presumably dead owner.
    /// - A negative entry is returned until it expires.
    /// - Otherwise a new pending entry is created and the caller becomes its owner.
    pub fn get_or_create(&self, key: &CacheKey) -> io::Result<Lookup> {
        self.get_or_create_at(key, SystemTime::now())
    }

    pub(crate) fn get_or_create_at(&self, key: &CacheKey, now: SystemTime) -> io::Result<Lookup> {
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        let Some(mut metadata) = EntryMetadata::read(&path)? else {
            return self.create_pending(key, &path, now);
        };

        if let Some(entry) = self.ready_entry(key, &metadata) {
            if !entry.path.is_file() {
                tracing::warn!(key = %key, path = %entry.path.display(), "Cache artifact is missing");
                metric!(counter("caches.corrupt") += 1, "reason" => "missing");
                return self.create_pending(key, &path, now);
            }

            metadata.touch(now);
            metadata.write_unsynced(&path)?;
            return Ok(Lookup::Ready(entry));
        }

        if let Some((info, since)) = metadata.pending_since() {
            let age = now.duration_since(since).unwrap_or_default();
            if age < self.config.max_pending_age {
                return Ok(Lookup::Pending);
            }

            tracing::warn!(
                key = %key,
                owner = %info.owner,
                pid = info.pid,
                hostname = info.hostname.as_deref().unwrap_or("unknown"),
                age = ?age,
                "Reclaiming abandoned cache computation"
            );
            metric!(counter("caches.pending.reclaimed") += 1);
            return self.create_pending(key, &path, now);
        }

        match metadata.live_negative(now) {
            Some((error, expires_at)) => Ok(Lookup::Negative(error, expires_at)),
            None => self.create_pending(key, &path, now),
        }
    }

    fn create_pending(&self, key: &CacheKey, path: &Path, now: SystemTime) -> io::Result<Lookup> {
        let token = Uuid::new_v4();
        EntryMetadata::pending(key, token, now).write(path)?;
        tracing::trace!(key = %key, owner = %token, "Created pending cache entry");

        Ok(Lookup::Owned(PendingOwner {
            key: key.clone(),
            token,
        }))
    }

    /// Resolves a pending entry owned by `owner`.
    ///
    /// If the entry was reclaimed by somebody else in the meantime, nothing is changed and the
    /// outcome is discarded. A [`CacheError::InternalError`] is never persisted, the entry is
    /// released instead.
    pub fn complete(&self, owner: &PendingOwner, outcome: Outcome) -> io::Result<Completion> {
        self.complete_at(owner, outcome, SystemTime::now())
    }

    pub(crate) fn complete_at(
        &self,
        owner: &PendingOwner,
        outcome: Outcome,
        now: SystemTime,
    ) -> io::Result<Completion> {
        let key = &owner.key;
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        let Some(mut metadata) = EntryMetadata::read(&path)? else {
            tracing::warn!(key = %key, "Discarding result, pending cache entry vanished");
            return Ok(Completion::Superseded);
        };
        if !metadata.is_pending_for(owner.token) {
            tracing::warn!(key = %key, "Discarding result, cache entry was reclaimed");
            return Ok(Completion::Superseded);
        }

        metadata.created_at = now;
        metadata.last_access = now;

        match outcome {
            Outcome::Ready { artifact, source } => {
                let name = format!(
                    "{}.{}.{ARTIFACT_EXTENSION}",
                    file_stem(&path),
                    Uuid::new_v4().simple()
                );
                let artifact_path = self.artifact_path(key, &name);

                let size = match fs::persist_tempfile(artifact, &artifact_path)
                    .and_then(|file| file.metadata())
                {
                    Ok(file_metadata) => file_metadata.len(),
                    Err(err) => {
                        tracing::error!(
                            key = %key,
                            error = &err as &dyn std::error::Error,
                            "Failed to persist cache artifact"
                        );
                        fs::remove_file_if_exists(&artifact_path)?;
                        fs::remove_file_if_exists(&path)?;
                        return Ok(Completion::Abandoned);
                    }
                };

                metadata.state = EntryState::Ready {
                    artifact: name.clone(),
                    size,
                    source: source.clone(),
                };
                if let Err(err) = metadata.write(&path) {
                    fs::remove_file_if_exists(&artifact_path)?;
                    return Err(err);
                }
                metric!(time_raw("caches.file.size") = size);

                Ok(Completion::Ready(ReadyEntry {
                    path: artifact_path,
                    artifact: name,
                    size,
                    source,
                }))
            }
            Outcome::Failed(error) => {
                let Some(retry_after) = error.retry_after(&self.config) else {
                    fs::remove_file_if_exists(&path)?;
                    return Ok(Completion::Abandoned);
                };

                let expires_at = now + retry_after;
                metadata.state = match &error {
                    CacheError::NotFound => EntryState::NotFound { expires_at },
                    other => EntryState::Failed {
                        error: other.clone(),
                        expires_at,
                    },
                };
                metadata.write(&path)?;

                Ok(Completion::Negative(error, expires_at))
            }
        }
    }

    /// Signals that `owner` is still computing its entry.
    ///
    /// The entry is not reclaimed as long as the owner calls this more often than
    /// `max_pending_age`. Returns `false` if the entry is no longer owned by `owner`.
    pub fn heartbeat(&self, owner: &PendingOwner) -> io::Result<bool> {
        self.heartbeat_at(owner, SystemTime::now())
    }

    pub(crate) fn heartbeat_at(&self, owner: &PendingOwner, now: SystemTime) -> io::Result<bool> {
        let path = self.metadata_path(&owner.key);
        let _lock = self.lock()?;

        let Some(mut metadata) = EntryMetadata::read(&path)? else {
            return Ok(false);
        };
        match &mut metadata.state {
            EntryState::Pending(info) if info.owner == owner.token => {
                info.heartbeat = Some(now);
            }
            _ => return Ok(false),
        }
        metadata.write_unsynced(&path)?;
        Ok(true)
    }

    /// Releases a pending entry without a result.
    ///
    /// Used when the owner gives up, for example because its request was cancelled. Waiting
    /// callers will then compute the entry themselves.
    pub fn abandon(&self, owner: &PendingOwner) -> io::Result<()> {
        let path = self.metadata_path(&owner.key);
        let _lock = self.lock()?;

        if let Some(metadata) = EntryMetadata::read(&path)? {
            if metadata.is_pending_for(owner.token) {
                tracing::debug!(key = %owner.key, "Abandoning pending cache entry");
                fs::remove_file_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Bumps `last_access` of a ready entry.
    ///
    /// Returns `false` if the entry is not ready anymore, for example because it was evicted.
    pub fn touch(&self, key: &CacheKey) -> io::Result<bool> {
        self.touch_at(key, SystemTime::now())
    }

    pub(crate) fn touch_at(&self, key: &CacheKey, now: SystemTime) -> io::Result<bool> {
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        match EntryMetadata::read(&path)? {
            Some(mut metadata) if matches!(metadata.state, EntryState::Ready { .. }) => {
                metadata.touch(now);
                metadata.write_unsynced(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes a ready entry whose artifact turned out to be unusable.
    ///
    /// Only the given generation is removed. If the entry has been recomputed in the meantime, it
    /// is left alone.
    pub fn invalidate(&self, key: &CacheKey, artifact: &str) -> io::Result<()> {
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        let Some(metadata) = EntryMetadata::read(&path)? else {
            return Ok(());
        };
        if matches!(&metadata.state, EntryState::Ready { artifact: current, .. } if current == artifact)
        {
            tracing::warn!(key = %key, artifact, "Invalidating corrupt cache artifact");
            metric!(counter("caches.corrupt") += 1, "reason" => "unreadable");
            fs::remove_file_if_exists(&path)?;
            fs::remove_file_if_exists(&self.artifact_path(key, artifact))?;
        }
        Ok(())
    }

    /// Reads the metadata of all entries without taking the lock.
    pub fn scan(&self) -> io::Result<StoreSnapshot> {
        self.scan_at(SystemTime::now())
    }

    pub(crate) fn scan_at(&self, now: SystemTime) -> io::Result<StoreSnapshot> {
        let mut entries = Vec::new();
        let mut other_files = Vec::new();

        for path in fs::walk_files(&self.root)? {
            if path == self.lock_path {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == METADATA_EXTENSION) {
                if let Some(metadata) = EntryMetadata::read(&path)? {
                    let key = metadata.key();
                    if self.metadata_path(&key) != path {
                        tracing::warn!(path = %path.display(), "Cache metadata at unexpected path");
                        continue;
                    }
                    entries.push(ScannedEntry { key, metadata });
                }
            } else if let Some(file_metadata) = fs::catch_not_found(|| path.metadata())? {
                let mtime = file_metadata.modified()?;
                other_files.push((path, mtime));
            }
        }

        Ok(StoreSnapshot {
            time: now,
            entries,
            other_files,
        })
    }

    /// Lists all ready entries, least recently used first, along with the snapshot time.
    pub fn list_ready_by_lru(&self) -> io::Result<(SystemTime, Vec<LruEntry>)> {
        let snapshot = self.scan()?;
        Ok((snapshot.time, snapshot.ready_by_lru()))
    }

    /// Removes a ready entry and its artifact.
    ///
    /// The entry is kept if it was accessed after `snapshot_time`, the time the eviction decision
    /// was based on.
    pub fn evict(&self, key: &CacheKey, snapshot_time: SystemTime) -> io::Result<Eviction> {
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        let Some(metadata) = EntryMetadata::read(&path)? else {
            return Ok(Eviction::Gone);
        };
        let Some(entry) = self.ready_entry(key, &metadata) else {
            return Ok(Eviction::Gone);
        };
        if metadata.last_access > snapshot_time {
            return Ok(Eviction::Recent);
        }

        // Metadata goes first, so nobody picks up an artifact that is about to disappear.
        // Readers that already mapped the artifact keep their view of it.
        fs::remove_file_if_exists(&path)?;
        fs::remove_file_if_exists(&entry.path)?;
        tracing::debug!(key = %key, size = entry.size, "Evicted cache entry");

        Ok(Eviction::Evicted(entry.size))
    }

    /// Removes a negative entry if it has expired at `now`.
    pub fn remove_expired(&self, key: &CacheKey, now: SystemTime) -> io::Result<bool> {
        let path = self.metadata_path(key);
        let _lock = self.lock()?;

        match EntryMetadata::read(&path)? {
            Some(metadata) if metadata.is_expired_negative(now) => {
                fs::remove_file_if_exists(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Deletes files that no entry refers to.
    ///
    /// This covers artifacts of crashed or superseded owners and leftover temporary files. Only
    /// files older than `grace_period` are considered, so in-progress writes are never touched.
    /// Afterwards, directories left empty by evictions are removed.
    /// Returns the number of removed files and their total size.
    pub fn sweep_orphans(
        &self,
        snapshot: &StoreSnapshot,
        grace_period: Duration,
    ) -> io::Result<(usize, u64)> {
        let is_old = |mtime: SystemTime| {
            snapshot
                .time
                .duration_since(mtime)
                .is_ok_and(|age| age >= grace_period)
        };

        let mut removed = 0;
        let mut removed_bytes = 0;

        for (path, mtime) in &snapshot.other_files {
            if !is_old(*mtime) {
                continue;
            }
            let _lock = self.lock()?;
            if self.is_referenced(path)? {
                continue;
            }
            let size = fs::catch_not_found(|| path.metadata())?.map_or(0, |m| m.len());
            if fs::remove_file_if_exists(path)? {
                tracing::debug!(path = %path.display(), "Removed orphaned cache file");
                removed += 1;
                removed_bytes += size;
            }
        }

        for path in fs::walk_files(&self.tmp_dir)? {
            let Some(file_metadata) = fs::catch_not_found(|| path.metadata())? else {
                continue;
            };
            if is_old(file_metadata.modified()?) && fs::remove_file_if_exists(&path)? {
                tracing::debug!(path = %path.display(), "Removed stale temporary file");
                removed += 1;
                removed_bytes += file_metadata.len();
            }
        }

        let removed_dirs = fs::remove_empty_dirs(&self.root)?;
        if removed_dirs > 0 {
            tracing::debug!(removed_dirs, "Removed empty cache directories");
            metric!(counter("eviction.removed.dirs") += removed_dirs as i64);
        }

        Ok((removed, removed_bytes))
    }

    /// Whether `path` is the artifact of the entry stored next to it.
    ///
    /// Must be called with the lock held.
    fn is_referenced(&self, path: &Path) -> io::Result<bool> {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(false);
        };
        let Some((stem, _)) = name.split_once('.') else {
            return Ok(false);
        };
        if stem.is_empty() {
            return Ok(false);
        }

        let metadata_path = path.with_file_name(format!("{stem}.{METADATA_EXTENSION}"));
        Ok(match EntryMetadata::read(&metadata_path)? {
            Some(EntryMetadata {
                state: EntryState::Ready { artifact, .. },
                ..
            }) => artifact == name,
            _ => false,
        })
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
