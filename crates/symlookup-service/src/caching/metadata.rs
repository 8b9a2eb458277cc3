use std::io;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use symlookup_sources::ModuleKey;
use uuid::Uuid;

use super::{CacheError, CacheKey, fs};

/// The persisted state of one cache entry.
///
/// Every entry is stored as a small JSON document next to its artifact. Documents are only ever
/// replaced as a whole, so readers never see a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub module: ModuleKey,
    pub include_try: bool,
    pub state: EntryState,
    /// When the entry reached its current state.
    pub created_at: SystemTime,
    /// Last time a lookup read this entry. Never moves backwards.
    pub last_access: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryState {
    /// A worker is fetching and converting this module.
    Pending(PendingInfo),
    /// The converted artifact is available.
    Ready {
        /// File name of the artifact, relative to the directory of the metadata file.
        artifact: String,
        size: u64,
        /// URI of the symbol file the artifact was converted from.
        #[serde(default)]
        source: Option<String>,
    },
    /// None of the sources has the symbol file.
    NotFound { expires_at: SystemTime },
    /// Fetching or converting failed.
    Failed {
        error: CacheError,
        expires_at: SystemTime,
    },
}

/// Identifies the worker computing a pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    pub owner: Uuid,
    pub pid: u32,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Last time the owner reported that it is still working on the entry.
    #[serde(default)]
    pub heartbeat: Option<SystemTime>,
}

impl PendingInfo {
    pub(crate) fn new(owner: Uuid) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());
        Self {
            owner,
            pid: std::process::id(),
            hostname,
            heartbeat: None,
        }
    }
}

impl EntryMetadata {
    pub(crate) fn pending(key: &CacheKey, owner: Uuid, now: SystemTime) -> Self {
        Self {
            module: key.module().clone(),
            include_try: key.include_try(),
            state: EntryState::Pending(PendingInfo::new(owner)),
            created_at: now,
            last_access: now,
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.module.clone(), self.include_try)
    }

    /// Whether this entry is owned by the given pending owner.
    pub(crate) fn is_pending_for(&self, owner: Uuid) -> bool {
        matches!(&self.state, EntryState::Pending(info) if info.owner == owner)
    }

    /// Returns the remembered error of a negative entry that has not expired yet.
    pub(crate) fn live_negative(&self, now: SystemTime) -> Option<(CacheError, SystemTime)> {
        match &self.state {
            EntryState::NotFound { expires_at } if now < *expires_at => {
                Some((CacheError::NotFound, *expires_at))
            }
            EntryState::Failed { error, expires_at } if now < *expires_at => {
                Some((error.clone(), *expires_at))
            }
            _ => None,
        }
    }

    pub(crate) fn is_expired_negative(&self, now: SystemTime) -> bool {
        match &self.state {
            EntryState::NotFound { expires_at } | EntryState::Failed { expires_at, .. } => {
                now >= *expires_at
            }
            _ => false,
        }
    }

    /// Bumps `last_access`, keeping it monotonic.
    pub(crate) fn touch(&mut self, now: SystemTime) {
        self.last_access = self.last_access.max(now);
    }

    /// Reads the metadata file at `path`.
    ///
    /// Returns `None` if the file does not exist. A file that cannot be parsed is logged and also
    /// treated as absent, it will be overwritten by the next writer.
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        let Some(contents) = fs::catch_not_found(|| std::fs::read(path))? else {
            return Ok(None);
        };
        match serde_json::from_slice(&contents) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = &err as &dyn std::error::Error,
                    "Ignoring unreadable cache metadata"
                );
                metric!(counter("caches.corrupt") += 1, "reason" => "metadata");
                Ok(None)
            }
        }
    }

    /// Atomically replaces the metadata file at `path`.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let contents = serde_json::to_vec(self).map_err(io::Error::other)?;
        fs::write_atomic(path, &contents)
    }

    /// Like [`write`](Self::write), but does not wait for the contents to reach the disk.
    ///
    /// Only for updates that may be lost on a crash, like bumping `last_access`.
    pub(crate) fn write_unsynced(&self, path: &Path) -> io::Result<()> {
        let contents = serde_json::to_vec(self).map_err(io::Error::other)?;
        fs::write_atomic_unsynced(path, &contents)
    }

    /// The last sign of life of a pending entry's owner.
    pub(crate) fn pending_since(&self) -> Option<(&PendingInfo, SystemTime)> {
        match &self.state {
            EntryState::Pending(info) => {
                let since = info
                    .heartbeat
                    .map_or(self.created_at, |beat| beat.max(self.created_at));
                Some((info, since))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn key() -> CacheKey {
        CacheKey::new(ModuleKey::new("xul.pdb", "ABCD").unwrap(), false)
    }

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.meta");
        let now = SystemTime::now();

        assert_eq!(EntryMetadata::read(&path).unwrap(), None);

        let mut metadata = EntryMetadata::pending(&key(), Uuid::new_v4(), now);
        metadata.state = EntryState::Failed {
            error: CacheError::DownloadError("502 Bad Gateway".into()),
            expires_at: now + Duration::from_secs(60),
        };
        metadata.write(&path).unwrap();

        let read = EntryMetadata::read(&path).unwrap().unwrap();
        assert_eq!(read, metadata);
        assert_eq!(read.key(), key());
    }

    #[test]
    fn test_corrupt_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.meta");
        std::fs::write(&path, b"{\"module\": tru").unwrap();
        assert_eq!(EntryMetadata::read(&path).unwrap(), None);
    }

    #[test]
    fn test_negative_expiry() {
        let now = SystemTime::now();
        let mut metadata = EntryMetadata::pending(&key(), Uuid::new_v4(), now);
        metadata.state = EntryState::NotFound {
            expires_at: now + Duration::from_secs(10),
        };

        assert_eq!(
            metadata.live_negative(now),
            Some((CacheError::NotFound, now + Duration::from_secs(10)))
        );
        assert!(!metadata.is_expired_negative(now));

        let later = now + Duration::from_secs(10);
        assert_eq!(metadata.live_negative(later), None);
        assert!(metadata.is_expired_negative(later));
    }

    #[test]
    fn test_pending_since_heartbeat() {
        let now = SystemTime::now();
        let mut metadata = EntryMetadata::pending(&key(), Uuid::new_v4(), now);
        assert_eq!(metadata.pending_since().map(|(_, since)| since), Some(now));

        if let EntryState::Pending(info) = &mut metadata.state {
            info.heartbeat = Some(now + Duration::from_secs(30));
        }
        assert_eq!(
            metadata.pending_since().map(|(_, since)| since),
            Some(now + Duration::from_secs(30))
        );

        // entries written before heartbeats existed
        let json = serde_json::to_string(&metadata)
            .unwrap()
            .replace(",\"heartbeat\":", ",\"unused\":");
        let legacy: EntryMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(legacy.pending_since().map(|(_, since)| since), Some(now));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let now = SystemTime::now();
        let mut metadata = EntryMetadata::pending(&key(), Uuid::new_v4(), now);
        metadata.touch(now - Duration::from_secs(5));
        assert_eq!(metadata.last_access, now);
        metadata.touch(now + Duration::from_secs(5));
        assert_eq!(metadata.last_access, now + Duration::from_secs(5));
    }
}
