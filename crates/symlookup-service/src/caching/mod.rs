//! The shared symbol cache.
//!
//! Converted symbol files are cached on disk in a directory shared by all lookup workers of a
//! machine and by the eviction process. The [`SymbolStore`] owns that directory:
//!
//! - `symcaches/.lock` is an advisory lock held for every metadata mutation.
//! - `symcaches/v{version}/aa/bbccdd/<hash>.meta` is the metadata of one [`CacheKey`], a JSON
//!   [`EntryMetadata`] document holding the entry state, its size and access times.
//! - `symcaches/v{version}/aa/bbccdd/<hash>.<generation>.symc` is the converted artifact of a
//!   ready entry. Artifacts are never modified, a recomputation writes a new generation.
//! - `tmp/` holds downloads and artifacts while they are being written.
//!
//! # Entry lifecycle
//!
//! The first caller of [`SymbolStore::get_or_create`] for a key inserts a `pending` entry and
//! becomes its owner. Other callers see the pending entry and poll until the owner calls
//! [`SymbolStore::complete`], which turns the entry into `ready`, `not_found` or `failed`. Negative
//! entries expire after a configurable time (see [`CacheError::retry_after`]), ready entries are
//! removed by the [`EvictionManager`] in least-recently-used order. A pending entry whose owner
//! died is reclaimed by the next caller once it is older than `max_pending_age`.

mod cache_error;
mod cache_key;
mod eviction;
pub(crate) mod fs;
mod metadata;
mod store;

pub use cache_error::{CacheEntry, CacheError};
pub use cache_key::{CacheKey, SYMCACHE_VERSION};
pub use eviction::{EvictionManager, EvictionStats};
pub use metadata::{EntryMetadata, EntryState, PendingInfo};
pub use store::{
    Completion, Eviction, Lookup, LruEntry, Outcome, PendingOwner, ReadyEntry, ScannedEntry,
    StoreSnapshot, SymbolStore, SYMCACHES_DIR,
};
