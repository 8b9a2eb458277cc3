use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::EvictionConfig;

use super::store::{Eviction, StoreSnapshot, SymbolStore};

/// Keeps the symbol cache below its size ceiling.
///
/// The eviction manager runs in its own process next to any number of lookup workers. It holds
/// no state across cycles: every cycle starts from a fresh [`SymbolStore::scan`], so it can be
/// restarted at any time.
#[derive(Debug, Clone)]
pub struct EvictionManager {
    store: Arc<SymbolStore>,
    config: EvictionConfig,
    dry_run: bool,
}

/// What happened during one eviction cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionStats {
    /// Total size of ready entries when the cycle started.
    pub size_before: u64,
    /// Total size of ready entries after the cycle, as far as this cycle knows.
    pub size_after: u64,
    pub evicted_files: usize,
    pub evicted_bytes: u64,
    /// Entries that would have been evicted, but were read after the snapshot.
    pub skipped_recent: usize,
    pub expired_negatives: usize,
    pub orphans_removed: usize,
    pub orphan_bytes: u64,
    /// Set if a single remaining entry is larger than the whole ceiling.
    pub oversized: bool,
}

impl EvictionManager {
    pub fn new(store: Arc<SymbolStore>, config: EvictionConfig) -> Self {
        Self {
            store,
            config,
            dry_run: false,
        }
    }

    /// Only log what would be removed, without deleting anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs one eviction cycle.
    ///
    /// This blocks on file system I/O.
    pub fn run_cycle(&self) -> io::Result<EvictionStats> {
        self.run_cycle_at(SystemTime::now())
    }

    pub(crate) fn run_cycle_at(&self, now: SystemTime) -> io::Result<EvictionStats> {
        tracing::info!(dry_run = self.dry_run, "Starting eviction cycle");
        let snapshot = self.store.scan_at(now)?;
        let mut stats = EvictionStats::default();

        self.remove_expired(&snapshot, &mut stats)?;
        self.evict_lru(&snapshot, &mut stats)?;

        if !self.dry_run {
            let (removed, bytes) = self
                .store
                .sweep_orphans(&snapshot, self.config.orphan_grace_period)?;
            stats.orphans_removed = removed;
            stats.orphan_bytes = bytes;
        }

        tracing::info!(
            "Evicted {} files totaling {} bytes, cache is now {} of {} bytes",
            stats.evicted_files,
            stats.evicted_bytes,
            stats.size_after,
            self.config.max_cache_size,
        );
        tracing::info!(
            "Removed {} expired negative entries and {} orphaned files totaling {} bytes",
            stats.expired_negatives,
            stats.orphans_removed,
            stats.orphan_bytes,
        );

        metric!(counter("eviction.cycle") += 1);
        metric!(gauge("eviction.size.bytes") = stats.size_after);
        metric!(counter("eviction.removed.files") += stats.evicted_files as i64);
        metric!(counter("eviction.removed.bytes") += stats.evicted_bytes as i64);
        metric!(counter("eviction.skipped.recent") += stats.skipped_recent as i64);

        Ok(stats)
    }

    fn remove_expired(&self, snapshot: &StoreSnapshot, stats: &mut EvictionStats) -> io::Result<()> {
        for entry in &snapshot.entries {
            if !entry.metadata.is_expired_negative(snapshot.time) {
                continue;
            }
            tracing::debug!(key = %entry.key, "Removing expired negative entry");
            if self.dry_run || self.store.remove_expired(&entry.key, snapshot.time)? {
                stats.expired_negatives += 1;
            }
        }
        Ok(())
    }

    fn evict_lru(&self, snapshot: &StoreSnapshot, stats: &mut EvictionStats) -> io::Result<()> {
        let ready = snapshot.ready_by_lru();
        let ceiling = self.config.max_cache_size;

        let mut total: u64 = ready.iter().map(|entry| entry.size).sum();
        let mut remaining = ready.len();
        stats.size_before = total;

        for entry in &ready {
            if total <= ceiling {
                break;
            }
            if remaining <= 1 {
                tracing::warn!(
                    key = %entry.key,
                    size = entry.size,
                    ceiling,
                    "Keeping cache entry larger than the cache size limit"
                );
                stats.oversized = true;
                break;
            }

            if self.dry_run {
                tracing::info!(key = %entry.key, size = entry.size, "Would evict cache entry");
                total -= entry.size;
                remaining -= 1;
                stats.evicted_files += 1;
                stats.evicted_bytes += entry.size;
                continue;
            }

            match self.store.evict(&entry.key, snapshot.time)? {
                Eviction::Evicted(size) => {
                    total = total.saturating_sub(size);
                    remaining -= 1;
                    stats.evicted_files += 1;
                    stats.evicted_bytes += size;
                }
                Eviction::Recent => {
                    tracing::debug!(key = %entry.key, "Not evicting recently used cache entry");
                    stats.skipped_recent += 1;
                }
                Eviction::Gone => {
                    total = total.saturating_sub(entry.size);
                    remaining -= 1;
                }
            }
        }

        stats.size_after = total;
        Ok(())
    }

    /// Runs eviction cycles forever, one every `interval`.
    ///
    /// Failing cycles are logged, the next cycle starts over from a fresh scan.
    pub async fn run(self, interval: Duration) {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let manager = self.clone();
            match tokio::task::spawn_blocking(move || manager.run_cycle()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Eviction cycle failed"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Eviction cycle panicked"
                    );
                }
            }
        }
    }
}
