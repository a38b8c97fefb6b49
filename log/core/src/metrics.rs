//! Cleaner and log metrics.
//!
//! Counters are plain atomics grouped per concern and threaded through
//! constructors; snapshots are plain-old-data copies for export by
//! whatever operational glue sits above the log.

use crate::entry::ENTRY_TYPE_COUNT;
use crate::sync::{AtomicU64, Ordering};

macro_rules! counter {
    ($field:ident) => {
        /// Increment by `n`.
        #[inline]
        pub(crate) fn $field(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

/// Counters for the foreground append/free path.
#[derive(Debug, Default)]
pub struct LogMetrics {
    pub(crate) appends: AtomicU64,
    pub(crate) append_bytes: AtomicU64,
    pub(crate) failed_appends: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) freed_bytes: AtomicU64,
    pub(crate) head_rollovers: AtomicU64,
}

impl LogMetrics {
    counter!(appends);
    counter!(append_bytes);
    counter!(failed_appends);
    counter!(frees);
    counter!(freed_bytes);
    counter!(head_rollovers);

    /// Copy out the current values.
    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            append_bytes: self.append_bytes.load(Ordering::Relaxed),
            failed_appends: self.failed_appends.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
            head_rollovers: self.head_rollovers.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LogMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    /// Successful appends.
    pub appends: u64,
    /// Wire bytes appended.
    pub append_bytes: u64,
    /// Appends that failed with `OutOfSegments`.
    pub failed_appends: u64,
    /// `free` calls.
    pub frees: u64,
    /// Wire bytes freed.
    pub freed_bytes: u64,
    /// Head segments retired because they filled up.
    pub head_rollovers: u64,
}

/// Per-entry-type scan counters shared by both cleaning regimes.
#[derive(Debug, Default)]
pub struct ScanCounters {
    entries_scanned: [AtomicU64; ENTRY_TYPE_COUNT],
    live_entries_scanned: [AtomicU64; ENTRY_TYPE_COUNT],
    scanned_entry_bytes: [AtomicU64; ENTRY_TYPE_COUNT],
    live_scanned_entry_bytes: [AtomicU64; ENTRY_TYPE_COUNT],
}

impl ScanCounters {
    /// Record a scanned entry, live or not.
    pub(crate) fn note_scanned(&self, ty: usize, bytes: u64, live: bool) {
        self.entries_scanned[ty].fetch_add(1, Ordering::Relaxed);
        self.scanned_entry_bytes[ty].fetch_add(bytes, Ordering::Relaxed);
        if live {
            self.live_entries_scanned[ty].fetch_add(1, Ordering::Relaxed);
            self.live_scanned_entry_bytes[ty].fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ScanCountersSnapshot {
        let load = |a: &[AtomicU64; ENTRY_TYPE_COUNT]| {
            let mut out = [0u64; ENTRY_TYPE_COUNT];
            for (slot, counter) in out.iter_mut().zip(a.iter()) {
                *slot = counter.load(Ordering::Relaxed);
            }
            out
        };
        ScanCountersSnapshot {
            entries_scanned: load(&self.entries_scanned),
            live_entries_scanned: load(&self.live_entries_scanned),
            scanned_entry_bytes: load(&self.scanned_entry_bytes),
            live_scanned_entry_bytes: load(&self.live_scanned_entry_bytes),
        }
    }
}

/// Point-in-time copy of [`ScanCounters`], indexed by entry type tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCountersSnapshot {
    /// Entries examined.
    pub entries_scanned: [u64; ENTRY_TYPE_COUNT],
    /// Entries found live and relocated.
    pub live_entries_scanned: [u64; ENTRY_TYPE_COUNT],
    /// Wire bytes examined.
    pub scanned_entry_bytes: [u64; ENTRY_TYPE_COUNT],
    /// Wire bytes relocated.
    pub live_scanned_entry_bytes: [u64; ENTRY_TYPE_COUNT],
}

/// Counters for in-memory compaction.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    pub(crate) segments_compacted: AtomicU64,
    pub(crate) bytes_freed: AtomicU64,
    pub(crate) bytes_in_compacted_segments: AtomicU64,
    pub(crate) bytes_appended_to_survivors: AtomicU64,
    pub(crate) tombstone_fallback_passes: AtomicU64,
    /// Scan statistics for compaction passes.
    pub scans: ScanCounters,
}

impl InMemoryMetrics {
    counter!(segments_compacted);
    counter!(bytes_freed);
    counter!(bytes_in_compacted_segments);
    counter!(bytes_appended_to_survivors);
    counter!(tombstone_fallback_passes);

    /// Copy out the current values.
    pub fn snapshot(&self) -> InMemoryMetricsSnapshot {
        InMemoryMetricsSnapshot {
            segments_compacted: self.segments_compacted.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            bytes_in_compacted_segments: self.bytes_in_compacted_segments.load(Ordering::Relaxed),
            bytes_appended_to_survivors: self.bytes_appended_to_survivors.load(Ordering::Relaxed),
            tombstone_fallback_passes: self.tombstone_fallback_passes.load(Ordering::Relaxed),
            scans: self.scans.snapshot(),
        }
    }
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryMetricsSnapshot {
    /// Segments compacted.
    pub segments_compacted: u64,
    /// Seglet bytes returned to the allocator by compaction.
    pub bytes_freed: u64,
    /// Seglet bytes backing segments before compaction.
    pub bytes_in_compacted_segments: u64,
    /// Bytes appended to compaction survivors.
    pub bytes_appended_to_survivors: u64,
    /// Passes that fell back to tombstone-count selection.
    pub tombstone_fallback_passes: u64,
    /// Scan statistics.
    pub scans: ScanCountersSnapshot,
}

/// Counters for disk cleaning.
#[derive(Debug, Default)]
pub struct OnDiskMetrics {
    pub(crate) runs: AtomicU64,
    pub(crate) low_disk_space_runs: AtomicU64,
    pub(crate) segments_cleaned: AtomicU64,
    pub(crate) empty_segments_cleaned: AtomicU64,
    pub(crate) survivors_created: AtomicU64,
    pub(crate) memory_bytes_freed: AtomicU64,
    pub(crate) disk_bytes_freed: AtomicU64,
    pub(crate) bytes_appended_to_survivors: AtomicU64,
    pub(crate) sync_retries: AtomicU64,
    /// Scan statistics for disk passes.
    pub scans: ScanCounters,
}

impl OnDiskMetrics {
    counter!(runs);
    counter!(low_disk_space_runs);
    counter!(segments_cleaned);
    counter!(empty_segments_cleaned);
    counter!(survivors_created);
    counter!(memory_bytes_freed);
    counter!(disk_bytes_freed);
    counter!(bytes_appended_to_survivors);
    counter!(sync_retries);

    /// Copy out the current values.
    pub fn snapshot(&self) -> OnDiskMetricsSnapshot {
        OnDiskMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            low_disk_space_runs: self.low_disk_space_runs.load(Ordering::Relaxed),
            segments_cleaned: self.segments_cleaned.load(Ordering::Relaxed),
            empty_segments_cleaned: self.empty_segments_cleaned.load(Ordering::Relaxed),
            survivors_created: self.survivors_created.load(Ordering::Relaxed),
            memory_bytes_freed: self.memory_bytes_freed.load(Ordering::Relaxed),
            disk_bytes_freed: self.disk_bytes_freed.load(Ordering::Relaxed),
            bytes_appended_to_survivors: self.bytes_appended_to_survivors.load(Ordering::Relaxed),
            sync_retries: self.sync_retries.load(Ordering::Relaxed),
            scans: self.scans.snapshot(),
        }
    }
}

/// Point-in-time copy of [`OnDiskMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OnDiskMetricsSnapshot {
    /// Disk cleaning passes that selected at least one victim.
    pub runs: u64,
    /// Passes triggered by disk pressure rather than depleted memory.
    pub low_disk_space_runs: u64,
    /// Victim segments cleaned.
    pub segments_cleaned: u64,
    /// Victims with zero live bytes.
    pub empty_segments_cleaned: u64,
    /// Survivor segments created.
    pub survivors_created: u64,
    /// Seglet bytes returned to the allocator.
    pub memory_bytes_freed: u64,
    /// Backup bytes released.
    pub disk_bytes_freed: u64,
    /// Bytes appended to disk survivors.
    pub bytes_appended_to_survivors: u64,
    /// Replica syncs that had to be retried.
    pub sync_retries: u64,
    /// Scan statistics.
    pub scans: ScanCountersSnapshot,
}

/// Counters for cleaner thread activity.
#[derive(Debug, Default)]
pub struct ThreadMetrics {
    pub(crate) work_passes: AtomicU64,
    pub(crate) sleep_passes: AtomicU64,
}

impl ThreadMetrics {
    counter!(work_passes);
    counter!(sleep_passes);

    /// Copy out the current values.
    pub fn snapshot(&self) -> ThreadMetricsSnapshot {
        ThreadMetricsSnapshot {
            work_passes: self.work_passes.load(Ordering::Relaxed),
            sleep_passes: self.sleep_passes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ThreadMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadMetricsSnapshot {
    /// Iterations that found work.
    pub work_passes: u64,
    /// Iterations that went to sleep.
    pub sleep_passes: u64,
}

/// All cleaner metric groups.
#[derive(Debug, Default)]
pub struct CleanerMetrics {
    /// In-memory compaction counters.
    pub in_memory: InMemoryMetrics,
    /// Disk cleaning counters.
    pub on_disk: OnDiskMetrics,
    /// Thread activity counters.
    pub threads: ThreadMetrics,
}

impl CleanerMetrics {
    /// Copy out the current values of every group.
    pub fn snapshot(&self) -> CleanerMetricsSnapshot {
        CleanerMetricsSnapshot {
            in_memory: self.in_memory.snapshot(),
            on_disk: self.on_disk.snapshot(),
            threads: self.threads.snapshot(),
        }
    }
}

/// Point-in-time copy of [`CleanerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanerMetricsSnapshot {
    /// In-memory compaction counters.
    pub in_memory: InMemoryMetricsSnapshot,
    /// Disk cleaning counters.
    pub on_disk: OnDiskMetricsSnapshot,
    /// Thread activity counters.
    pub threads: ThreadMetricsSnapshot,
}
