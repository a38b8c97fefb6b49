//! Background log cleaning.
//!
//! Worker threads watch memory and disk pressure and reclaim space in two
//! regimes:
//!
//! - **Memory compaction**: repack one segment's live entries into a
//!   smaller survivor, reclaiming seglets without touching backups.
//! - **Disk cleaning**: relocate the live entries of several victims into
//!   a chain of survivors, replicate the survivors, then free both the
//!   memory and the backup replicas of the victims.
//!
//! Thread 0 is the policy thread: it performs disk cleaning under disk
//! pressure or depleted memory and compaction otherwise. Helper threads
//! only compact, at staggered utilization thresholds so they don't herd.
//!
//! Victim choice is cost-benefit: old, mostly-dead segments first. The
//! cached value is tagged with a per-sort version so the comparison stays
//! a strict weak order even while statistics move underneath the sort.

use crate::config::{
    LogConfig, MAX_CLEANABLE_MEMORY_UTILIZATION, MAX_LIVE_SEGMENTS_PER_DISK_PASS,
    MEMORY_DEPLETED_UTILIZATION, MIN_DISK_UTILIZATION, MIN_MEMORY_UTILIZATION, POLL_USEC,
    SURVIVOR_SEGMENTS_TO_RESERVE,
};
use crate::entry::{EntryType, wire_len};
use crate::error::{LogError, LogResult};
use crate::handlers::EntryHandlers;
use crate::log::Log;
use crate::manager::{SegmentManager, seglets_needed};
use crate::metrics::{CleanerMetrics, CleanerMetricsSnapshot, ScanCounters};
use crate::reference::Reference;
use crate::segment::{Segment, State, wall_seconds};
use crate::sync::{AtomicBool, AtomicU64, Ordering, fence};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of relocating one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocStatus {
    /// Entry was live and moved; carries its wire length.
    Relocated(u32),
    /// Entry was dead (or died mid-copy); nothing moved.
    Dead,
    /// The survivor is full (or absent); the caller must provide another.
    Failed,
}

struct CleanerShared {
    manager: Arc<SegmentManager>,
    handlers: Arc<dyn EntryHandlers>,
    config: LogConfig,
    in_memory_disabled: bool,
    /// Cleanable segments pulled from the manager but not yet cleaned.
    candidates: Mutex<Vec<Arc<Segment>>>,
    threads_should_exit: AtomicBool,
    /// Version tag source for cost-benefit sorts.
    sort_epoch: AtomicU64,
    metrics: CleanerMetrics,
}

/// Background cleaner for a [`Log`].
///
/// Construction reserves survivor seglets; no work happens until
/// [`LogCleaner::start`]. `stop` and `start` may be called repeatedly
/// (not concurrently); stopping preserves the candidate list, so a
/// restarted cleaner resumes where it left off.
pub struct LogCleaner {
    shared: Arc<CleanerShared>,
    threads: Vec<JoinHandle<()>>,
}

impl LogCleaner {
    /// Create a cleaner for `log`, reserving survivor seglets.
    pub fn new(log: &Log, handlers: Arc<dyn EntryHandlers>) -> LogResult<Self> {
        let manager = Arc::clone(log.manager());
        let config = manager.config().clone();

        let in_memory_disabled =
            config.disable_in_memory_cleaning || config.cleaner_write_cost_threshold == 0;

        let reserve =
            config.cleaner_threads * SURVIVOR_SEGMENTS_TO_RESERVE * config.seglets_per_segment();
        if !manager.initialize_survivor_reserve(reserve) {
            return Err(LogError::Config(
                "heap too small to reserve survivor segments",
            ));
        }

        Ok(Self {
            shared: Arc::new(CleanerShared {
                manager,
                handlers,
                config,
                in_memory_disabled,
                candidates: Mutex::new(Vec::new()),
                threads_should_exit: AtomicBool::new(false),
                sort_epoch: AtomicU64::new(0),
                metrics: CleanerMetrics::default(),
            }),
            threads: Vec::new(),
        })
    }

    /// Spawn the cleaner threads, if not already running.
    pub fn start(&mut self) {
        if !self.threads.is_empty() {
            return;
        }
        self.shared.threads_should_exit.store(false, Ordering::Release);
        for number in 0..self.shared.config.cleaner_threads {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("log-cleaner-{number}"))
                .spawn(move || cleaner_thread(shared, number))
                .expect("spawn cleaner thread");
            self.threads.push(handle);
        }
    }

    /// Stop and join the cleaner threads. In-flight passes complete
    /// first; candidates survive for a later [`LogCleaner::start`].
    pub fn stop(&mut self) {
        self.shared
            .threads_should_exit
            .store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.shared
            .threads_should_exit
            .store(false, Ordering::Release);
    }

    /// Whether the worker threads are running.
    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Pull newly cleanable segments into the candidate list.
    pub fn poll_candidates(&self) {
        let mut candidates = self.shared.candidates.lock();
        self.shared.manager.cleanable_segments(&mut candidates);
    }

    /// Run one synchronous memory compaction pass.
    ///
    /// Returns whether a segment was compacted. Deterministic entry point
    /// for embedders that drive cleaning themselves (and for tests).
    pub fn compact_once(&self) -> bool {
        self.poll_candidates();
        self.shared.do_memory_cleaning()
    }

    /// Run one synchronous disk cleaning pass.
    ///
    /// Returns whether any victim was cleaned.
    pub fn clean_disk_once(&self) -> bool {
        self.poll_candidates();
        self.shared.do_disk_cleaning(true)
    }

    /// Cleaner counters.
    pub fn metrics(&self) -> CleanerMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for LogCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cleaner_thread(shared: Arc<CleanerShared>, thread_number: u32) {
    info!(thread = thread_number, "log cleaner thread started");

    loop {
        fence(Ordering::Acquire);
        if shared.threads_should_exit.load(Ordering::Acquire) {
            break;
        }
        shared.do_work(thread_number);
    }

    info!(thread = thread_number, "log cleaner thread stopping");
}

impl CleanerShared {
    /// One iteration of the cleaning loop: refresh candidates, decide
    /// whether and how to clean, or sleep.
    fn do_work(&self, thread_number: u32) {
        // Refresh candidates whether we clean or not; deferring the pull
        // just bunches the work up for later.
        {
            let mut candidates = self.candidates.lock();
            self.manager.cleanable_segments(&mut candidates);
        }

        let mem_util = self.manager.allocator().memory_utilization();
        let low_on_memory = mem_util >= MIN_MEMORY_UTILIZATION;
        let not_keeping_up = mem_util >= MEMORY_DEPLETED_UTILIZATION;
        let low_on_disk = self.manager.disk_utilization() >= MIN_DISK_UTILIZATION;
        let mut have_work = low_on_memory || low_on_disk;

        if have_work {
            if thread_number == 0 {
                if low_on_disk || not_keeping_up || self.in_memory_disabled {
                    self.do_disk_cleaning(low_on_disk);
                } else {
                    self.do_memory_cleaning();
                }
            } else {
                // Staggered thresholds keep helpers from herding onto
                // the same pressure edge.
                let threshold = (90 + 2 * thread_number).min(99);
                if !self.in_memory_disabled && mem_util >= threshold {
                    self.do_memory_cleaning();
                } else {
                    have_work = false;
                }
            }
        }

        if have_work {
            self.metrics.threads.work_passes(1);
        } else {
            self.metrics.threads.sleep_passes(1);
            // Jitter the sleep up to 10% so idle threads don't caravan
            // onto the candidate lock.
            let jitter = rand::rng().random_range(0..=POLL_USEC / 10);
            std::thread::sleep(Duration::from_micros(POLL_USEC + jitter));
        }
    }

    // ========== Memory compaction ==========

    /// Compact one segment in memory. Returns whether any segment was
    /// compacted.
    fn do_memory_cleaning(&self) -> bool {
        if self.in_memory_disabled {
            return false;
        }

        let Some((source, freeable_seglets)) = self.segment_to_compact() else {
            return false;
        };
        source.try_set_state(State::Cleanable, State::Cleaning);

        // May block on the survivor reserve; guaranteed to make progress
        // because compaction never holds more than this one survivor.
        let survivor = self.manager.alloc_side_segment(Some(&source));

        let seglet_size = self.config.seglet_size;
        self.metrics
            .in_memory
            .bytes_in_compacted_segments((source.seglets_allocated() * seglet_size) as u64);

        let mut bytes_appended = 0u32;
        for entry in source.iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => self.fatal_corruption(&source, e),
            };
            if entry.entry_type.is_segment_metadata() {
                continue;
            }

            let old_ref = Reference::new(source.id(), entry.offset);
            let status = self.relocate_entry(
                entry.entry_type,
                &entry.payload,
                old_ref,
                Some(&survivor),
                &self.metrics.in_memory.scans,
            );
            match status {
                RelocStatus::Relocated(wire) => bytes_appended += wire,
                RelocStatus::Dead => {}
                RelocStatus::Failed => {
                    // The survivor was sized for the source's live bytes;
                    // running out means the liveness accounting is wrong.
                    error!(
                        source = source.id(),
                        survivor = survivor.id(),
                        "live entry did not fit the compaction survivor"
                    );
                    panic!("invariant violation: compaction survivor overflow");
                }
            }
        }

        // One batched update instead of a fetch_add per entry.
        survivor.add_live_bytes(bytes_appended);
        survivor.close();

        // Trim the survivor down so the pass frees what selection
        // promised; a net-zero pass (tombstone fallback) trims nothing.
        let to_free = (survivor.seglets_allocated() as i64 - source.seglets_allocated() as i64
            + freeable_seglets as i64)
            .max(0) as u32;
        let in_use = survivor.appended_length().div_ceil(seglet_size);
        let unused = survivor.seglets_allocated().saturating_sub(in_use.max(1));
        let trimmed = to_free.min(unused);
        if !survivor.free_unused_seglets(trimmed) {
            panic!("invariant violation: compaction survivor trim failed");
        }

        let freed_bytes = (freeable_seglets * seglet_size) as u64;
        self.metrics.in_memory.bytes_freed(freed_bytes);
        self.metrics
            .in_memory
            .bytes_appended_to_survivors(survivor.appended_length() as u64);
        self.metrics.in_memory.segments_compacted(1);

        debug!(
            source = source.id(),
            survivor = survivor.id(),
            freed_seglets = freeable_seglets,
            appended = survivor.appended_length(),
            "compacted segment"
        );

        self.manager.compaction_complete(&source, &survivor);
        true
    }

    /// Greedy freeable-seglets selection, with the tombstone fallback
    /// when nothing looks freeable.
    fn segment_to_compact(&self) -> Option<(Arc<Segment>, u32)> {
        let mut candidates = self.candidates.lock();
        let seglet_size = self.config.seglet_size as u64;

        let mut best: Option<(usize, u32)> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            let needed = seglets_needed(
                candidate.live_bytes() as u64,
                seglet_size,
                self.config.floor_survivor_seglets,
            );
            let allocated = candidate.seglets_allocated();
            if needed < allocated {
                let delta = allocated - needed;
                if best.is_none_or(|(_, best_delta)| delta > best_delta) {
                    best = Some((i, delta));
                }
            }
        }

        // Nothing freeable: either everything really is live, or dead
        // tombstones are inflating the liveness numbers (tombstone
        // liveness is only discovered by asking the handlers, which is
        // exactly what a compaction pass does). Compact the candidate
        // with the most tombstones that has gone longest uncompacted,
        // at zero promised gain, to shake the accounting loose.
        if best.is_none() {
            let now = wall_seconds();
            let mut best_goodness: u128 = 0;
            for (i, candidate) in candidates.iter().enumerate() {
                let tombstones = candidate.entry_count(EntryType::Tombstone) as u128;
                let since = now.saturating_sub(candidate.last_compaction_timestamp()) as u128;
                let goodness = tombstones * since;
                if goodness > best_goodness {
                    best = Some((i, 0));
                    best_goodness = goodness;
                }
            }
            if best.is_some() {
                self.metrics.in_memory.tombstone_fallback_passes(1);
            }
        }

        let (index, delta) = best?;
        let segment = candidates.swap_remove(index);
        segment.note_compaction_attempt(wall_seconds());
        Some((segment, delta))
    }

    // ========== Disk cleaning ==========

    /// Clean a batch of victims off disk. Returns whether any victim was
    /// cleaned.
    fn do_disk_cleaning(&self, low_on_disk: bool) -> bool {
        let victims = self.segments_to_clean();
        if victims.is_empty() {
            return false;
        }

        let seglet_size = self.config.seglet_size;
        let mut max_live_bytes = 0u64;
        let mut seglets_before = 0u32;
        for victim in &victims {
            let live = victim.live_bytes();
            if live == 0 {
                self.metrics.on_disk.empty_segments_cleaned(1);
            }
            max_live_bytes += live as u64;
            seglets_before += victim.seglets_allocated();
        }

        let entries = self.sorted_entries(&victims);
        let (survivors, entry_bytes_appended) = self.relocate_live_entries(entries);

        // If these do not hold the liveness statistics are wrong, e.g. a
        // free() was issued while the index kept the reference.
        if entry_bytes_appended > max_live_bytes {
            error!(
                appended = entry_bytes_appended,
                max_live = max_live_bytes,
                "disk pass relocated more bytes than the victims held live"
            );
            panic!("invariant violation: relocated bytes exceed live bytes");
        }
        let seglets_after: u32 = survivors.iter().map(|s| s.seglets_allocated()).sum();
        assert!(seglets_before >= seglets_after, "disk pass grew memory");
        assert!(victims.len() >= survivors.len(), "disk pass grew the log");

        let memory_bytes_freed = ((seglets_before - seglets_after) * seglet_size) as u64;
        let disk_bytes_freed = (victims.len() - survivors.len()) as u64
            * self.config.segment_size as u64;
        self.metrics.on_disk.memory_bytes_freed(memory_bytes_freed);
        self.metrics.on_disk.disk_bytes_freed(disk_bytes_freed);
        self.metrics.on_disk.segments_cleaned(victims.len() as u64);
        self.metrics.on_disk.survivors_created(survivors.len() as u64);
        self.metrics.on_disk.runs(1);
        if low_on_disk {
            self.metrics.on_disk.low_disk_space_runs(1);
        }

        debug!(
            victims = victims.len(),
            survivors = survivors.len(),
            memory_bytes_freed,
            disk_bytes_freed,
            "disk cleaning pass complete"
        );

        self.manager.cleaning_complete(&victims, &survivors);
        true
    }

    /// Select victims by descending cost-benefit until the pass holds
    /// `MAX_LIVE_SEGMENTS_PER_DISK_PASS` segments' worth of live bytes.
    fn segments_to_clean(&self) -> Vec<Arc<Segment>> {
        let mut candidates = self.candidates.lock();

        let version = self.sort_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let now = wall_seconds();
        candidates.sort_by(|a, b| {
            let a = self.cost_benefit(a, now, version);
            let b = self.cost_benefit(b, now, version);
            b.cmp(&a)
        });

        let max_live_bytes =
            MAX_LIVE_SEGMENTS_PER_DISK_PASS as u64 * self.config.segment_size as u64;
        let mut total_live = 0u64;
        let mut chosen_indices = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            // A survivor packed past this bound could not be compacted
            // again, wedging future memory reclamation; skip sources that
            // would produce one.
            if candidate.memory_utilization() > MAX_CLEANABLE_MEMORY_UTILIZATION {
                continue;
            }
            let live = candidate.live_bytes() as u64;
            if total_live + live > max_live_bytes {
                break;
            }
            total_live += live;
            chosen_indices.push(i);
        }

        let mut chosen = Vec::with_capacity(chosen_indices.len());
        for i in chosen_indices.into_iter().rev() {
            let victim = candidates.swap_remove(i);
            victim.try_set_state(State::Cleanable, State::Cleaning);
            chosen.push(victim);
        }
        chosen
    }

    /// Cached cost-benefit: `(100 - u) * age / u`, infinity at zero
    /// utilization. The per-sort version tag keeps the comparison a
    /// strict weak order while statistics change underneath.
    fn cost_benefit(&self, segment: &Segment, now: u32, version: u64) -> u64 {
        let (cached, cached_version) = segment.cached_cost_benefit();
        if cached_version == version {
            return cached;
        }

        let utilization = segment.disk_utilization() as u64;
        let value = if utilization == 0 {
            u64::MAX
        } else {
            let mut timestamp = segment.creation_timestamp();
            // Possible with unsynchronized clocks, or recovered data
            // stamped by a different master.
            if timestamp > now {
                warn!(
                    segment = segment.id(),
                    timestamp, now, "segment creation timestamp in the future"
                );
                timestamp = now;
            }
            let age = (now - timestamp) as u64;
            100u64.saturating_sub(utilization) * age / utilization
        };

        segment.cache_cost_benefit(value, version);
        value
    }

    /// Collect every victim entry with its handler timestamp, oldest
    /// first. Sorting by age segregates cold data from hot, which lowers
    /// the cost of future passes.
    fn sorted_entries(&self, victims: &[Arc<Segment>]) -> Vec<DiskEntry> {
        let mut entries = Vec::new();
        for victim in victims {
            for entry in victim.iter() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => self.fatal_corruption(victim, e),
                };
                if entry.entry_type.is_segment_metadata() {
                    continue;
                }
                let timestamp = self.handlers.timestamp(entry.entry_type, &entry.payload);
                entries.push(DiskEntry {
                    segment: Arc::clone(victim),
                    offset: entry.offset,
                    timestamp,
                });
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Relocate entries in timestamp order into a chain of survivors,
    /// then sync every survivor to its backups.
    fn relocate_live_entries(&self, entries: Vec<DiskEntry>) -> (Vec<Arc<Segment>>, u64) {
        let mut survivors: Vec<Arc<Segment>> = Vec::new();
        let mut survivor: Option<Arc<Segment>> = None;
        let mut survivor_is_empty = false;
        let mut batch_bytes = 0u32;
        let mut entry_bytes = 0u64;

        for entry in entries {
            let (ty, payload) = match entry.segment.get_entry(entry.offset) {
                Ok(pair) => pair,
                Err(e) => self.fatal_corruption(&entry.segment, e),
            };
            let old_ref = Reference::new(entry.segment.id(), entry.offset);

            loop {
                let status = self.relocate_entry(
                    ty,
                    &payload,
                    old_ref,
                    survivor.as_deref(),
                    &self.metrics.on_disk.scans,
                );
                match status {
                    RelocStatus::Relocated(wire) => {
                        batch_bytes += wire;
                        entry_bytes += wire as u64;
                        survivor_is_empty = false;
                        break;
                    }
                    RelocStatus::Dead => break,
                    RelocStatus::Failed => {
                        if survivor_is_empty {
                            // Entries are bounded by max_append_size, so
                            // a full-sized empty survivor always fits one.
                            error!(
                                entry_bytes = payload.len(),
                                "entry did not fit an empty survivor"
                            );
                            panic!("invariant violation: entry larger than a survivor segment");
                        }
                        if let Some(full) = survivor.take() {
                            full.add_live_bytes(batch_bytes);
                            batch_bytes = 0;
                            self.close_survivor(&full);
                        }
                        // May block on the survivor reserve.
                        let fresh = self.manager.alloc_side_segment(None);
                        survivors.push(Arc::clone(&fresh));
                        survivor = Some(fresh);
                        survivor_is_empty = true;
                    }
                }
            }
        }

        if let Some(last) = survivor.take() {
            last.add_live_bytes(batch_bytes);
            self.close_survivor(&last);
        }

        // Survivors must be durable before the victims can be freed.
        for survivor in &survivors {
            self.sync_survivor(survivor);
        }

        (survivors, entry_bytes)
    }

    /// Ask the handlers about one entry and move it if still live.
    fn relocate_entry(
        &self,
        ty: EntryType,
        payload: &[u8],
        old_ref: Reference,
        survivor: Option<&Segment>,
        scans: &ScanCounters,
    ) -> RelocStatus {
        let wire = wire_len(payload.len()) as u32;

        if !self.handlers.check_liveness(ty, payload) {
            scans.note_scanned(ty.as_u8() as usize, wire as u64, false);
            return RelocStatus::Dead;
        }

        let Some(survivor) = survivor else {
            return RelocStatus::Failed;
        };
        let Some(offset) = survivor.append_unconfirmed(ty, payload) else {
            return RelocStatus::Failed;
        };

        let new_ref = Reference::new(survivor.id(), offset);
        if self.handlers.relocate(ty, old_ref, new_ref) {
            survivor.confirm_relocation(ty, payload);
            scans.note_scanned(ty.as_u8() as usize, wire as u64, true);
            RelocStatus::Relocated(wire)
        } else {
            // The entry died between the liveness check and the index
            // swap; take the copy back out of the survivor.
            survivor.rollback_relocation(offset, payload.len());
            scans.note_scanned(ty.as_u8() as usize, wire as u64, false);
            RelocStatus::Dead
        }
    }

    /// Close a filled survivor: start its replication (overlapping backup
    /// writes with filling the next survivor) and return unused seglets.
    fn close_survivor(&self, survivor: &Arc<Segment>) {
        survivor.close();
        if let Some(replica) = survivor.replica() {
            replica.close();
        }

        let in_use = survivor
            .appended_length()
            .div_ceil(self.config.seglet_size)
            .max(1);
        let unused = survivor.seglets_allocated().saturating_sub(in_use);
        if !survivor.free_unused_seglets(unused) {
            panic!("invariant violation: survivor trim failed");
        }

        self.metrics
            .on_disk
            .bytes_appended_to_survivors(survivor.appended_length() as u64);
    }

    /// Wait until a survivor's backups acknowledge its full length,
    /// retrying with capped exponential backoff. Data is never dropped:
    /// an unavailable backup stalls the pass, it does not abort it.
    fn sync_survivor(&self, survivor: &Arc<Segment>) {
        let replica = survivor
            .replica()
            .expect("disk survivors always carry a replication handle");
        let length = survivor.appended_length();

        let mut backoff = Duration::from_millis(1);
        loop {
            match replica.sync(length) {
                Ok(()) => return,
                Err(e) => {
                    self.metrics.on_disk.sync_retries(1);
                    warn!(
                        survivor = survivor.id(),
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "survivor sync failed; retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }

    /// Corruption discovered while cleaning. The segment is poisoned by
    /// the failed read; the master's data can no longer be trusted.
    fn fatal_corruption(&self, segment: &Segment, e: LogError) -> ! {
        error!(segment = segment.id(), error = %e, "corrupt segment encountered by cleaner");
        panic!("fatal: {e}");
    }
}

struct DiskEntry {
    segment: Arc<Segment>,
    offset: u32,
    timestamp: u32,
}
