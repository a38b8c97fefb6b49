//! Segment ownership and lifecycle.
//!
//! The manager is the hub between the log facade and the cleaner: it
//! assigns segment ids, installs the head, tracks which segments are
//! cleanable, serves survivor allocations, and commits the results of
//! cleaning passes.
//!
//! # Redirection
//!
//! Compaction replaces a segment with a repacked survivor under a new id.
//! References issued before the swap still carry the old id, so the
//! manager keeps a redirection table from retired ids to their current
//! ones. Writers update it under the manager mutex; readers resolve
//! against a lock-free [`ArcSwap`] snapshot.

use crate::config::{LogConfig, MAX_CLEANABLE_MEMORY_UTILIZATION};
use crate::entry::{SegmentHeader, wire_len};
use crate::error::{LogError, LogResult};
use crate::replica::ReplicaManager;
use crate::seglet::{AllocPool, SegletAllocator};
use crate::segment::{FOOTER_WIRE, Segment, State, wall_seconds};
use ahash::RandomState;
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
struct SegmentTable {
    by_id: HashMap<u64, Arc<Segment>, RandomState>,
    /// Retired id -> current id. Writers compress chains, so lookups
    /// follow at most a short path.
    redirect: HashMap<u64, u64, RandomState>,
}

struct ManagerInner {
    next_id: u64,
    /// Retired heads waiting for backup acknowledgement.
    pending_sync: Vec<Arc<Segment>>,
    /// Cleanable segments not yet handed to the cleaner.
    newly_cleanable: Vec<Arc<Segment>>,
}

/// Owns every live segment and arbitrates state transitions.
pub struct SegmentManager {
    config: LogConfig,
    allocator: Arc<SegletAllocator>,
    replica_manager: Arc<dyn ReplicaManager>,
    inner: Mutex<ManagerInner>,
    table: ArcSwap<SegmentTable>,
    head: ArcSwapOption<Segment>,
}

impl SegmentManager {
    /// Create a manager with no segments.
    pub fn new(
        config: LogConfig,
        allocator: Arc<SegletAllocator>,
        replica_manager: Arc<dyn ReplicaManager>,
    ) -> Self {
        Self {
            config,
            allocator,
            replica_manager,
            inner: Mutex::new(ManagerInner {
                next_id: 0,
                pending_sync: Vec::new(),
                newly_cleanable: Vec::new(),
            }),
            table: ArcSwap::from_pointee(SegmentTable::default()),
            head: ArcSwapOption::const_empty(),
        }
    }

    /// The seglet allocator backing every segment.
    #[inline]
    pub fn allocator(&self) -> &Arc<SegletAllocator> {
        &self.allocator
    }

    /// The engine configuration.
    #[inline]
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Move `count` seglets into the allocator's survivor reserve.
    /// Called once at cleaner startup.
    pub fn initialize_survivor_reserve(&self, count: u32) -> bool {
        self.allocator.initialize_survivor_reserve(count)
    }

    /// The current head segment, if one is installed.
    pub fn head(&self) -> Option<Arc<Segment>> {
        self.head.load_full()
    }

    /// Install a new head, retiring `previous` toward the cleanable set.
    ///
    /// Callers pass the head they observed full; if another thread
    /// already rolled it, the newer head is returned without allocating.
    pub fn alloc_head(&self, previous: Option<&Arc<Segment>>) -> LogResult<Arc<Segment>> {
        let mut inner = self.inner.lock();

        if let Some(current) = self.head.load_full() {
            match previous {
                Some(prev) if Arc::ptr_eq(&current, prev) => {}
                _ => return Ok(current), // lost the race, or head already exists
            }
        }

        let table = self.table.load();
        if table.by_id.len() >= self.config.max_segments as usize {
            return Err(LogError::OutOfSegments);
        }

        let seglets = self
            .allocator
            .try_alloc(self.config.seglets_per_segment(), AllocPool::Default)
            .ok_or(LogError::OutOfSegments)?;

        let id = inner.next_id;
        inner.next_id += 1;
        let segment = Arc::new(Segment::new(
            id,
            self.config.log_id,
            seglets,
            self.config.segment_size,
            Arc::clone(&self.allocator),
            State::Head,
            wall_seconds(),
        ));
        segment.set_replica(self.replica_manager.open_segment(&segment));

        self.publish(|t| {
            t.by_id.insert(id, Arc::clone(&segment));
        });

        let old = self.head.swap(Some(Arc::clone(&segment)));
        if let Some(old) = old {
            old.close();
            if let Some(replica) = old.replica() {
                replica.close();
            }
            inner.pending_sync.push(old);
        }

        Ok(segment)
    }

    /// Allocate a survivor segment for the cleaner, blocking on the
    /// survivor reserve if necessary.
    ///
    /// With a `hint` (compaction), the survivor inherits the source's
    /// creation timestamp and is sized to hold the source's live bytes at
    /// no more than `MAX_CLEANABLE_MEMORY_UTILIZATION` percent; its
    /// replication handle arrives later, transferred from the source.
    /// Without a hint (disk cleaning), the survivor is full-sized and
    /// opens its own replication handle.
    pub fn alloc_side_segment(&self, hint: Option<&Segment>) -> Arc<Segment> {
        let per_segment = self.config.seglets_per_segment();
        let (count, timestamp) = match hint {
            Some(source) => {
                let live = source.live_bytes() as u64;
                let seglet_size = self.config.seglet_size as u64;
                let needed =
                    seglets_needed(live, seglet_size, self.config.floor_survivor_seglets);
                // The survivor also holds its header entry and footer.
                let overhead = (wire_len(SegmentHeader::SIZE) as u64
                    + FOOTER_WIRE as u64
                    + live)
                    .div_ceil(seglet_size) as u32;
                (
                    needed
                        .max(overhead)
                        .min(per_segment)
                        .min(source.seglets_allocated().max(1)),
                    source.creation_timestamp(),
                )
            }
            None => (per_segment, wall_seconds()),
        };

        // May suspend on the reserve's condvar until an in-flight pass
        // returns seglets. Held locks would deadlock here; hold none.
        let seglets = self.allocator.alloc_blocking(count, AllocPool::CleanerReserve);

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let segment = Arc::new(Segment::new(
            id,
            self.config.log_id,
            seglets,
            self.config.segment_size,
            Arc::clone(&self.allocator),
            State::Survivor,
            timestamp,
        ));
        if hint.is_none() {
            segment.set_replica(self.replica_manager.open_segment(&segment));
        }

        self.publish(|t| {
            t.by_id.insert(id, Arc::clone(&segment));
        });
        drop(inner);
        segment
    }

    /// Append newly cleanable segments to the caller's working list.
    ///
    /// Retired heads become cleanable here once their replicas
    /// acknowledge the full appended length.
    pub fn cleanable_segments(&self, out: &mut Vec<Arc<Segment>>) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut still_pending = Vec::new();
        for segment in inner.pending_sync.drain(..) {
            let synced = segment
                .replica()
                .is_some_and(|r| r.is_synced(segment.appended_length()));
            if synced && segment.try_set_state(State::Immutable, State::Cleanable) {
                inner.newly_cleanable.push(segment);
            } else {
                still_pending.push(segment);
            }
        }
        inner.pending_sync = still_pending;

        out.append(&mut inner.newly_cleanable);
    }

    /// Swap a compacted segment for its survivor.
    ///
    /// The survivor takes over the source's identity for resolution
    /// purposes (via the redirection table) and its replication handle
    /// (the on-disk bytes were not touched). The source's storage returns
    /// to the allocator once the last reader drops it.
    pub fn compaction_complete(&self, source: &Arc<Segment>, survivor: &Arc<Segment>) {
        let mut inner = self.inner.lock();

        debug_assert!(
            survivor.seglets_allocated() <= source.seglets_allocated(),
            "compaction must not grow memory"
        );

        survivor.set_replica_from(source);

        let source_id = source.id();
        let survivor_id = survivor.id();
        self.publish(|t| {
            t.by_id.remove(&source_id);
            // Compress chains so every retired id points directly at the
            // newest copy.
            for target in t.redirect.values_mut() {
                if *target == source_id {
                    *target = survivor_id;
                }
            }
            t.redirect.insert(source_id, survivor_id);
        });

        source.mark_free();
        survivor.try_set_state(State::Immutable, State::Cleanable);

        // The compacted copy is immediately a candidate again.
        inner.newly_cleanable.push(Arc::clone(survivor));
    }

    /// Commit a disk cleaning pass: victims' replicas are freed and their
    /// slots returned; survivors enter the cleanable set.
    ///
    /// This is the only point at which victims become free; until it runs
    /// references into them must still resolve.
    pub fn cleaning_complete(&self, victims: &[Arc<Segment>], survivors: &[Arc<Segment>]) {
        let mut inner = self.inner.lock();

        let victim_ids: Vec<u64> = victims.iter().map(|s| s.id()).collect();
        self.publish(|t| {
            for id in &victim_ids {
                t.by_id.remove(id);
            }
            // Entries relocated out of a victim had their references
            // rewritten by the index; ids resolving to a victim are dead.
            t.redirect
                .retain(|_, target| !victim_ids.contains(target));
        });

        for victim in victims {
            if let Some(replica) = victim.replica() {
                replica.free();
            }
            victim.take_replica();
            victim.mark_free();
        }

        for survivor in survivors {
            survivor.try_set_state(State::Immutable, State::Cleanable);
            inner.newly_cleanable.push(Arc::clone(survivor));
        }
    }

    /// Resolve a possibly retired segment id to the segment currently
    /// holding its data. Lock-free.
    pub fn resolve(&self, mut id: u64) -> Option<Arc<Segment>> {
        let table = self.table.load();
        loop {
            if let Some(segment) = table.by_id.get(&id) {
                return Some(Arc::clone(segment));
            }
            id = *table.redirect.get(&id)?;
        }
    }

    /// Resolve a segment id without following redirection. Lock-free.
    ///
    /// The free path uses this: an index that swaps references
    /// atomically only ever hands out current ones, so a reference whose
    /// segment has been replaced names an entry the cleaner already
    /// dropped, and its debit must not land on the replacement.
    pub fn resolve_exact(&self, id: u64) -> Option<Arc<Segment>> {
        self.table.load().by_id.get(&id).cloned()
    }

    /// Install a segment reconstructed from replicated bytes.
    ///
    /// Used during replay; segments must arrive in ascending id order.
    pub fn install_replayed(&self, segment: Arc<Segment>) -> LogResult<()> {
        let mut inner = self.inner.lock();
        let id = segment.id();
        if self.table.load().by_id.contains_key(&id) {
            return Err(LogError::InvariantViolation("replayed segment id collision"));
        }
        inner.next_id = inner.next_id.max(id + 1);
        self.publish(|t| {
            t.by_id.insert(id, Arc::clone(&segment));
        });
        segment.try_set_state(State::Immutable, State::Cleanable);
        inner.newly_cleanable.push(segment);
        Ok(())
    }

    /// Number of live segments (head, immutable, cleanable, cleaning).
    pub fn segment_count(&self) -> usize {
        self.table.load().by_id.len()
    }

    /// Percentage of backup segment slots in use.
    pub fn disk_utilization(&self) -> u32 {
        (self.segment_count() as u64 * 100 / self.config.max_segments as u64) as u32
    }

    /// Clone-and-swap the lock-free table. Callers hold the inner mutex,
    /// which serializes writers.
    fn publish<F: FnOnce(&mut SegmentTable)>(&self, mutate: F) {
        let mut table = (*self.table.load_full()).clone();
        mutate(&mut table);
        self.table.store(Arc::new(table));
    }
}

/// Seglets required to hold `live` bytes at no more than
/// `MAX_CLEANABLE_MEMORY_UTILIZATION` percent utilization.
///
/// Integer ceiling, then a second integer division; the arithmetic
/// rounds to zero when there are no live bytes, and `floor` clamps that
/// to one seglet (see `LogConfig::floor_survivor_seglets`).
pub(crate) fn seglets_needed(live: u64, seglet_size: u64, floor: bool) -> u32 {
    let raw = live.div_ceil(seglet_size) * 100 / MAX_CLEANABLE_MEMORY_UTILIZATION as u64;
    if floor { raw.max(1) as u32 } else { raw as u32 }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::entry::EntryType;
    use crate::replica::InMemoryReplicaManager;

    fn small_config() -> LogConfig {
        LogConfig::new()
            .with_seglet_size(4096)
            .with_segment_size(8 * 4096)
            .with_heap_size(64 * 4096)
            .with_max_segments(32)
    }

    fn manager_with(config: LogConfig) -> (SegmentManager, InMemoryReplicaManager) {
        let allocator = Arc::new(SegletAllocator::new(&config));
        let replicas = InMemoryReplicaManager::new();
        (
            SegmentManager::new(config, allocator, Arc::new(replicas.clone())),
            replicas,
        )
    }

    #[test]
    fn head_allocation_and_rollover() {
        let (manager, _) = manager_with(small_config());

        let head = manager.alloc_head(None).expect("first head");
        assert_eq!(head.state(), State::Head);
        assert_eq!(manager.segment_count(), 1);

        let next = manager.alloc_head(Some(&head)).expect("roll");
        assert_ne!(next.id(), head.id());
        assert_eq!(head.state(), State::Immutable);
        assert_eq!(manager.head().expect("head").id(), next.id());
    }

    #[test]
    fn rollover_race_returns_existing_head() {
        let (manager, _) = manager_with(small_config());
        let head = manager.alloc_head(None).expect("head");

        // A thread that never saw `head` as full must get it back.
        let same = manager.alloc_head(None).expect("no-op roll");
        assert!(Arc::ptr_eq(&head, &same));
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let (manager, _) = manager_with(small_config());
        let mut prev = manager.alloc_head(None).expect("head");
        for _ in 0..3 {
            let next = manager.alloc_head(Some(&prev)).expect("roll");
            assert!(next.id() > prev.id());
            prev = next;
        }
    }

    #[test]
    fn retired_heads_become_cleanable_once_synced() {
        let (manager, _) = manager_with(small_config());
        let head = manager.alloc_head(None).expect("head");
        manager.alloc_head(Some(&head)).expect("roll");

        let mut cleanable = Vec::new();
        manager.cleanable_segments(&mut cleanable);
        assert_eq!(cleanable.len(), 1);
        assert!(Arc::ptr_eq(&cleanable[0], &head));
        assert_eq!(head.state(), State::Cleanable);

        // Draining is one-shot.
        let mut again = Vec::new();
        manager.cleanable_segments(&mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn side_segment_sizing_follows_live_bytes() {
        let config = small_config();
        let (manager, _) = manager_with(config.clone());
        let head = manager.alloc_head(None).expect("head");

        // One seglet's worth of live bytes needs two seglets at 98%.
        head.add_live_bytes(config.seglet_size);
        let survivor = manager.alloc_side_segment(Some(&head));
        assert_eq!(survivor.state(), State::Survivor);
        assert!(survivor.seglets_allocated() <= head.seglets_allocated());
        assert_eq!(survivor.creation_timestamp(), head.creation_timestamp());
    }

    #[test]
    fn compaction_redirects_resolution() {
        let (manager, _) = manager_with(small_config());
        let source = manager.alloc_head(None).expect("head");
        manager.alloc_head(Some(&source)).expect("roll");

        source.add_live_bytes(100);
        let survivor = manager.alloc_side_segment(Some(&source));
        survivor.close();
        manager.compaction_complete(&source, &survivor);

        let resolved = manager.resolve(source.id()).expect("resolve old id");
        assert_eq!(resolved.id(), survivor.id());
        assert_eq!(source.state(), State::Free);
        assert_eq!(survivor.state(), State::Cleanable);
    }

    #[test]
    fn chained_compactions_compress_redirects() {
        let (manager, _) = manager_with(small_config());
        let s0 = manager.alloc_head(None).expect("head");
        manager.alloc_head(Some(&s0)).expect("roll");

        let s1 = manager.alloc_side_segment(Some(&s0));
        s1.close();
        manager.compaction_complete(&s0, &s1);

        let s2 = manager.alloc_side_segment(Some(&s1));
        s2.close();
        manager.compaction_complete(&s1, &s2);

        assert_eq!(manager.resolve(s0.id()).expect("resolve").id(), s2.id());
        assert_eq!(manager.resolve(s1.id()).expect("resolve").id(), s2.id());
    }

    #[test]
    fn cleaning_complete_frees_replicas_and_slots() {
        let (manager, replicas) = manager_with(small_config());
        let victim = manager.alloc_head(None).expect("head");
        manager.alloc_head(Some(&victim)).expect("roll");
        assert!(replicas.replica_bytes(victim.id()).is_some());

        let survivor = manager.alloc_side_segment(None);
        survivor.close();
        if let Some(r) = survivor.replica() {
            r.close();
        }

        let before = manager.segment_count();
        manager.cleaning_complete(
            std::slice::from_ref(&victim),
            std::slice::from_ref(&survivor),
        );
        assert_eq!(manager.segment_count(), before - 1);
        assert!(replicas.replica_bytes(victim.id()).is_none());
        assert!(manager.resolve(victim.id()).is_none());
        assert_eq!(survivor.state(), State::Cleanable);
    }

    #[test]
    fn freed_victim_seglets_return_to_allocator() {
        let (manager, _) = manager_with(small_config());
        let free_before = {
            let a = manager.allocator();
            a.free_seglets() + a.reserve_seglets()
        };

        let victim = manager.alloc_head(None).expect("head");
        manager.alloc_head(Some(&victim)).expect("roll");

        // Drain the cleanable set so the manager holds no reference.
        let mut cleanable = Vec::new();
        manager.cleanable_segments(&mut cleanable);

        manager.cleaning_complete(std::slice::from_ref(&victim), &[]);

        // Drop the final strong references; RAII returns the seglets.
        assert!(victim.seglets_allocated() > 0);
        drop(cleanable);
        drop(victim);

        let a = manager.allocator();
        let head_seglets = manager.config().seglets_per_segment();
        assert_eq!(
            a.free_seglets() + a.reserve_seglets(),
            free_before - head_seglets
        );
    }

    #[test]
    fn seglets_needed_arithmetic() {
        // The ceiling happens before the 100/98 scaling, so small counts
        // are unchanged by the utilization bound (100 / 98 == 1).
        assert_eq!(seglets_needed(4096, 4096, true), 1);
        assert_eq!(seglets_needed(2 * 4096, 4096, true), 2);
        assert_eq!(seglets_needed(100, 4096, true), 1);
        // 49 seglets of live bytes cross the bound: 4900 / 98 == 50.
        assert_eq!(seglets_needed(49 * 4096, 4096, true), 50);
        // The raw arithmetic rounds to zero; the floor clamps it.
        assert_eq!(seglets_needed(0, 4096, false), 0);
        assert_eq!(seglets_needed(0, 4096, true), 1);
    }

    #[test]
    fn disk_utilization_counts_slots() {
        let config = small_config().with_max_segments(4);
        let (manager, _) = manager_with(config);
        assert_eq!(manager.disk_utilization(), 0);
        let head = manager.alloc_head(None).expect("head");
        assert_eq!(manager.disk_utilization(), 25);
        manager.alloc_head(Some(&head)).expect("roll");
        assert_eq!(manager.disk_utilization(), 50);
    }

    #[test]
    fn head_allocation_respects_max_segments() {
        let config = small_config().with_max_segments(2);
        let (manager, _) = manager_with(config);
        let h0 = manager.alloc_head(None).expect("head");
        let h1 = manager.alloc_head(Some(&h0)).expect("roll");
        assert_eq!(
            manager.alloc_head(Some(&h1)).expect_err("slots exhausted"),
            LogError::OutOfSegments
        );
    }
}
