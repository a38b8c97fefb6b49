//! Seglet pool: fixed-size memory blocks backing segments.
//!
//! The allocator owns one contiguous heap carved into seglets. Two free
//! lists partition the seglets:
//!
//! - **general pool**: serves foreground head segments
//! - **survivor reserve**: serves cleaner survivor allocations only
//!
//! The reserve is what guarantees the cleaner forward progress: foreground
//! appends can exhaust the general pool, but never the seglets the cleaner
//! needs to relocate live data out of its victims.

use crate::config::LogConfig;
use parking_lot::{Condvar, Mutex};
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Which free list an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPool {
    /// General pool; used for foreground head segments.
    Default,
    /// Survivor reserve, falling back to the general pool when the reserve
    /// runs dry. Used only by the cleaner.
    CleanerReserve,
}

/// A fixed-size memory block handed out by the [`SegletAllocator`].
///
/// Seglets are move-only handles; returning one to the allocator transfers
/// it back to a free list. The backing memory outlives every handle because
/// the allocator is dropped last (segments hold an `Arc` to it).
pub struct Seglet {
    index: u32,
    ptr: NonNull<u8>,
    len: u32,
}

// SAFETY: a seglet is an exclusive handle to a disjoint heap region; the
// bytes it points at are only reached through &self methods on Segment,
// which synchronize via atomics.
unsafe impl Send for Seglet {}
unsafe impl Sync for Seglet {}

impl Seglet {
    /// Index of this seglet within the allocator's heap.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Size of this seglet in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the seglet is zero-sized (never true in practice).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the seglet's bytes.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl std::fmt::Debug for Seglet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seglet")
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

struct FreeLists {
    /// General pool, a stack of seglet indices.
    free: Vec<u32>,
    /// Survivor reserve, refilled before the general pool on `free`.
    reserve: Vec<u32>,
    /// Target size of the reserve; 0 until the cleaner initializes it.
    reserve_target: u32,
}

/// Pool of fixed-size seglets backed by one contiguous heap allocation.
///
/// # Thread Safety
///
/// Free lists live under a mutex; a condvar wakes blocked cleaner
/// allocations when seglets return. Allocation happens on head rollover
/// and survivor creation only, so the lock is not on the append hot path.
pub struct SegletAllocator {
    heap: NonNull<u8>,
    layout: Layout,
    seglet_size: u32,
    total: u32,
    lists: Mutex<FreeLists>,
    returned: Condvar,
}

// SAFETY: the heap is allocated once and freed only on drop; all mutable
// access to free lists is mutex-guarded, and seglet bytes are synchronized
// by the segments that own the handles.
unsafe impl Send for SegletAllocator {}
unsafe impl Sync for SegletAllocator {}

impl SegletAllocator {
    /// Allocate the heap and populate the general pool with every seglet.
    pub fn new(config: &LogConfig) -> Self {
        let seglet_size = config.seglet_size;
        let total = config.total_seglets();
        let bytes = total as usize * seglet_size as usize;
        let layout = Layout::from_size_align(bytes.max(1), 64).expect("heap layout");

        let heap = unsafe { alloc_zeroed(layout) };
        let heap = match NonNull::new(heap) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };

        // Stack order makes the lowest indices come out first, which keeps
        // early tests deterministic; nothing depends on it.
        let free: Vec<u32> = (0..total).rev().collect();

        Self {
            heap,
            layout,
            seglet_size,
            total,
            lists: Mutex::new(FreeLists {
                free,
                reserve: Vec::new(),
                reserve_target: 0,
            }),
            returned: Condvar::new(),
        }
    }

    /// Move `count` seglets from the general pool into the survivor
    /// reserve and set the reserve's refill target.
    ///
    /// Called once at cleaner startup. Returns `false` if the pool cannot
    /// spare `count` seglets or the reserve was already initialized.
    pub fn initialize_survivor_reserve(&self, count: u32) -> bool {
        let mut lists = self.lists.lock();
        if lists.reserve_target != 0 {
            return false;
        }
        if lists.free.len() < count as usize {
            return false;
        }
        let split = lists.free.len() - count as usize;
        let moved = lists.free.split_off(split);
        lists.reserve = moved;
        lists.reserve_target = count;
        true
    }

    /// Try to allocate `count` seglets from the given pool.
    ///
    /// `CleanerReserve` draws the reserve first and falls back to the
    /// general pool; `Default` never touches the reserve. Returns `None`
    /// without partial allocation if `count` seglets are not available.
    pub fn try_alloc(&self, count: u32, pool: AllocPool) -> Option<Vec<Seglet>> {
        let mut lists = self.lists.lock();
        self.take(&mut lists, count, pool)
    }

    /// Allocate `count` seglets, blocking until they become available.
    ///
    /// Callers may suspend here indefinitely; only the cleaner uses this,
    /// and only for survivor allocations backed by the reserve, which
    /// bounds the wait to the completion of an in-flight cleaning pass.
    pub fn alloc_blocking(&self, count: u32, pool: AllocPool) -> Vec<Seglet> {
        let mut lists = self.lists.lock();
        loop {
            if let Some(seglets) = self.take(&mut lists, count, pool) {
                return seglets;
            }
            // Checked and waited under one lock, so a concurrent free
            // cannot slip its notification in between.
            self.returned.wait(&mut lists);
        }
    }

    fn take(&self, lists: &mut FreeLists, count: u32, pool: AllocPool) -> Option<Vec<Seglet>> {
        let available = match pool {
            AllocPool::Default => lists.free.len(),
            AllocPool::CleanerReserve => lists.free.len() + lists.reserve.len(),
        };
        if available < count as usize {
            return None;
        }

        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = match pool {
                AllocPool::Default => lists.free.pop(),
                AllocPool::CleanerReserve => lists.reserve.pop().or_else(|| lists.free.pop()),
            }
            .expect("availability checked above");
            out.push(self.seglet(index));
        }
        Some(out)
    }

    /// Return seglets to the allocator. The reserve refills up to its
    /// target before the general pool receives any.
    pub fn free(&self, seglets: Vec<Seglet>) {
        if seglets.is_empty() {
            return;
        }
        let mut lists = self.lists.lock();
        for seglet in seglets {
            if (lists.reserve.len() as u32) < lists.reserve_target {
                lists.reserve.push(seglet.index);
            } else {
                lists.free.push(seglet.index);
            }
        }
        drop(lists);
        self.returned.notify_all();
    }

    /// Total number of seglets in the heap.
    #[inline]
    pub fn total_seglets(&self) -> u32 {
        self.total
    }

    /// Size of one seglet in bytes.
    #[inline]
    pub fn seglet_size(&self) -> u32 {
        self.seglet_size
    }

    /// Seglets currently in the general pool.
    pub fn free_seglets(&self) -> u32 {
        self.lists.lock().free.len() as u32
    }

    /// Seglets currently parked in the survivor reserve.
    pub fn reserve_seglets(&self) -> u32 {
        self.lists.lock().reserve.len() as u32
    }

    /// Memory utilization as a percentage of the general (non-reserve)
    /// capacity. This is the figure cleaner policy compares against
    /// `MIN_MEMORY_UTILIZATION`.
    pub fn memory_utilization(&self) -> u32 {
        let lists = self.lists.lock();
        let usable = self.total.saturating_sub(lists.reserve_target);
        if usable == 0 {
            return 100;
        }
        let in_use = usable.saturating_sub(lists.free.len() as u32);
        in_use * 100 / usable
    }

    fn seglet(&self, index: u32) -> Seglet {
        debug_assert!(index < self.total);
        let offset = index as usize * self.seglet_size as usize;
        // SAFETY: index < total, so the offset stays inside the heap.
        let ptr = unsafe { NonNull::new_unchecked(self.heap.as_ptr().add(offset)) };
        Seglet {
            index,
            ptr,
            len: self.seglet_size,
        }
    }
}

impl Drop for SegletAllocator {
    fn drop(&mut self) {
        // SAFETY: heap was allocated with this layout in new() and is
        // freed exactly once.
        unsafe { dealloc(self.heap.as_ptr(), self.layout) };
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn allocator(total_seglets: u32) -> SegletAllocator {
        let config = LogConfig::new()
            .with_seglet_size(4096)
            .with_segment_size(16 * 4096)
            .with_heap_size(total_seglets as usize * 4096);
        SegletAllocator::new(&config)
    }

    #[test]
    fn alloc_and_free() {
        let pool = allocator(32);
        assert_eq!(pool.free_seglets(), 32);

        let seglets = pool.try_alloc(16, AllocPool::Default).expect("alloc");
        assert_eq!(seglets.len(), 16);
        assert_eq!(pool.free_seglets(), 16);

        pool.free(seglets);
        assert_eq!(pool.free_seglets(), 32);
    }

    #[test]
    fn alloc_fails_without_partial_grab() {
        let pool = allocator(8);
        assert!(pool.try_alloc(9, AllocPool::Default).is_none());
        assert_eq!(pool.free_seglets(), 8);
    }

    #[test]
    fn reserve_is_invisible_to_default_pool() {
        let pool = allocator(32);
        assert!(pool.initialize_survivor_reserve(8));
        assert_eq!(pool.free_seglets(), 24);
        assert_eq!(pool.reserve_seglets(), 8);

        assert!(pool.try_alloc(25, AllocPool::Default).is_none());
        let seglets = pool.try_alloc(25, AllocPool::CleanerReserve).expect("reserve");
        assert_eq!(seglets.len(), 25);
        pool.free(seglets);
    }

    #[test]
    fn reserve_initializes_once() {
        let pool = allocator(32);
        assert!(pool.initialize_survivor_reserve(8));
        assert!(!pool.initialize_survivor_reserve(8));
    }

    #[test]
    fn freed_seglets_refill_reserve_first() {
        let pool = allocator(16);
        assert!(pool.initialize_survivor_reserve(4));

        let from_reserve = pool.try_alloc(4, AllocPool::CleanerReserve).expect("alloc");
        assert_eq!(pool.reserve_seglets(), 0);

        pool.free(from_reserve);
        assert_eq!(pool.reserve_seglets(), 4);
        assert_eq!(pool.free_seglets(), 12);
    }

    #[test]
    fn utilization_ignores_reserve() {
        let pool = allocator(20);
        assert!(pool.initialize_survivor_reserve(4));
        assert_eq!(pool.memory_utilization(), 0);

        let seglets = pool.try_alloc(8, AllocPool::Default).expect("alloc");
        assert_eq!(pool.memory_utilization(), 50);
        pool.free(seglets);
    }

    #[test]
    fn seglets_are_distinct_regions() {
        let pool = allocator(4);
        let seglets = pool.try_alloc(4, AllocPool::Default).expect("alloc");
        let mut ptrs: Vec<_> = seglets.iter().map(|s| s.as_ptr() as usize).collect();
        ptrs.sort_unstable();
        ptrs.dedup();
        assert_eq!(ptrs.len(), 4);
        pool.free(seglets);
    }
}
