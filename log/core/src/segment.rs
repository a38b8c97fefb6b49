//! Seglet-backed append-only segment.
//!
//! A segment is a logical byte sequence backed by N seglets. Entries are
//! appended sequentially and may straddle seglet boundaries, but never
//! segment boundaries.
//!
//! # Memory Layout
//!
//! ```text
//! seglet 0           seglet 1           seglet 2
//! +------------------+------------------+------------------+
//! | header | e1 | e2   ... e2 | e3 |      [unused]         |
//! +------------------+------------------+------------------+
//! ^                              ^                         ^
//! 0                          committed                 capacity
//! ```
//!
//! # Concurrency
//!
//! Appends reserve space with a CAS on `tail`, copy the payload, then
//! publish by advancing `committed` in reservation order. Readers only
//! observe bytes below an acquire-load of `committed`, so the payload copy
//! needs no lock. The running crc32c is updated inside the commit window,
//! which admits exactly one thread at a time.

use crate::entry::{
    CRC32C, ENTRY_TYPE_COUNT, EntryType, SegmentFooter, SegmentHeader, decode_varint,
    encode_varint, wire_len,
};
use crate::error::{LogError, LogResult};
use crate::reference::Reference;
use crate::replica::ReplicatedSegment;
use crate::seglet::{Seglet, SegletAllocator};
use crate::sync::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;

/// Wire size of the trailing footer entry, reserved out of every segment.
pub(crate) const FOOTER_WIRE: u32 = (1 + 1 + SegmentFooter::SIZE) as u32;

/// High bit of `tail`, set by `close()` to freeze reservations. Offsets
/// are bounded by the 24-bit reference format, so the bit is always free.
const TAIL_CLOSED: u32 = 1 << 31;

/// State of a segment in its lifecycle.
///
/// ```text
/// Free -> Head ------> Immutable -> Cleanable -> Cleaning -> Free
///     \-> Survivor --/
/// ```
///
/// - **Free**: in the allocator, no identity
/// - **Head**: the single log head accepting foreground appends
/// - **Survivor**: side segment being filled by the cleaner
/// - **Immutable**: closed; awaiting durable replication
/// - **Cleanable**: durably replicated, eligible for cleaning
/// - **Cleaning**: owned by a cleaner pass; no new references created
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Storage returned to the allocator.
    Free = 0,
    /// Accepting foreground appends.
    Head = 1,
    /// Side segment accepting cleaner relocations.
    Survivor = 2,
    /// Closed, no more appends.
    Immutable = 3,
    /// Durably replicated, eligible for cleaning.
    Cleanable = 4,
    /// Owned by an in-flight cleaner pass.
    Cleaning = 5,
}

impl State {
    /// Convert from raw u8 value.
    ///
    /// # Panics
    /// Panics if the value is not a valid state (0-5).
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Free,
            1 => State::Head,
            2 => State::Survivor,
            3 => State::Immutable,
            4 => State::Cleanable,
            5 => State::Cleaning,
            _ => panic!("invalid segment state value: {}", value),
        }
    }

    /// Check if the segment accepts appends.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, State::Head | State::Survivor)
    }
}

/// One decoded entry yielded by [`Segment::iter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    /// Byte offset of the entry's type tag within the segment.
    pub offset: u32,
    /// Entry type.
    pub entry_type: EntryType,
    /// Entry payload, copied out (entries may straddle seglets).
    pub payload: Vec<u8>,
}

struct CrcState {
    /// Running crc32c over committed bytes; consumed when the footer is
    /// stamped. `None` once closed or for replayed segments.
    digest: Option<crc::Digest<'static, u32>>,
    /// Number of committed bytes the digest has absorbed.
    hashed: u32,
}

/// A fixed-size append-only byte region backed by seglets.
///
/// # Thread Safety
///
/// All mutable state is atomic except the seglet handles (mutex, cold
/// path) and the crc state (serialized by the commit protocol).
pub struct Segment {
    id: u64,
    seglet_size: u32,
    /// Full segment size; the denominator of disk utilization.
    full_size: u32,

    /// Raw base pointers of the seglets backing this segment, fixed at
    /// construction. Entries beyond `capacity` are never dereferenced, so
    /// pointers of seglets returned by `free_unused_seglets` go stale
    /// harmlessly.
    ptrs: Vec<*mut u8>,

    /// Seglet handles, surrendered back to the allocator on free.
    backing: Mutex<Vec<Seglet>>,
    allocator: Arc<SegletAllocator>,

    /// Bytes currently backed by seglets.
    capacity: AtomicU32,
    /// Bytes reserved by appenders.
    tail: AtomicU32,
    /// Bytes published to readers.
    committed: AtomicU32,

    state: AtomicU8,
    poisoned: AtomicBool,

    live_bytes: AtomicU32,
    entry_counts: [AtomicU32; ENTRY_TYPE_COUNT],

    /// Wall-clock seconds at creation (inherited by compaction survivors).
    creation_timestamp: u32,
    last_compaction_timestamp: AtomicU32,

    cost_benefit: AtomicU64,
    cost_benefit_version: AtomicU64,

    crc: UnsafeCell<CrcState>,

    /// Backup replication handle; transferred to the survivor when a
    /// segment is compacted in memory.
    replica: Mutex<Option<Arc<dyn ReplicatedSegment>>>,
}

// SAFETY: seglet bytes are only written inside reserved regions and only
// read below `committed` (release/acquire); the crc state is only touched
// by the single thread inside the commit window; everything else is
// atomic or mutex-guarded.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Build a segment over the given seglets and write its header entry.
    pub(crate) fn new(
        id: u64,
        log_id: u64,
        seglets: Vec<Seglet>,
        full_size: u32,
        allocator: Arc<SegletAllocator>,
        state: State,
        creation_timestamp: u32,
    ) -> Self {
        let seglet_size = allocator.seglet_size();
        let ptrs: Vec<*mut u8> = seglets.iter().map(|s| s.as_ptr()).collect();
        let capacity = (seglets.len() as u32) * seglet_size;

        let segment = Self {
            id,
            seglet_size,
            full_size,
            ptrs,
            backing: Mutex::new(seglets),
            allocator,
            capacity: AtomicU32::new(capacity),
            tail: AtomicU32::new(0),
            committed: AtomicU32::new(0),
            state: AtomicU8::new(state as u8),
            poisoned: AtomicBool::new(false),
            live_bytes: AtomicU32::new(0),
            entry_counts: Default::default(),
            creation_timestamp,
            last_compaction_timestamp: AtomicU32::new(creation_timestamp),
            cost_benefit: AtomicU64::new(0),
            cost_benefit_version: AtomicU64::new(0),
            crc: UnsafeCell::new(CrcState {
                digest: Some(CRC32C.digest()),
                hashed: 0,
            }),
            replica: Mutex::new(None),
        };

        let header = SegmentHeader {
            segment_id: id,
            log_id,
            seglet_size,
            segment_size: full_size,
        };
        segment
            .append(EntryType::Header, &header.encode())
            .expect("fresh segment must hold its header");
        segment
    }

    /// Reconstruct an immutable segment from a replicated byte range,
    /// verifying its header and footer crc.
    ///
    /// Live statistics are conservatively rebuilt by counting every
    /// object and tombstone entry as live; `free` calls during index
    /// reconstruction correct them downward.
    pub(crate) fn from_bytes(
        bytes: &[u8],
        full_size: u32,
        allocator: Arc<SegletAllocator>,
        expected_log_id: u64,
    ) -> LogResult<Self> {
        let seglet_size = allocator.seglet_size();

        // Parse the header before allocating anything.
        let mut cursor = bytes;
        let (header_entry, consumed) = parse_entry(cursor, 0)
            .ok_or(LogError::CorruptSegment { segment_id: 0, detail: "bad segment header entry" })?;
        if header_entry.entry_type != EntryType::Header {
            return Err(LogError::CorruptSegment {
                segment_id: 0,
                detail: "first entry is not a header",
            });
        }
        let header = SegmentHeader::decode(&header_entry.payload).ok_or(LogError::CorruptSegment {
            segment_id: 0,
            detail: "undecodable segment header",
        })?;
        if header.log_id != expected_log_id || header.seglet_size != seglet_size {
            return Err(LogError::CorruptSegment {
                segment_id: header.segment_id,
                detail: "segment header does not match log geometry",
            });
        }
        cursor = &cursor[consumed..];

        let needed = bytes.len().div_ceil(seglet_size as usize) as u32;
        let seglets = allocator
            .try_alloc(needed.max(1), crate::seglet::AllocPool::Default)
            .ok_or(LogError::OutOfSegments)?;

        let segment = Self {
            id: header.segment_id,
            seglet_size,
            full_size,
            ptrs: seglets.iter().map(|s| s.as_ptr()).collect(),
            backing: Mutex::new(seglets),
            allocator,
            capacity: AtomicU32::new(needed.max(1) * seglet_size),
            tail: AtomicU32::new(bytes.len() as u32 | TAIL_CLOSED),
            committed: AtomicU32::new(0),
            state: AtomicU8::new(State::Immutable as u8),
            poisoned: AtomicBool::new(false),
            live_bytes: AtomicU32::new(0),
            entry_counts: Default::default(),
            creation_timestamp: wall_seconds(),
            last_compaction_timestamp: AtomicU32::new(wall_seconds()),
            cost_benefit: AtomicU64::new(0),
            cost_benefit_version: AtomicU64::new(0),
            crc: UnsafeCell::new(CrcState { digest: None, hashed: bytes.len() as u32 }),
            replica: Mutex::new(None),
        };
        segment.write_bytes(0, bytes);
        segment.committed.store(bytes.len() as u32, Ordering::Release);

        // Walk the remaining entries, rebuilding statistics and locating
        // the footer.
        let mut offset = consumed as u32;
        let mut footer: Option<(u32, SegmentFooter)> = None;
        while !cursor.is_empty() {
            let (entry, consumed) =
                parse_entry(cursor, offset).ok_or_else(|| segment.corrupt("bad entry framing"))?;
            match entry.entry_type {
                EntryType::Footer => {
                    let decoded = SegmentFooter::decode(&entry.payload)
                        .ok_or_else(|| segment.corrupt("undecodable footer"))?;
                    footer = Some((offset, decoded));
                    if consumed != cursor.len() {
                        return Err(segment.corrupt("bytes after footer"));
                    }
                }
                ty => {
                    segment.entry_counts[ty.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
                    segment
                        .live_bytes
                        .fetch_add(consumed as u32, Ordering::Relaxed);
                }
            }
            offset += consumed as u32;
            cursor = &cursor[consumed..];
        }

        let (footer_offset, footer) = footer.ok_or_else(|| segment.corrupt("missing footer"))?;
        let crc = CRC32C.checksum(&bytes[..footer_offset as usize]);
        if crc != footer.crc {
            return Err(segment.corrupt("footer crc mismatch"));
        }

        Ok(segment)
    }

    // ========== Identity and statistics ==========

    /// Segment id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytes appended and visible to readers.
    #[inline]
    pub fn appended_length(&self) -> u32 {
        self.committed.load(Ordering::Acquire)
    }

    /// Number of seglets currently backing the segment.
    #[inline]
    pub fn seglets_allocated(&self) -> u32 {
        self.capacity.load(Ordering::Acquire) / self.seglet_size
    }

    /// Bytes attributed to live entries.
    #[inline]
    pub fn live_bytes(&self) -> u32 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Live entry count for one type.
    #[inline]
    pub fn entry_count(&self, ty: EntryType) -> u32 {
        self.entry_counts[ty.as_u8() as usize].load(Ordering::Relaxed)
    }

    /// Percentage of backing memory attributed to live entries.
    ///
    /// Disk cleaning only takes segments at or below
    /// `MAX_CLEANABLE_MEMORY_UTILIZATION` percent here; survivors are
    /// packed to at most that bound, so a pass never grows memory.
    pub fn memory_utilization(&self) -> u32 {
        let backed = self.capacity.load(Ordering::Acquire);
        if backed == 0 {
            return 100;
        }
        (self.live_bytes() as u64 * 100 / backed as u64) as u32
    }

    /// Percentage of the full segment size attributed to live entries.
    pub fn disk_utilization(&self) -> u32 {
        (self.live_bytes() as u64 * 100 / self.full_size as u64) as u32
    }

    /// Wall-clock seconds when the segment (or the data it was compacted
    /// from) was created.
    #[inline]
    pub fn creation_timestamp(&self) -> u32 {
        self.creation_timestamp
    }

    /// Wall-clock seconds of the last compaction attempt.
    #[inline]
    pub fn last_compaction_timestamp(&self) -> u32 {
        self.last_compaction_timestamp.load(Ordering::Relaxed)
    }

    /// Record a compaction attempt.
    pub(crate) fn note_compaction_attempt(&self, now: u32) {
        self.last_compaction_timestamp.store(now, Ordering::Relaxed);
    }

    /// Cached cost-benefit value and its version tag.
    #[inline]
    pub(crate) fn cached_cost_benefit(&self) -> (u64, u64) {
        (
            self.cost_benefit.load(Ordering::Relaxed),
            self.cost_benefit_version.load(Ordering::Relaxed),
        )
    }

    /// Replace the cached cost-benefit value for the given sort version.
    #[inline]
    pub(crate) fn cache_cost_benefit(&self, value: u64, version: u64) {
        self.cost_benefit.store(value, Ordering::Relaxed);
        self.cost_benefit_version.store(version, Ordering::Relaxed);
    }

    // ========== State machine ==========

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically transition `expected -> new`.
    pub(crate) fn try_set_state(&self, expected: State, new: State) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether corruption was detected in this segment.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn corrupt(&self, detail: &'static str) -> LogError {
        self.poisoned.store(true, Ordering::Release);
        LogError::CorruptSegment {
            segment_id: self.id,
            detail,
        }
    }

    // ========== Append path ==========

    /// Append an entry, returning the offset of its type tag, or `None`
    /// if the segment is closed or the backing seglets are out of space.
    pub fn append(&self, ty: EntryType, payload: &[u8]) -> Option<u32> {
        let offset = self.reserve_entry(ty, payload)?;
        self.commit(offset, ty, payload, true);
        Some(offset)
    }

    /// Append without absorbing the bytes into the running checksum.
    ///
    /// Used by the cleaner for relocations that may still be rejected by
    /// the external index: the bytes become visible to readers, but the
    /// checksum only advances on [`Segment::confirm_relocation`]. The
    /// caller must be the segment's only appender.
    pub(crate) fn append_unconfirmed(&self, ty: EntryType, payload: &[u8]) -> Option<u32> {
        let offset = self.reserve_entry(ty, payload)?;
        self.commit(offset, ty, payload, false);
        Some(offset)
    }

    /// Absorb a previously unconfirmed entry into the running checksum
    /// and its statistics.
    pub(crate) fn confirm_relocation(&self, ty: EntryType, payload: &[u8]) {
        // SAFETY: the cleaner is the sole appender of a survivor, so no
        // other thread is inside the commit window.
        let crc = unsafe { &mut *self.crc.get() };
        if let Some(digest) = crc.digest.as_mut() {
            hash_entry(digest, ty, payload);
        }
        crc.hashed += wire_len(payload.len()) as u32;
        self.entry_counts[ty.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Undo the most recent unconfirmed append.
    ///
    /// Sound because the external index never learned the new reference
    /// (the relocation did not take), so no reader can hold an offset
    /// into the rolled-back region; the caller is the sole appender.
    pub(crate) fn rollback_relocation(&self, offset: u32, payload_len: usize) {
        let end = offset + wire_len(payload_len) as u32;
        debug_assert_eq!(self.tail.load(Ordering::Acquire), end);
        debug_assert_eq!(self.committed.load(Ordering::Acquire), end);
        self.committed.store(offset, Ordering::Release);
        self.tail.store(offset, Ordering::Release);
    }

    fn reserve_entry(&self, _ty: EntryType, payload: &[u8]) -> Option<u32> {
        if !self.state().is_writable() {
            return None;
        }
        let wire = wire_len(payload.len()) as u32;
        let capacity = self.capacity.load(Ordering::Acquire);

        let mut current = self.tail.load(Ordering::Acquire);
        loop {
            if current & TAIL_CLOSED != 0 {
                return None;
            }
            let end = current.checked_add(wire)?;
            // Keep room for the footer `close()` will stamp.
            if end.saturating_add(FOOTER_WIRE) > capacity {
                return None;
            }
            match self.tail.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => {
                    current = observed;
                    crate::sync::spin_loop();
                }
            }
        }
    }

    /// Write the framed entry at `offset` and publish it in reservation
    /// order. With `hash`, the commit window also feeds the running crc.
    fn commit(&self, offset: u32, ty: EntryType, payload: &[u8], hash: bool) {
        let mut frame = Vec::with_capacity(6);
        frame.push(ty.as_u8());
        encode_varint(payload.len() as u32, &mut frame);

        self.write_bytes(offset, &frame);
        self.write_bytes(offset + frame.len() as u32, payload);

        // Wait for our turn: commits retire strictly in reservation order.
        while self.committed.load(Ordering::Acquire) != offset {
            crate::sync::spin_loop();
        }

        let end = offset + (frame.len() + payload.len()) as u32;
        if hash {
            // SAFETY: only the thread whose reservation equals `committed`
            // is here; the release store below hands the window off.
            let crc = unsafe { &mut *self.crc.get() };
            debug_assert_eq!(crc.hashed, offset);
            if let Some(digest) = crc.digest.as_mut() {
                digest.update(&frame);
                digest.update(payload);
            }
            crc.hashed = end;
        }
        self.committed.store(end, Ordering::Release);
    }

    /// Close the segment: stop appends, drain in-flight commits, stamp
    /// the footer. Idempotent.
    pub(crate) fn close(&self) {
        // Freeze the tail first; any reservation racing the state change
        // fails its CAS, reloads, and observes the closed bit.
        let frozen;
        let mut current = self.tail.load(Ordering::Acquire);
        loop {
            if current & TAIL_CLOSED != 0 {
                return; // someone else closed it
            }
            match self.tail.compare_exchange(
                current,
                current | TAIL_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    frozen = current;
                    break;
                }
                Err(observed) => current = observed,
            }
        }

        loop {
            let state = self.state();
            if !state.is_writable() || self.try_set_state(state, State::Immutable) {
                break;
            }
        }

        // Drain appenders that reserved before the freeze.
        while self.committed.load(Ordering::Acquire) != frozen {
            crate::sync::spin_loop();
        }

        // SAFETY: appends are frozen and drained; we are the only toucher
        // of the crc state now.
        let crc = unsafe { &mut *self.crc.get() };
        let digest = match crc.digest.take() {
            Some(d) => d,
            None => return, // replayed segment, footer already present
        };
        debug_assert_eq!(crc.hashed, frozen);
        let footer = SegmentFooter {
            crc: digest.finalize(),
        };

        // The footer slot [frozen, frozen + FOOTER_WIRE) is ours: every
        // ordinary reservation left that much slack below capacity.
        self.commit(frozen, EntryType::Footer, &footer.encode(), false);
        self.tail
            .store((frozen + FOOTER_WIRE) | TAIL_CLOSED, Ordering::Release);
    }

    // ========== Statistics updates ==========

    /// Credit a freshly appended live entry.
    pub(crate) fn note_live_append(&self, ty: EntryType, wire: u32) {
        self.live_bytes.fetch_add(wire, Ordering::Relaxed);
        self.entry_counts[ty.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Debit an entry reported dead via `Log::free`.
    ///
    /// A free can race a relocation that already dropped the entry (the
    /// handler refused the swap), in which case the debit lands on a
    /// segment that never credited it; the underflow checks keep such a
    /// stray free from wrapping the counters.
    pub(crate) fn note_free(&self, ty: EntryType, wire: u32) {
        let prev = self.live_bytes.fetch_sub(wire, Ordering::Relaxed);
        if prev < wire {
            self.live_bytes.fetch_add(wire, Ordering::Relaxed);
        }
        let counts = &self.entry_counts[ty.as_u8() as usize];
        let prev = counts.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            counts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Credit a batch of relocated bytes in one update.
    pub(crate) fn add_live_bytes(&self, bytes: u32) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    // ========== Reads ==========

    /// Read the entry whose type tag sits at `offset`.
    pub fn get_entry(&self, offset: u32) -> LogResult<(EntryType, Vec<u8>)> {
        let committed = self.appended_length();
        if offset >= committed {
            return Err(LogError::InvalidReference(Reference::new(self.id, offset)));
        }

        let mut prefix = [0u8; 6];
        let prefix_len = (committed - offset).min(6) as usize;
        self.read_bytes(offset, &mut prefix[..prefix_len]);

        let ty = EntryType::from_u8(prefix[0]).ok_or_else(|| self.corrupt("unknown entry type"))?;
        let (len, varint_bytes) =
            decode_varint(&prefix[1..prefix_len]).ok_or_else(|| self.corrupt("bad entry length"))?;

        let payload_start = offset + 1 + varint_bytes as u32;
        let payload_end = payload_start
            .checked_add(len)
            .ok_or_else(|| self.corrupt("entry length overflow"))?;
        if payload_end > committed {
            return Err(self.corrupt("entry length past committed bytes"));
        }

        let mut payload = vec![0u8; len as usize];
        self.read_bytes(payload_start, &mut payload);
        Ok((ty, payload))
    }

    /// Iterate the committed entries from byte 0. Finite and restartable;
    /// yields an error and fuses if the segment is corrupt.
    pub fn iter(&self) -> SegmentEntries<'_> {
        SegmentEntries {
            segment: self,
            offset: 0,
            limit: self.appended_length(),
            failed: false,
        }
    }

    /// Verify the integrity of a closed segment against its footer.
    pub fn verify_integrity(&self) -> LogResult<()> {
        let committed = self.appended_length();
        let mut digest = CRC32C.digest();
        let mut buf = vec![0u8; self.seglet_size as usize];
        let mut footer: Option<(u32, SegmentFooter)> = None;

        for entry in self.iter() {
            let entry = entry?;
            if entry.entry_type == EntryType::Footer {
                let decoded = SegmentFooter::decode(&entry.payload)
                    .ok_or_else(|| self.corrupt("undecodable footer"))?;
                footer = Some((entry.offset, decoded));
            }
        }
        let (footer_offset, footer) = footer.ok_or_else(|| self.corrupt("missing footer"))?;
        if footer_offset + FOOTER_WIRE != committed {
            return Err(self.corrupt("footer is not the final entry"));
        }

        let mut offset = 0;
        while offset < footer_offset {
            let chunk = (footer_offset - offset).min(self.seglet_size);
            self.read_bytes(offset, &mut buf[..chunk as usize]);
            digest.update(&buf[..chunk as usize]);
            offset += chunk;
        }
        if digest.finalize() != footer.crc {
            return Err(self.corrupt("footer crc mismatch"));
        }
        Ok(())
    }

    // ========== Seglet management ==========

    /// Return `count` trailing unused seglets to the allocator.
    ///
    /// Fails without side effects if any of those seglets contain
    /// appended bytes.
    pub(crate) fn free_unused_seglets(&self, count: u32) -> bool {
        if count == 0 {
            return true;
        }
        let mut backing = self.backing.lock();
        if (count as usize) > backing.len() {
            return false;
        }
        let remaining = backing.len() - count as usize;
        let appended = self.tail.load(Ordering::Acquire) & !TAIL_CLOSED;
        if (remaining as u32) * self.seglet_size < appended {
            return false;
        }
        let freed = backing.split_off(remaining);
        self.capacity
            .store(remaining as u32 * self.seglet_size, Ordering::Release);
        self.allocator.free(freed);
        true
    }

    /// Mark the segment logically free. Its seglets return to the
    /// allocator when the last `Arc<Segment>` drops, which cannot happen
    /// while a reader is mid-`get_entry`; that is what makes freeing a
    /// cleaned segment safe against in-flight reads.
    pub(crate) fn mark_free(&self) {
        self.state.store(State::Free as u8, Ordering::Release);
    }

    // ========== Replication handle ==========

    /// Attach the backup replication handle.
    pub(crate) fn set_replica(&self, replica: Arc<dyn ReplicatedSegment>) {
        *self.replica.lock() = Some(replica);
    }

    /// The backup replication handle, if attached.
    pub(crate) fn replica(&self) -> Option<Arc<dyn ReplicatedSegment>> {
        self.replica.lock().clone()
    }

    /// Detach and return the replication handle (compaction transfers it
    /// to the survivor, which keeps representing the same on-disk bytes).
    pub(crate) fn take_replica(&self) -> Option<Arc<dyn ReplicatedSegment>> {
        self.replica.lock().take()
    }

    /// Inherit `source`'s replication handle.
    pub(crate) fn set_replica_from(&self, source: &Segment) {
        if let Some(replica) = source.take_replica() {
            self.set_replica(replica);
        }
    }

    /// Copy the committed byte range, e.g. for replication transports.
    pub fn copy_committed(&self) -> Vec<u8> {
        let committed = self.appended_length();
        let mut out = vec![0u8; committed as usize];
        self.read_bytes(0, &mut out);
        out
    }

    // ========== Raw byte access ==========

    fn write_bytes(&self, offset: u32, src: &[u8]) {
        let seglet_size = self.seglet_size as usize;
        let mut copied = 0;
        while copied < src.len() {
            let pos = offset as usize + copied;
            let seglet = pos / seglet_size;
            let within = pos % seglet_size;
            let chunk = (seglet_size - within).min(src.len() - copied);
            // SAFETY: the caller reserved [offset, offset + len) out of
            // the backed capacity; seglet pointers below capacity are
            // valid and the region is exclusively ours until committed.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(copied),
                    self.ptrs[seglet].add(within),
                    chunk,
                );
            }
            copied += chunk;
        }
    }

    fn read_bytes(&self, offset: u32, dst: &mut [u8]) {
        let seglet_size = self.seglet_size as usize;
        let mut copied = 0;
        while copied < dst.len() {
            let pos = offset as usize + copied;
            let seglet = pos / seglet_size;
            let within = pos % seglet_size;
            let chunk = (seglet_size - within).min(dst.len() - copied);
            // SAFETY: callers bound reads by an acquire load of
            // `committed`, so the bytes are published and the seglet is
            // still backing the segment.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.ptrs[seglet].add(within),
                    dst.as_mut_ptr().add(copied),
                    chunk,
                );
            }
            copied += chunk;
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // The last Arc dropping is what actually returns a cleaned
        // segment's seglets; see mark_free.
        let freed = std::mem::take(self.backing.get_mut());
        if !freed.is_empty() {
            self.allocator.free(freed);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("appended", &self.appended_length())
            .field("live_bytes", &self.live_bytes())
            .field("seglets", &self.seglets_allocated())
            .finish()
    }
}

/// Iterator over the committed entries of a segment.
pub struct SegmentEntries<'a> {
    segment: &'a Segment,
    offset: u32,
    limit: u32,
    failed: bool,
}

impl Iterator for SegmentEntries<'_> {
    type Item = LogResult<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.limit {
            return None;
        }
        match self.segment.get_entry(self.offset) {
            Ok((entry_type, payload)) => {
                let offset = self.offset;
                self.offset += wire_len(payload.len()) as u32;
                Some(Ok(SegmentEntry {
                    offset,
                    entry_type,
                    payload,
                }))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse one framed entry from a flat byte slice (replay path).
fn parse_entry(buf: &[u8], offset: u32) -> Option<(SegmentEntry, usize)> {
    let ty = EntryType::from_u8(*buf.first()?)?;
    let (len, varint_bytes) = decode_varint(buf.get(1..)?)?;
    let start = 1 + varint_bytes;
    let end = start.checked_add(len as usize)?;
    if end > buf.len() {
        return None;
    }
    Some((
        SegmentEntry {
            offset,
            entry_type: ty,
            payload: buf[start..end].to_vec(),
        },
        end,
    ))
}

fn hash_entry(digest: &mut crc::Digest<'static, u32>, ty: EntryType, payload: &[u8]) {
    let mut frame = Vec::with_capacity(6);
    frame.push(ty.as_u8());
    encode_varint(payload.len() as u32, &mut frame);
    digest.update(&frame);
    digest.update(payload);
}

/// Current wall-clock time as whole seconds since the epoch.
pub(crate) fn wall_seconds() -> u32 {
    clocksource::coarse::UnixInstant::now()
        .duration_since(clocksource::coarse::UnixInstant::EPOCH)
        .as_secs()
}


// -----------------------------------------------------------------------------
// Loom concurrency tests
//
// Run with: cargo test --lib --features loom
// -----------------------------------------------------------------------------

#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::{FOOTER_WIRE, TAIL_CLOSED};
    use loom::cell::UnsafeCell;
    use loom::sync::Arc;
    use loom::sync::atomic::{AtomicU32, Ordering};
    use loom::thread;

    /// Mirror of `reserve_entry`'s CAS loop over the tail word.
    fn reserve(tail: &AtomicU32, wire: u32, capacity: u32) -> Option<u32> {
        let mut current = tail.load(Ordering::Acquire);
        loop {
            if current & TAIL_CLOSED != 0 {
                return None;
            }
            let end = current.checked_add(wire)?;
            if end.saturating_add(FOOTER_WIRE) > capacity {
                return None;
            }
            match tail.compare_exchange(current, end, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Mirror of `commit`'s ordered hand-off: wait for our turn on the
    /// committed word, then publish our end with a release store.
    fn retire(committed: &AtomicU32, offset: u32, end: u32) {
        while committed.load(Ordering::Acquire) != offset {
            thread::yield_now();
        }
        committed.store(end, Ordering::Release);
    }

    /// Mirror of `close()`'s freeze: set the closed bit on whatever tail
    /// value wins, returning the frozen length.
    fn freeze(tail: &AtomicU32) -> Option<u32> {
        let mut current = tail.load(Ordering::Acquire);
        loop {
            if current & TAIL_CLOSED != 0 {
                return None;
            }
            match tail.compare_exchange(
                current,
                current | TAIL_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Two appenders racing the tail CAS must end up with disjoint
    /// regions and a tail equal to their sum.
    #[test]
    fn concurrent_reservations_are_disjoint() {
        loom::model(|| {
            let tail = Arc::new(AtomicU32::new(0));
            let capacity: u32 = 64;

            let t1 = {
                let tail = tail.clone();
                thread::spawn(move || reserve(&tail, 10, capacity))
            };
            let t2 = {
                let tail = tail.clone();
                thread::spawn(move || reserve(&tail, 10, capacity))
            };

            let r1 = t1.join().unwrap().expect("capacity for both");
            let r2 = t2.join().unwrap().expect("capacity for both");

            assert_ne!(r1, r2);
            assert_eq!(r1.min(r2), 0);
            assert_eq!(r1.max(r2), 10);
            assert_eq!(tail.load(Ordering::Acquire), 20);
        });
    }

    /// The full reserve -> write -> wait-for-turn -> release-store
    /// sequence: a reader that acquire-loads `committed` must see every
    /// byte below it without a data race, which is the property the
    /// append path's readers depend on.
    #[test]
    fn commits_publish_writes_in_reservation_order() {
        loom::model(|| {
            let tail = Arc::new(AtomicU32::new(0));
            let committed = Arc::new(AtomicU32::new(0));
            // One cell per one-byte reservation, standing in for the
            // seglet bytes of each entry.
            let slots: Arc<Vec<UnsafeCell<u32>>> =
                Arc::new((0..2).map(|_| UnsafeCell::new(0)).collect());
            let capacity: u32 = 2 + FOOTER_WIRE;

            let writers: Vec<_> = (0..2u32)
                .map(|_| {
                    let tail = tail.clone();
                    let committed = committed.clone();
                    let slots = slots.clone();
                    thread::spawn(move || {
                        let offset = reserve(&tail, 1, capacity).expect("room for both");
                        // SAFETY: the reservation makes [offset, offset+1)
                        // exclusively ours until committed passes it.
                        slots[offset as usize].with_mut(|p| unsafe { *p = offset + 100 });
                        retire(&committed, offset, offset + 1);
                        offset
                    })
                })
                .collect();

            let reader = {
                let committed = committed.clone();
                let slots = slots.clone();
                thread::spawn(move || {
                    let visible = committed.load(Ordering::Acquire);
                    // SAFETY: bytes below the acquire-loaded committed
                    // length are published by the writers' release
                    // stores; loom flags this as a race if they are not.
                    for i in 0..visible {
                        let value = slots[i as usize].with(|p| unsafe { *p });
                        assert_eq!(value, i + 100);
                    }
                    visible
                })
            };

            let mut offsets: Vec<u32> = writers.into_iter().map(|t| t.join().unwrap()).collect();
            offsets.sort_unstable();
            assert_eq!(offsets, vec![0, 1]);

            let seen = reader.join().unwrap();
            assert!(seen <= 2);
            assert_eq!(committed.load(Ordering::Acquire), 2);
        });
    }

    /// A reservation racing `close()`'s freeze either lands entirely
    /// before the frozen length or fails; nothing reserves past it.
    #[test]
    fn freeze_excludes_racing_reservations() {
        loom::model(|| {
            let tail = Arc::new(AtomicU32::new(0));
            let capacity: u32 = 64;

            let appender = {
                let tail = tail.clone();
                thread::spawn(move || reserve(&tail, 10, capacity))
            };
            let closer = {
                let tail = tail.clone();
                thread::spawn(move || freeze(&tail).expect("only closer"))
            };

            let reserved = appender.join().unwrap();
            let frozen = closer.join().unwrap();

            let final_tail = tail.load(Ordering::Acquire);
            assert_ne!(final_tail & TAIL_CLOSED, 0);
            assert_eq!(final_tail & !TAIL_CLOSED, frozen);
            match reserved {
                Some(offset) => {
                    // The append won the race; the freeze covers it.
                    assert_eq!(offset, 0);
                    assert_eq!(frozen, 10);
                }
                None => assert_eq!(frozen, 0),
            }

            // Post-freeze reservations are refused outright.
            assert!(reserve(&tail, 10, capacity).is_none());
        });
    }
}
