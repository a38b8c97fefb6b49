//! Public log facade.
//!
//! [`Log`] is what foreground writers see: `append` produces a stable
//! [`Reference`], `free` signals that an entry died, and `get_entry`
//! resolves a reference back to its bytes, following the redirection
//! table across compactions. Everything else (segment states, survivor
//! allocation, reclamation) happens behind the [`SegmentManager`].

use crate::config::LogConfig;
use crate::entry::{EntryType, SegmentHeader, wire_len};
use crate::error::{LogError, LogResult};
use crate::manager::SegmentManager;
use crate::metrics::{LogMetrics, LogMetricsSnapshot};
use crate::reference::Reference;
use crate::replica::{InMemoryReplicaManager, ReplicaManager};
use crate::seglet::SegletAllocator;
use crate::segment::{FOOTER_WIRE, Segment};
use std::sync::Arc;
use tracing::debug;

/// Builder for a [`Log`].
pub struct LogBuilder {
    config: LogConfig,
    replica_manager: Option<Arc<dyn ReplicaManager>>,
}

impl LogBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: LogConfig::new(),
            replica_manager: None,
        }
    }

    /// Use the given configuration.
    pub fn config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given backup replication transport. Defaults to the
    /// in-process loopback manager.
    pub fn replica_manager(mut self, manager: Arc<dyn ReplicaManager>) -> Self {
        self.replica_manager = Some(manager);
        self
    }

    /// Validate the configuration and build the log.
    pub fn build(self) -> LogResult<Log> {
        self.config.validate().map_err(LogError::Config)?;

        let replica_manager = self
            .replica_manager
            .unwrap_or_else(|| Arc::new(InMemoryReplicaManager::new()));
        let allocator = Arc::new(SegletAllocator::new(&self.config));
        let max_append = max_append_size(&self.config);
        let manager = Arc::new(SegmentManager::new(
            self.config,
            allocator,
            replica_manager,
        ));

        Ok(Log {
            manager,
            metrics: Arc::new(LogMetrics::default()),
            max_append,
        })
    }
}

impl Default for LogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest payload a single append can accept: one full segment minus
/// the header entry, the reserved footer slot, and the entry framing.
fn max_append_size(config: &LogConfig) -> usize {
    let header_wire = wire_len(SegmentHeader::SIZE);
    let overhead = header_wire + FOOTER_WIRE as usize + 6;
    (config.segment_size as usize).saturating_sub(overhead)
}

/// The append-only log of a master server.
///
/// # Concurrency
///
/// `append` and `free` are callable from any number of foreground
/// threads. Appends serialize on the head segment's atomic offset bump;
/// `free` is a pair of atomic subtractions. Neither takes a lock except
/// on head rollover.
pub struct Log {
    manager: Arc<SegmentManager>,
    metrics: Arc<LogMetrics>,
    max_append: usize,
}

impl Log {
    /// Build a log with the default configuration.
    pub fn builder() -> LogBuilder {
        LogBuilder::new()
    }

    /// Append an entry, returning a stable reference to it.
    ///
    /// Rolls the head when it fills; fails terminally with
    /// [`LogError::OutOfSegments`] only when the allocator cannot provide
    /// a new head (the cleaner may free memory, after which retrying can
    /// succeed).
    ///
    /// # Panics
    /// `ty` must be [`EntryType::Object`] or [`EntryType::Tombstone`];
    /// segment metadata types are internal.
    pub fn append(&self, ty: EntryType, payload: &[u8]) -> LogResult<Reference> {
        assert!(
            !ty.is_segment_metadata(),
            "segment metadata entries are appended internally"
        );
        if payload.len() > self.max_append {
            return Err(LogError::EntryTooLarge {
                size: payload.len(),
                max: self.max_append,
            });
        }

        loop {
            let head = match self.manager.head() {
                Some(head) => head,
                None => self.alloc_head(None)?,
            };

            if let Some(offset) = head.append(ty, payload) {
                let wire = wire_len(payload.len()) as u32;
                head.note_live_append(ty, wire);
                self.metrics.appends(1);
                self.metrics.append_bytes(wire as u64);
                return Ok(Reference::new(head.id(), offset));
            }

            // Head full (or just closed by a racing roll); roll it.
            self.alloc_head(Some(&head))?;
        }
    }

    fn alloc_head(&self, previous: Option<&Arc<Segment>>) -> LogResult<Arc<Segment>> {
        match self.manager.alloc_head(previous) {
            Ok(head) => {
                if previous.is_some() {
                    self.metrics.head_rollovers(1);
                    debug!(head_id = head.id(), "rolled log head");
                }
                Ok(head)
            }
            Err(e) => {
                self.metrics.failed_appends(1);
                Err(e)
            }
        }
    }

    /// Signal that the entry at `reference` is no longer live.
    ///
    /// `payload_len` is the length that was appended; liveness accounting
    /// is by wire length, so the two must match. Fails with
    /// [`LogError::InvalidReference`] if the segment is gone, which a
    /// caller racing the cleaner treats as already freed.
    pub fn free(&self, ty: EntryType, reference: Reference, payload_len: usize) -> LogResult<()> {
        let segment = self
            .manager
            .resolve_exact(reference.segment_id())
            .ok_or(LogError::InvalidReference(reference))?;
        let wire = wire_len(payload_len) as u32;
        segment.note_free(ty, wire);
        self.metrics.frees(1);
        self.metrics.freed_bytes(wire as u64);
        Ok(())
    }

    /// Read the entry named by `reference`.
    ///
    /// The segment id is resolved through the redirection table, so
    /// references into compacted segments keep resolving until the index
    /// stops handing them out.
    pub fn get_entry(&self, reference: Reference) -> LogResult<(EntryType, Vec<u8>)> {
        let segment = self
            .manager
            .resolve(reference.segment_id())
            .ok_or(LogError::InvalidReference(reference))?;
        segment.get_entry(reference.offset())
    }

    /// Largest payload `append` can accept.
    #[inline]
    pub fn max_append_size(&self) -> usize {
        self.max_append
    }

    /// Rebuild log contents from replicated segment byte ranges.
    ///
    /// `segments` must arrive in ascending segment id order, each being
    /// the `[0, appended_length)` byte range of a closed segment. Returns
    /// the number of segments installed. Call before the first append.
    pub fn replay<I>(&self, segments: I) -> LogResult<usize>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let config = self.manager.config().clone();
        let mut last_id: Option<u64> = None;
        let mut installed = 0;

        for bytes in segments {
            let segment = Segment::from_bytes(
                &bytes,
                config.segment_size,
                Arc::clone(self.manager.allocator()),
                config.log_id,
            )?;
            if last_id.is_some_and(|last| segment.id() <= last) {
                return Err(LogError::InvariantViolation(
                    "replayed segments out of order",
                ));
            }
            last_id = Some(segment.id());
            self.manager.install_replayed(Arc::new(segment))?;
            installed += 1;
        }

        debug!(installed, "replayed segments");
        Ok(installed)
    }

    /// Foreground path counters.
    pub fn metrics(&self) -> LogMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The segment manager backing this log. Exposed for observability
    /// (segment counts, utilization) and for wiring up collaborators.
    pub fn manager(&self) -> &Arc<SegmentManager> {
        &self.manager
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn small_log() -> Log {
        Log::builder()
            .config(
                LogConfig::new()
                    .with_seglet_size(4096)
                    .with_segment_size(8 * 4096)
                    .with_heap_size(64 * 4096)
                    .with_max_segments(64),
            )
            .build()
            .expect("build")
    }

    #[test]
    fn append_then_get() {
        let log = small_log();
        let reference = log.append(EntryType::Object, b"hello").expect("append");
        let (ty, payload) = log.get_entry(reference).expect("get");
        assert_eq!(ty, EntryType::Object);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn references_are_distinct() {
        let log = small_log();
        let r1 = log.append(EntryType::Object, b"one").expect("append");
        let r2 = log.append(EntryType::Object, b"two").expect("append");
        assert_ne!(r1, r2);
        assert_eq!(log.get_entry(r1).expect("get").1, b"one");
        assert_eq!(log.get_entry(r2).expect("get").1, b"two");
    }

    #[test]
    fn head_rolls_when_full() {
        let log = small_log();
        let payload = vec![0xA5u8; 4000];
        let mut references = Vec::new();
        // 8 * 4096 = 32 KiB per segment; 20 appends of ~4 KiB span
        // several segments.
        for _ in 0..20 {
            references.push(log.append(EntryType::Object, &payload).expect("append"));
        }
        assert!(log.metrics().head_rollovers >= 2);
        for r in references {
            assert_eq!(log.get_entry(r).expect("get").1, payload);
        }
    }

    #[test]
    fn append_rejects_oversized_payload() {
        let log = small_log();
        let too_big = vec![0u8; log.max_append_size() + 1];
        assert!(matches!(
            log.append(EntryType::Object, &too_big),
            Err(LogError::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn append_exhausts_into_out_of_segments() {
        let log = Log::builder()
            .config(
                LogConfig::new()
                    .with_seglet_size(4096)
                    .with_segment_size(4 * 4096)
                    .with_heap_size(8 * 4096) // room for exactly two segments
                    .with_max_segments(64),
            )
            .build()
            .expect("build");

        let payload = vec![0u8; 2048];
        let err = loop {
            match log.append(EntryType::Object, &payload) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err, LogError::OutOfSegments);
        assert!(log.metrics().failed_appends > 0);
    }

    #[test]
    fn free_decrements_liveness() {
        let log = small_log();
        let r = log.append(EntryType::Object, b"dead soon").expect("append");
        let head = log.manager().head().expect("head");
        let live_before = head.live_bytes();

        log.free(EntryType::Object, r, 9).expect("free");
        assert_eq!(
            head.live_bytes(),
            live_before - wire_len(9) as u32
        );
        assert_eq!(log.metrics().frees, 1);
    }

    #[test]
    fn free_of_unknown_segment_fails() {
        let log = small_log();
        let bogus = Reference::new(999, 0);
        assert!(matches!(
            log.free(EntryType::Object, bogus, 4),
            Err(LogError::InvalidReference(_))
        ));
    }

    #[test]
    fn replay_restores_entries() {
        let log = small_log();
        let r = log.append(EntryType::Object, b"durable").expect("append");

        // Roll the head so the first segment closes and replicates.
        let head = log.manager().head().expect("head");
        log.manager().alloc_head(Some(&head)).expect("roll");
        let bytes = head.copy_committed();

        let restored = small_log();
        assert_eq!(restored.replay([bytes]).expect("replay"), 1);
        let (ty, payload) = restored.get_entry(r).expect("get");
        assert_eq!(ty, EntryType::Object);
        assert_eq!(payload, b"durable");
    }

    #[test]
    fn replay_rejects_out_of_order_segments() {
        let log = small_log();
        log.append(EntryType::Object, b"a").expect("append");
        let s0 = log.manager().head().expect("head");
        log.manager().alloc_head(Some(&s0)).expect("roll");
        log.append(EntryType::Object, b"b").expect("append");
        let s1 = log.manager().head().expect("head");
        log.manager().alloc_head(Some(&s1)).expect("roll");

        let restored = small_log();
        let result = restored.replay([s1.copy_committed(), s0.copy_committed()]);
        assert!(result.is_err());
    }
}
