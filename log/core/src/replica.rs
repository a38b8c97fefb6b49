//! Backup replication interface.
//!
//! Replication itself is an external collaborator; the log only needs a
//! narrow per-segment handle to start replication of closed segments,
//! wait for acknowledgement, and release replicas of cleaned segments.
//! [`InMemoryReplicaManager`] is a loopback implementation for tests and
//! single-process deployments.

use crate::error::LogResult;
use crate::segment::Segment;
use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Per-segment replication handle.
///
/// One handle represents one segment's family of backup replicas. When a
/// segment is compacted in memory its handle transfers to the survivor:
/// the on-disk bytes are unchanged, only the in-memory copy was repacked.
pub trait ReplicatedSegment: Send + Sync {
    /// The segment closed; begin replicating its committed bytes
    /// asynchronously.
    fn close(&self);

    /// Block until at least `length` bytes are acknowledged by backups.
    ///
    /// Returns [`LogError::BackupUnavailable`](crate::LogError) if the
    /// backups do not acknowledge in time; callers retry.
    fn sync(&self, length: u32) -> LogResult<()>;

    /// Whether `length` bytes are already acknowledged.
    fn is_synced(&self, length: u32) -> bool;

    /// Release every backup replica of this segment.
    fn free(&self);
}

/// Factory for per-segment replication handles.
pub trait ReplicaManager: Send + Sync {
    /// Register a segment for replication and return its handle.
    fn open_segment(&self, segment: &Arc<Segment>) -> Arc<dyn ReplicatedSegment>;
}

/// Loopback replica manager keeping "backup" copies in process memory.
///
/// Replication is synchronous and always acknowledged, which makes it a
/// deterministic stand-in for tests; the stored byte ranges are real, so
/// replayed recovery paths exercise actual segment bytes.
#[derive(Default, Clone)]
pub struct InMemoryReplicaManager {
    store: Arc<ReplicaStore>,
}

#[derive(Default)]
struct ReplicaStore {
    replicas: Mutex<HashMap<u64, Vec<u8>, RandomState>>,
}

impl InMemoryReplicaManager {
    /// Create an empty replica store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The replicated byte range of a segment, if any.
    pub fn replica_bytes(&self, segment_id: u64) -> Option<Vec<u8>> {
        self.store.replicas.lock().get(&segment_id).cloned()
    }

    /// Number of segments currently holding replicas.
    pub fn replica_count(&self) -> usize {
        self.store.replicas.lock().len()
    }

    /// Replicated byte ranges of every segment, ordered by ascending id.
    /// The shape `Log::replay` consumes.
    pub fn all_replicas(&self) -> Vec<(u64, Vec<u8>)> {
        let mut out: Vec<_> = self
            .store
            .replicas
            .lock()
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

impl ReplicaManager for InMemoryReplicaManager {
    fn open_segment(&self, segment: &Arc<Segment>) -> Arc<dyn ReplicatedSegment> {
        Arc::new(InMemoryReplica {
            store: Arc::clone(&self.store),
            segment_id: segment.id(),
            // Weak so a replica handle never keeps a cleaned segment's
            // memory alive.
            segment: Arc::downgrade(segment),
        })
    }
}

struct InMemoryReplica {
    store: Arc<ReplicaStore>,
    segment_id: u64,
    segment: Weak<Segment>,
}

impl InMemoryReplica {
    fn capture(&self) {
        if let Some(segment) = self.segment.upgrade() {
            let bytes = segment.copy_committed();
            self.store.replicas.lock().insert(self.segment_id, bytes);
        }
    }
}

impl ReplicatedSegment for InMemoryReplica {
    fn close(&self) {
        self.capture();
    }

    fn sync(&self, length: u32) -> LogResult<()> {
        if !self.is_synced(length) {
            self.capture();
        }
        Ok(())
    }

    fn is_synced(&self, length: u32) -> bool {
        self.store
            .replicas
            .lock()
            .get(&self.segment_id)
            .is_some_and(|bytes| bytes.len() as u32 >= length)
    }

    fn free(&self) {
        self.store.replicas.lock().remove(&self.segment_id);
    }
}
