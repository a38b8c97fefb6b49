//! log-core: in-memory log-structured storage engine.
//!
//! The crate implements the log engine of a distributed key-value
//! master: every live object and tombstone lives in a single append-only
//! log partitioned into fixed-size segments, continuously garbage
//! collected by a background cleaner without blocking foreground writes.
//!
//! # Architecture
//!
//! ```text
//!   writers                    cleaner threads
//!      |                            |
//!      v                            v
//!  +-------+   head   +----------------+   victims    +------------+
//!  |  Log  |--------->| SegmentManager |<-------------| LogCleaner |
//!  +-------+          +----------------+  survivors   +------------+
//!      |                   |        |                      |
//!      | get_entry         |        v                      v
//!      +-------------------+  SegletAllocator       EntryHandlers
//!                                   |                 (external index)
//!                                   v
//!                            ReplicaManager
//!                           (backup transport)
//! ```
//!
//! The manager is the hub: the log facade and the cleaner reference it,
//! never each other. Segments are backed by fixed-size seglets from a
//! shared pool; a survivor reserve inside the pool guarantees the
//! cleaner forward progress against foreground appends.
//!
//! # Example
//!
//! ```
//! use log_core::{EntryType, Log, LogConfig};
//!
//! let log = Log::builder()
//!     .config(LogConfig::new().with_heap_size(16 * 1024 * 1024))
//!     .build()
//!     .unwrap();
//!
//! let reference = log.append(EntryType::Object, b"value").unwrap();
//! let (ty, bytes) = log.get_entry(reference).unwrap();
//! assert_eq!(ty, EntryType::Object);
//! assert_eq!(bytes, b"value");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod sync;

mod config;
mod entry;
mod error;
mod reference;

mod seglet;
mod segment;

mod handlers;
mod replica;

mod manager;

mod log;

mod cleaner;

mod metrics;

pub use config::{
    LogConfig, MAX_CLEANABLE_MEMORY_UTILIZATION, MAX_LIVE_SEGMENTS_PER_DISK_PASS,
    MEMORY_DEPLETED_UTILIZATION, MIN_DISK_UTILIZATION, MIN_MEMORY_UTILIZATION, POLL_USEC,
    SURVIVOR_SEGMENTS_TO_RESERVE,
};
pub use entry::{
    ENTRY_TYPE_COUNT, EntryType, SegmentFooter, SegmentHeader, decode_varint, encode_varint,
    varint_len, wire_len,
};
pub use error::{LogError, LogResult};
pub use reference::{MAX_SEGMENT_SIZE, Reference};

pub use seglet::{AllocPool, Seglet, SegletAllocator};
pub use segment::{Segment, SegmentEntries, SegmentEntry, State};

pub use handlers::EntryHandlers;
pub use replica::{InMemoryReplicaManager, ReplicaManager, ReplicatedSegment};

pub use manager::SegmentManager;

pub use log::{Log, LogBuilder};

pub use cleaner::LogCleaner;

pub use metrics::{
    CleanerMetrics, CleanerMetricsSnapshot, InMemoryMetrics, InMemoryMetricsSnapshot, LogMetrics,
    LogMetricsSnapshot, OnDiskMetrics, OnDiskMetricsSnapshot, ScanCounters, ScanCountersSnapshot,
    ThreadMetrics, ThreadMetricsSnapshot,
};
