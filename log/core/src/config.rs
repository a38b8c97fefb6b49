//! Configuration for the log engine and its cleaner.

use crate::reference::MAX_SEGMENT_SIZE;

/// Memory utilization (percent) at which cleaner threads consider the
/// system under memory pressure.
pub const MIN_MEMORY_UTILIZATION: u32 = 90;

/// Memory utilization (percent) at which memory is considered depleted and
/// the policy thread switches to disk cleaning to force whole segments out.
pub const MEMORY_DEPLETED_UTILIZATION: u32 = 98;

/// Disk utilization (percent) at which cleaner threads consider the system
/// under disk pressure.
pub const MIN_DISK_UTILIZATION: u32 = 95;

/// Upper bound (percent) on the memory utilization of a segment eligible
/// for cleaning. Survivors are packed up to this bound, never beyond it.
pub const MAX_CLEANABLE_MEMORY_UTILIZATION: u32 = 98;

/// Bounds the live bytes processed by one disk cleaning pass, expressed in
/// whole segments.
pub const MAX_LIVE_SEGMENTS_PER_DISK_PASS: u32 = 10;

/// Full survivor segments reserved per cleaner thread. The reserve is what
/// guarantees the cleaner forward progress against foreground appends.
pub const SURVIVOR_SEGMENTS_TO_RESERVE: u32 = 2;

/// Idle sleep between cleaner polls, in microseconds. Jittered up to +10%.
pub const POLL_USEC: u64 = 10_000;

/// Runtime configuration for a [`Log`](crate::Log) and its cleaner.
///
/// Constructed with defaults via [`LogConfig::new`] and adjusted with the
/// `with_*` methods:
///
/// ```
/// use log_core::LogConfig;
///
/// let config = LogConfig::new()
///     .with_heap_size(256 * 1024 * 1024)
///     .with_cleaner_threads(4);
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Identifier of this log, stamped into every segment header.
    pub log_id: u64,

    /// Size of one seglet in bytes. Must evenly divide `segment_size`.
    pub seglet_size: u32,

    /// Size of one full segment in bytes.
    pub segment_size: u32,

    /// Total in-memory heap, in bytes. The seglet pool holds
    /// `heap_size / seglet_size` seglets.
    pub heap_size: usize,

    /// Backup capacity in segment slots. Bounds how many segments may exist
    /// at once; disk utilization is measured against this.
    pub max_segments: u32,

    /// Number of cleaner threads.
    pub cleaner_threads: u32,

    /// Write cost threshold for in-memory cleaning. 0 disables compaction.
    pub cleaner_write_cost_threshold: u32,

    /// Skip in-memory compaction entirely.
    pub disable_in_memory_cleaning: bool,

    /// Keep at least one seglet in every compaction survivor.
    ///
    /// Under extreme small-entry workloads the survivor sizing arithmetic
    /// can round to zero seglets; `true` floors the result at one seglet,
    /// `false` keeps the raw arithmetic.
    pub floor_survivor_seglets: bool,
}

impl LogConfig {
    /// Create a configuration with default geometry: 64 KiB seglets,
    /// 1 MiB segments, a 64 MiB heap, and backup capacity for four heaps
    /// worth of segments.
    pub fn new() -> Self {
        let seglet_size = 64 * 1024;
        let segment_size = 1024 * 1024;
        let heap_size = 64 * 1024 * 1024;
        Self {
            log_id: 0,
            seglet_size,
            segment_size,
            heap_size,
            max_segments: 4 * (heap_size / segment_size as usize) as u32,
            cleaner_threads: 3,
            cleaner_write_cost_threshold: 6,
            disable_in_memory_cleaning: false,
            floor_survivor_seglets: true,
        }
    }

    /// Set the log identifier.
    pub fn with_log_id(mut self, log_id: u64) -> Self {
        self.log_id = log_id;
        self
    }

    /// Set the seglet size in bytes.
    pub fn with_seglet_size(mut self, size: u32) -> Self {
        self.seglet_size = size;
        self
    }

    /// Set the segment size in bytes.
    pub fn with_segment_size(mut self, size: u32) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the total heap size in bytes.
    pub fn with_heap_size(mut self, size: usize) -> Self {
        self.heap_size = size;
        self
    }

    /// Set the backup capacity in segment slots.
    pub fn with_max_segments(mut self, max: u32) -> Self {
        self.max_segments = max;
        self
    }

    /// Set the number of cleaner threads.
    pub fn with_cleaner_threads(mut self, threads: u32) -> Self {
        self.cleaner_threads = threads;
        self
    }

    /// Set the write cost threshold. 0 disables in-memory cleaning.
    pub fn with_write_cost_threshold(mut self, threshold: u32) -> Self {
        self.cleaner_write_cost_threshold = threshold;
        self
    }

    /// Enable or disable in-memory compaction.
    pub fn with_in_memory_cleaning(mut self, enabled: bool) -> Self {
        self.disable_in_memory_cleaning = !enabled;
        self
    }

    /// Choose whether survivor sizing floors at one seglet.
    pub fn with_floor_survivor_seglets(mut self, floor: bool) -> Self {
        self.floor_survivor_seglets = floor;
        self
    }

    /// Number of seglets backing one full segment.
    #[inline]
    pub fn seglets_per_segment(&self) -> u32 {
        self.segment_size / self.seglet_size
    }

    /// Total number of seglets in the heap.
    #[inline]
    pub fn total_seglets(&self) -> u32 {
        (self.heap_size / self.seglet_size as usize) as u32
    }

    /// Check the configuration for geometry errors.
    ///
    /// Returns a description of the first problem found, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.seglet_size == 0 || self.segment_size == 0 {
            return Err("seglet_size and segment_size must be non-zero");
        }
        if self.segment_size % self.seglet_size != 0 {
            return Err("segment_size must be a multiple of seglet_size");
        }
        if self.segment_size as u64 > MAX_SEGMENT_SIZE {
            return Err("segment_size exceeds the addressable offset range");
        }
        if self.heap_size < self.segment_size as usize {
            return Err("heap_size must hold at least one segment");
        }
        if self.cleaner_threads == 0 {
            return Err("cleaner_threads must be at least 1");
        }
        if self.max_segments == 0 {
            return Err("max_segments must be at least 1");
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}
