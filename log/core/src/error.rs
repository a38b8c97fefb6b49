//! Error types for log operations.

use crate::reference::Reference;

/// Errors that can occur during log operations.
///
/// Most variants are recoverable by the caller or by the cleaner itself.
/// [`LogError::InvariantViolation`] is not: it indicates an accounting bug
/// and the cleaner treats it as fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// The seglet allocator could not provide a new head segment.
    /// Surfaced to the caller of `append`; retrying may succeed once the
    /// cleaner has reclaimed memory.
    #[error("out of segments: seglet allocator exhausted")]
    OutOfSegments,

    /// A survivor segment filled up mid-relocation. Recovered locally by
    /// closing the survivor and allocating another.
    #[error("relocation failed: survivor segment full")]
    RelocationFailed,

    /// A replica sync did not complete in time. The cleaner retries
    /// indefinitely with backoff; data is never dropped.
    #[error("backup unavailable: sync of segment {segment_id} timed out")]
    BackupUnavailable {
        /// Segment whose replication stalled.
        segment_id: u64,
    },

    /// An iterator encountered a bad entry length, an unknown entry type,
    /// or a checksum mismatch. The segment is poisoned and must not be
    /// cleaned; the master is unsafe.
    #[error("corrupt segment {segment_id}: {detail}")]
    CorruptSegment {
        /// Segment that failed validation.
        segment_id: u64,
        /// Human-readable description of the corruption.
        detail: &'static str,
    },

    /// Internal accounting check failed. Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// Append was issued against a segment that is no longer the head.
    #[error("segment not writable")]
    SegmentNotWritable,

    /// A reference did not resolve to a live segment.
    #[error("invalid reference {0:?}")]
    InvalidReference(Reference),

    /// The payload exceeds the largest entry a segment can hold.
    #[error("entry too large: {size} bytes exceeds maximum of {max}")]
    EntryTooLarge {
        /// Requested payload size.
        size: usize,
        /// Largest payload `append` can accept.
        max: usize,
    },

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            LogError::OutOfSegments.to_string(),
            "out of segments: seglet allocator exhausted"
        );
        assert_eq!(
            LogError::CorruptSegment {
                segment_id: 7,
                detail: "bad entry length"
            }
            .to_string(),
            "corrupt segment 7: bad entry length"
        );
        assert_eq!(
            LogError::EntryTooLarge { size: 10, max: 5 }.to_string(),
            "entry too large: 10 bytes exceeds maximum of 5"
        );
    }

    #[test]
    fn is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<LogError>();
    }
}
