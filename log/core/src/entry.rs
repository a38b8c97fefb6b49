//! Log entry types and the segment wire format.
//!
//! Every entry is framed as:
//!
//! ```text
//! u8      type
//! varint  length        // LEB128, 1-5 bytes
//! bytes   payload[length]
//! ```
//!
//! Entries are aligned to a 1-byte boundary. They never straddle segments
//! but may straddle the seglets backing a segment.
//!
//! The first entry of every segment is a [`SegmentHeader`]; a closed
//! segment additionally carries a trailing [`SegmentFooter`] whose payload
//! is the crc32c of every byte that precedes the footer entry.

use crc::{CRC_32_ISCSI, Crc};

/// The crc32c (Castagnoli) instance used for segment footers.
pub static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Number of distinct entry types, for per-type accounting arrays.
pub const ENTRY_TYPE_COUNT: usize = 4;

/// Type tag of a log entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Segment self-description; always the first entry of a segment.
    Header = 0,
    /// A live user object.
    Object = 1,
    /// Marker that a prior object was deleted. Kept until no log copy of
    /// the object remains.
    Tombstone = 2,
    /// Trailing integrity record stamped when a segment closes.
    Footer = 3,
}

impl EntryType {
    /// Convert from the raw wire tag.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryType::Header),
            1 => Some(EntryType::Object),
            2 => Some(EntryType::Tombstone),
            3 => Some(EntryType::Footer),
            _ => None,
        }
    }

    /// The raw wire tag.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Segment-private entries that the cleaner never relocates and the
    /// external index never references.
    #[inline]
    pub fn is_segment_metadata(self) -> bool {
        matches!(self, EntryType::Header | EntryType::Footer)
    }
}

/// Encode a LEB128 varint.
pub fn encode_varint(mut value: u32, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` on
/// truncation or overflow past 32 bits.
pub fn decode_varint(buf: &[u8]) -> Option<(u32, usize)> {
    let mut result: u32 = 0;
    let mut shift = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 32 {
            return None;
        }
        let bits = (byte & 0x7F) as u32;
        // The final byte may not carry bits past the 32-bit boundary.
        if shift > 0 && bits.checked_shl(shift).map(|v| v >> shift) != Some(bits) {
            return None;
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
        shift += 7;
    }

    None
}

/// Number of bytes `encode_varint` produces for `value`.
#[inline]
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Total wire length of an entry with a payload of `payload_len` bytes.
#[inline]
pub fn wire_len(payload_len: usize) -> usize {
    1 + varint_len(payload_len as u32) + payload_len
}

/// Payload of the mandatory first entry of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Identifier of the segment itself.
    pub segment_id: u64,
    /// Identifier of the owning log.
    pub log_id: u64,
    /// Seglet size the segment was built with.
    pub seglet_size: u32,
    /// Full segment size the segment was built with.
    pub segment_size: u32,
}

impl SegmentHeader {
    /// Encoded payload size in bytes.
    pub const SIZE: usize = 24;

    /// Encode as the header entry payload (little-endian fields).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.log_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.seglet_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.segment_size.to_le_bytes());
        buf
    }

    /// Decode from a header entry payload.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            segment_id: u64::from_le_bytes(buf[0..8].try_into().ok()?),
            log_id: u64::from_le_bytes(buf[8..16].try_into().ok()?),
            seglet_size: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            segment_size: u32::from_le_bytes(buf[20..24].try_into().ok()?),
        })
    }
}

/// Payload of the trailing footer entry of a closed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFooter {
    /// crc32c of all segment bytes preceding the footer entry.
    pub crc: u32,
}

impl SegmentFooter {
    /// Encoded payload size in bytes.
    pub const SIZE: usize = 4;

    /// Encode as the footer entry payload.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        self.crc.to_le_bytes()
    }

    /// Decode from a footer entry payload.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        Some(Self {
            crc: u32::from_le_bytes(buf.try_into().ok()?),
        })
    }
}
