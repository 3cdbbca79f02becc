//! Identifier classes
//!
//! Segments carry a 128-bit globally sortable id (wall-clock high bits, random
//! low bits); a block id embeds its segment id plus an ordinal within the
//! segment, so block→segment affinity is a field read, not a lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type DatabaseId = u64;
pub type TableId = u64;
pub type TxnId = u64;

/// Stable column identity, preserved across rename and logical reorder.
pub type ColSeqNum = u16;

/// 128-bit segment id: `(unix nanos << 64) | random`. Sorts by creation time
/// first, so segment iteration follows ingest order.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct SegmentId(pub u128);

impl SegmentId {
    pub fn generate() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let low: u64 = rand::random();
        SegmentId(((nanos as u128) << 64) | low as u128)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Block id: owning segment id plus the block's ordinal within the segment.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct BlockId {
    pub segment: SegmentId,
    pub offset: u16,
}

impl BlockId {
    pub fn new(segment: SegmentId, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Fixed 18-byte big-endian encoding, used inside packed row ids.
    pub fn to_bytes(&self) -> [u8; 18] {
        let mut buf = [0u8; 18];
        buf[..16].copy_from_slice(&self.segment.0.to_be_bytes());
        buf[16..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Option<BlockId> {
        if buf.len() != 18 {
            return None;
        }
        let segment = SegmentId(u128::from_be_bytes(buf[..16].try_into().ok()?));
        let offset = u16::from_be_bytes(buf[16..].try_into().ok()?);
        Some(BlockId { segment, offset })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.segment, self.offset)
    }
}

/// Full block address: `(database, table, segment, block-in-segment)`.
/// The segment half lives inside `block`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct BlockAddr {
    pub db: DatabaseId,
    pub table: TableId,
    pub block: BlockId,
}

impl BlockAddr {
    pub fn new(db: DatabaseId, table: TableId, block: BlockId) -> Self {
        Self { db, table, block }
    }

    pub fn segment(&self) -> SegmentId {
        self.block.segment
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.db, self.table, self.block)
    }
}

/// Packed row id for logtail batches: block id plus row offset, 22 bytes.
pub fn pack_rowid(block: BlockId, row: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&block.to_bytes());
    buf.extend_from_slice(&row.to_be_bytes());
    buf
}

pub fn unpack_rowid(buf: &[u8]) -> Option<(BlockId, u32)> {
    if buf.len() != 22 {
        return None;
    }
    let block = BlockId::from_bytes(&buf[..18])?;
    let row = u32::from_be_bytes(buf[18..].try_into().ok()?);
    Some((block, row))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_ids_sort_by_time() {
        let a = SegmentId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = SegmentId::generate();
        assert!(a < b);
    }

    #[test]
    fn test_block_id_roundtrip() {
        let id = BlockId::new(SegmentId(0xdead_beef_cafe), 7);
        assert_eq!(BlockId::from_bytes(&id.to_bytes()), Some(id));
    }

    #[test]
    fn test_rowid_roundtrip() {
        let block = BlockId::new(SegmentId::generate(), 3);
        let packed = pack_rowid(block, 41);
        assert_eq!(unpack_rowid(&packed), Some((block, 41)));
        assert_eq!(unpack_rowid(&packed[..10]), None);
    }
}
