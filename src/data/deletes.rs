//! MVCC delete chain
//!
//! Deletes on a block accumulate as committed nodes, each a row bitmap
//! stamped with its commit timestamp. The mask a reader sees is the union of
//! nodes at or before its snapshot. Flushing deletes to a delta object prunes
//! the covered prefix; the chain and the persisted payload are merged at read
//! time during the transitional window.

use crate::error::{EngineError, Result};
use crate::types::{Timestamp, TxnId};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

/// serde adapter: roaring's own portable byte format.
pub mod serde_bitmap {
    use roaring::RoaringBitmap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bm: &RoaringBitmap, s: S) -> Result<S::Ok, S::Error> {
        let mut buf = Vec::with_capacity(bm.serialized_size());
        bm.serialize_into(&mut buf).map_err(serde::ser::Error::custom)?;
        buf.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RoaringBitmap, D::Error> {
        let buf = Vec::<u8>::deserialize(d)?;
        RoaringBitmap::deserialize_from(&buf[..]).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteNode {
    #[serde(with = "serde_bitmap")]
    pub rows: RoaringBitmap,
    pub commit_ts: Timestamp,
    pub tran_id: TxnId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DeleteChain {
    /// Ascending commit timestamp.
    nodes: Vec<DeleteNode>,
}

impl DeleteChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_committed(&mut self, tran_id: TxnId, ts: Timestamp, rows: RoaringBitmap) {
        if rows.is_empty() {
            return;
        }
        let pos = self.nodes.partition_point(|n| n.commit_ts <= ts);
        self.nodes.insert(pos, DeleteNode { rows, commit_ts: ts, tran_id });
    }

    /// Replay idempotence: already holds a node at exactly `ts`?
    pub fn has_commit_at(&self, ts: Timestamp) -> bool {
        self.nodes.iter().any(|n| n.commit_ts == ts)
    }

    /// Union of every node at or before `snapshot`.
    pub fn mask_at(&self, snapshot: Timestamp) -> RoaringBitmap {
        let mut mask = RoaringBitmap::new();
        for node in &self.nodes {
            if node.commit_ts > snapshot {
                break;
            }
            mask |= &node.rows;
        }
        mask
    }

    pub fn is_deleted_at(&self, row: u32, snapshot: Timestamp) -> bool {
        self.nodes
            .iter()
            .take_while(|n| n.commit_ts <= snapshot)
            .any(|n| n.rows.contains(row))
    }

    pub fn deleted_count_at(&self, snapshot: Timestamp) -> u64 {
        self.mask_at(snapshot).len()
    }

    /// A preparing delete conflicts with any committed delete of the same
    /// rows it could not see.
    pub fn check_ww(&self, rows: &RoaringBitmap, start_ts: Timestamp) -> Result<()> {
        for node in self.nodes.iter().rev() {
            if node.commit_ts <= start_ts {
                break;
            }
            let overlap = &node.rows & rows;
            if !overlap.is_empty() {
                return Err(EngineError::WWConflict(format!(
                    "row {} deleted at {}",
                    overlap.iter().next().unwrap_or(0),
                    node.commit_ts
                )));
            }
        }
        Ok(())
    }

    /// Nodes with `after < commit_ts <= until`, oldest first. Flush uses this
    /// to carry racing deletes forward through the transfer map.
    pub fn committed_in(&self, after: Timestamp, until: Timestamp) -> Vec<(Timestamp, RoaringBitmap)> {
        self.nodes
            .iter()
            .filter(|n| n.commit_ts > after && n.commit_ts <= until)
            .map(|n| (n.commit_ts, n.rows.clone()))
            .collect()
    }

    /// All nodes, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DeleteNode> {
        self.nodes.iter()
    }

    pub fn max_ts(&self) -> Option<Timestamp> {
        self.nodes.last().map(|n| n.commit_ts)
    }

    /// Drop nodes covered by a persisted delta payload.
    pub fn prune_upto(&mut self, ts: Timestamp) {
        self.nodes.retain(|n| n.commit_ts > ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: i64) -> Timestamp {
        Timestamp::new(n, 0)
    }

    fn rows(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_mask_honors_snapshot() {
        let mut chain = DeleteChain::new();
        chain.add_committed(1, ts(10), rows(&[1, 2]));
        chain.add_committed(2, ts(20), rows(&[3]));

        assert_eq!(chain.mask_at(ts(5)).len(), 0);
        assert_eq!(chain.mask_at(ts(10)), rows(&[1, 2]));
        assert_eq!(chain.mask_at(ts(25)), rows(&[1, 2, 3]));
        assert!(chain.is_deleted_at(3, ts(20)));
        assert!(!chain.is_deleted_at(3, ts(19)));
    }

    #[test]
    fn test_ww_on_unseen_delete() {
        let mut chain = DeleteChain::new();
        chain.add_committed(1, ts(10), rows(&[5]));
        // Started before the delete committed: conflict.
        assert!(chain.check_ww(&rows(&[5]), ts(9)).is_err());
        // Started after: no conflict.
        assert!(chain.check_ww(&rows(&[5]), ts(10)).is_ok());
        // Disjoint rows never conflict.
        assert!(chain.check_ww(&rows(&[6]), ts(0)).is_ok());
    }

    #[test]
    fn test_committed_in_window() {
        let mut chain = DeleteChain::new();
        chain.add_committed(1, ts(10), rows(&[1]));
        chain.add_committed(2, ts(20), rows(&[2]));
        chain.add_committed(3, ts(30), rows(&[3]));
        let window = chain.committed_in(ts(10), ts(30));
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].0, ts(20));
        assert_eq!(window[1].0, ts(30));
    }

    #[test]
    fn test_prune_upto() {
        let mut chain = DeleteChain::new();
        chain.add_committed(1, ts(10), rows(&[1]));
        chain.add_committed(2, ts(20), rows(&[2]));
        chain.prune_upto(ts(10));
        assert_eq!(chain.mask_at(ts(25)), rows(&[2]));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut chain = DeleteChain::new();
        chain.add_committed(1, ts(10), rows(&[1, 100, 65536]));
        let bytes = bincode::serialize(&chain).unwrap();
        let back: DeleteChain = bincode::deserialize(&bytes).unwrap();
        assert_eq!(chain, back);
    }
}
