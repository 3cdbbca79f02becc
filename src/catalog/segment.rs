//! Segment catalog entry

use super::block::BlockEntry;
use super::chain::{CommitChain, Visibility};
use crate::types::{DatabaseId, SegmentId, TableId, Timestamp, TxnId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct SegmentEntry {
    pub id: SegmentId,
    pub table_id: TableId,
    pub db_id: DatabaseId,

    /// Appendable segments receive new appendable blocks; merge outputs are
    /// non-appendable from birth.
    pub appendable: bool,

    /// Rows across the segment's blocks are sorted on the primary key.
    pub sorted: bool,

    pub chain: RwLock<CommitChain>,
    blocks: RwLock<BTreeMap<u16, Arc<BlockEntry>>>,
}

impl SegmentEntry {
    pub fn new(
        id: SegmentId,
        table_id: TableId,
        db_id: DatabaseId,
        appendable: bool,
        sorted: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            table_id,
            db_id,
            appendable,
            sorted,
            chain: RwLock::new(CommitChain::new()),
            blocks: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn insert_block(&self, block: Arc<BlockEntry>) {
        self.blocks.write().insert(block.addr.block.offset, block);
    }

    pub fn remove_block(&self, offset: u16) {
        self.blocks.write().remove(&offset);
    }

    pub fn block(&self, offset: u16) -> Option<Arc<BlockEntry>> {
        self.blocks.read().get(&offset).cloned()
    }

    pub fn blocks_vec(&self) -> Vec<Arc<BlockEntry>> {
        self.blocks.read().values().cloned().collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn next_block_offset(&self) -> u16 {
        self.blocks.read().keys().next_back().map(|o| o + 1).unwrap_or(0)
    }

    pub fn visible_blocks(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Vec<Arc<BlockEntry>> {
        self.blocks
            .read()
            .values()
            .filter(|b| b.visibility(snapshot, self_txn) == Visibility::Visible)
            .cloned()
            .collect()
    }

    /// Tail block if it is still appendable and not full.
    pub fn appendable_tail(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Option<Arc<BlockEntry>> {
        let blocks = self.blocks.read();
        let tail = blocks.values().next_back()?.clone();
        drop(blocks);
        if tail.visibility(snapshot, self_txn) != Visibility::Visible {
            return None;
        }
        let has_space = {
            let data = tail.data.read();
            matches!(data.as_appendable(), Some(a) if !a.is_full())
        };
        if has_space {
            Some(tail)
        } else {
            None
        }
    }

    pub fn visibility(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Visibility {
        self.chain.read().visibility(snapshot, self_txn)
    }

    /// Closed segments stopped accepting blocks.
    pub fn is_closed(&self) -> bool {
        self.chain
            .read()
            .nodes()
            .iter()
            .any(|n| n.op == super::chain::EntryOp::UpgradeClose && n.commit_ts.is_some())
    }
}
