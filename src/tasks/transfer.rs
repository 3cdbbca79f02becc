//! Row transfer table
//!
//! When a flush or merge retires a block, it installs a mapping from each
//! surviving old row to its new address. Transactions that were in flight
//! across the task consult the mapping at prepare to redirect their deletes.
//! A missing row means the task itself dropped it (the caller's delete is a
//! no-op); a missing block means the mapping aged out and the caller is too
//! old to be redirected.

use crate::types::{BlockId, Timestamp};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remap {
    /// The row lives on at a new address.
    To(BlockId, u32),
    /// The task already deleted this row.
    Dropped,
    /// No mapping is retained for this block.
    Unknown,
}

#[derive(Debug)]
pub struct BlockTransfer {
    pub retire_ts: Timestamp,
    rows: DashMap<u32, (BlockId, u32)>,
}

impl BlockTransfer {
    fn new(retire_ts: Timestamp, mapping: impl IntoIterator<Item = (u32, (BlockId, u32))>) -> Self {
        let rows = DashMap::new();
        for (old, new) in mapping {
            rows.insert(old, new);
        }
        Self { retire_ts, rows }
    }
}

#[derive(Debug, Default)]
pub struct TransferTable {
    blocks: DashMap<BlockId, Arc<BlockTransfer>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(
        &self,
        old_block: BlockId,
        retire_ts: Timestamp,
        mapping: impl IntoIterator<Item = (u32, (BlockId, u32))>,
    ) {
        self.blocks.insert(old_block, Arc::new(BlockTransfer::new(retire_ts, mapping)));
    }

    pub fn remap(&self, old_block: BlockId, row: u32) -> Remap {
        match self.blocks.get(&old_block) {
            None => Remap::Unknown,
            Some(transfer) => match transfer.rows.get(&row) {
                Some(entry) => {
                    let (block, new_row) = *entry;
                    Remap::To(block, new_row)
                }
                None => Remap::Dropped,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop mappings no live transaction can still need: every active txn
    /// started at or after the block's retire timestamp sees the new block
    /// directly.
    pub fn sweep(&self, min_active_start: Timestamp) {
        self.blocks.retain(|_, transfer| transfer.retire_ts >= min_active_start);
    }
}
