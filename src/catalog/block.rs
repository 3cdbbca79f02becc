//! Block catalog entry

use super::chain::{CommitChain, Visibility};
use crate::data::{AppendableData, BlockData, PersistedData};
use crate::schema::Schema;
use crate::types::{BlockAddr, Timestamp, TxnId};
use parking_lot::RwLock;
use std::sync::Arc;

/// A block: identity, commit chain, and the tagged data variant. The chain
/// and the data carry their own locks; visibility queries never touch the
/// data lock.
pub struct BlockEntry {
    pub addr: BlockAddr,

    /// Schema version the block's rows were written under.
    pub schema_version: u32,

    pub chain: RwLock<CommitChain>,
    pub data: RwLock<BlockData>,
}

impl BlockEntry {
    pub fn new_appendable(addr: BlockAddr, schema: Arc<Schema>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            schema_version: schema.version,
            chain: RwLock::new(CommitChain::new()),
            data: RwLock::new(BlockData::Appendable(AppendableData::new(schema))),
        })
    }

    pub fn new_persisted(addr: BlockAddr, schema_version: u32, data: PersistedData) -> Arc<Self> {
        Arc::new(Self {
            addr,
            schema_version,
            chain: RwLock::new(CommitChain::new()),
            data: RwLock::new(BlockData::Persisted(data)),
        })
    }

    pub fn is_appendable(&self) -> bool {
        self.data.read().is_appendable()
    }

    pub fn visibility(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Visibility {
        self.chain.read().visibility(snapshot, self_txn)
    }

    pub fn is_visible(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> bool {
        self.visibility(snapshot, self_txn) == Visibility::Visible
    }

    /// Rows the block contributes to the table's logical row count at a
    /// snapshot. `None` when persisted counting needs the reader (delta
    /// deletes not resident).
    pub fn resident_live_count(&self, snapshot: Timestamp) -> Option<u32> {
        match &*self.data.read() {
            BlockData::Appendable(data) => Some(data.live_count(snapshot)),
            BlockData::Persisted(data) => {
                if data.delta_loc.is_some() {
                    None
                } else {
                    Some(data.live_count(None, snapshot))
                }
            }
        }
    }
}
