//! Table catalog entry
//!
//! A table owns its segments and the full history of its schema versions.
//! Versions are immutable and refcounted: every block records the version it
//! was written under, and replay resolves columns through it by seqnum.

use super::block::BlockEntry;
use super::chain::{CommitChain, Visibility};
use super::segment::SegmentEntry;
use crate::error::{EngineError, Result};
use crate::schema::Schema;
use crate::types::{BlockId, DatabaseId, SegmentId, TableId, Timestamp, TxnId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct TableEntry {
    pub id: TableId,
    pub db_id: DatabaseId,
    pub tenant: u32,

    /// Version `i` lives at index `i`.
    schemas: RwLock<Vec<Arc<Schema>>>,

    pub chain: RwLock<CommitChain>,
    segments: RwLock<BTreeMap<SegmentId, Arc<SegmentEntry>>>,
}

impl TableEntry {
    pub fn new(id: TableId, db_id: DatabaseId, tenant: u32, schema: Arc<Schema>) -> Arc<Self> {
        Arc::new(Self {
            id,
            db_id,
            tenant,
            schemas: RwLock::new(vec![schema]),
            chain: RwLock::new(CommitChain::new()),
            segments: RwLock::new(BTreeMap::new()),
        })
    }

    /// Latest schema version.
    pub fn schema(&self) -> Arc<Schema> {
        self.schemas.read().last().cloned().expect("table always has a schema")
    }

    pub fn schema_at(&self, version: u32) -> Option<Arc<Schema>> {
        self.schemas.read().get(version as usize).cloned()
    }

    pub fn name(&self) -> String {
        self.schema().name.clone()
    }

    /// Install the next schema version. Idempotent: replaying the same alter
    /// twice keeps the version list dense.
    pub fn push_schema(&self, schema: Arc<Schema>) -> Result<()> {
        let mut schemas = self.schemas.write();
        let expect = schemas.len() as u32;
        if schema.version < expect {
            return Ok(());
        }
        if schema.version != expect {
            return Err(EngineError::Internal(format!(
                "schema version gap: {} after {}",
                schema.version,
                expect - 1
            )));
        }
        schemas.push(schema);
        Ok(())
    }

    pub fn insert_segment(&self, segment: Arc<SegmentEntry>) {
        self.segments.write().insert(segment.id, segment);
    }

    pub fn remove_segment(&self, id: SegmentId) {
        self.segments.write().remove(&id);
    }

    pub fn segment(&self, id: SegmentId) -> Option<Arc<SegmentEntry>> {
        self.segments.read().get(&id).cloned()
    }

    pub fn segments_vec(&self) -> Vec<Arc<SegmentEntry>> {
        self.segments.read().values().cloned().collect()
    }

    pub fn visible_segments(
        &self,
        snapshot: Timestamp,
        self_txn: Option<TxnId>,
    ) -> Vec<Arc<SegmentEntry>> {
        self.segments
            .read()
            .values()
            .filter(|s| s.visibility(snapshot, self_txn) == Visibility::Visible)
            .cloned()
            .collect()
    }

    /// Last appendable segment visible at the snapshot; appends target its
    /// tail block.
    pub fn last_appendable_segment(
        &self,
        snapshot: Timestamp,
        self_txn: Option<TxnId>,
    ) -> Option<Arc<SegmentEntry>> {
        self.segments
            .read()
            .values()
            .rev()
            .find(|s| {
                s.appendable
                    && !s.is_closed()
                    && s.visibility(snapshot, self_txn) == Visibility::Visible
            })
            .cloned()
    }

    pub fn find_block(&self, block: BlockId) -> Option<(Arc<SegmentEntry>, Arc<BlockEntry>)> {
        let segment = self.segment(block.segment)?;
        let entry = segment.block(block.offset)?;
        Some((segment, entry))
    }

    pub fn visibility(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Visibility {
        self.chain.read().visibility(snapshot, self_txn)
    }
}
