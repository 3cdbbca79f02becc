//! Incremental checkpoint payload
//!
//! One self-describing object per checkpoint window, holding the committed
//! ops of `(start.prev, end]` split into the catalog / alter / block-meta /
//! data-insert / data-delete categories. Every op keeps its commit
//! timestamp, transaction, LSN and position, so the original records can be
//! reassembled exactly for replay.

use crate::logtail::CommittedRecord;
use crate::types::{Timestamp, TxnId};
use crate::wal::record::{AlterRecord, BlockMutation, CatalogOp, PreparedRecord, RecordOp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CkpOp<T> {
    pub commit_ts: Timestamp,
    pub txn_id: TxnId,
    pub tenant: u32,
    pub lsn: u64,
    /// Position within the original record; replay restores op order.
    pub op_index: u32,
    pub op: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointData {
    pub start: Timestamp,
    pub end: Timestamp,
    pub catalog_ops: Vec<CkpOp<CatalogOp>>,
    pub alters: Vec<CkpOp<AlterRecord>>,
    pub block_meta: Vec<CkpOp<BlockMutation>>,
    pub data_inserts: Vec<CkpOp<BlockMutation>>,
    pub data_deletes: Vec<CkpOp<BlockMutation>>,
}

impl CheckpointData {
    pub fn from_records(
        start: Timestamp,
        end: Timestamp,
        records: &[Arc<CommittedRecord>],
    ) -> Self {
        let mut data = CheckpointData { start, end, ..Default::default() };
        for committed in records {
            let rec = &committed.record;
            for (idx, op) in rec.ops.iter().enumerate() {
                match op {
                    RecordOp::Catalog(c) => {
                        data.catalog_ops.push(stamp(rec, committed.lsn, idx, c.clone()))
                    }
                    RecordOp::Alter(a) => {
                        data.alters.push(stamp(rec, committed.lsn, idx, a.clone()))
                    }
                    RecordOp::Mutation(m) => {
                        let slot = match m {
                            BlockMutation::Append { .. } => &mut data.data_inserts,
                            BlockMutation::Delete { .. } => &mut data.data_deletes,
                            BlockMutation::SetMetaLoc { .. }
                            | BlockMutation::SetDeltaLoc { .. } => &mut data.block_meta,
                        };
                        slot.push(stamp(rec, committed.lsn, idx, m.clone()));
                    }
                }
            }
        }
        data
    }

    /// Reassemble the original prepared records, ordered by commit timestamp
    /// and op position.
    pub fn into_records(self) -> Vec<(u64, PreparedRecord)> {
        let mut ops: Vec<(Timestamp, TxnId, u32, u64, u32, RecordOp)> = Vec::new();
        for c in self.catalog_ops {
            ops.push((c.commit_ts, c.txn_id, c.tenant, c.lsn, c.op_index, RecordOp::Catalog(c.op)));
        }
        for a in self.alters {
            ops.push((a.commit_ts, a.txn_id, a.tenant, a.lsn, a.op_index, RecordOp::Alter(a.op)));
        }
        for m in self.block_meta.into_iter().chain(self.data_inserts).chain(self.data_deletes) {
            ops.push((m.commit_ts, m.txn_id, m.tenant, m.lsn, m.op_index, RecordOp::Mutation(m.op)));
        }
        ops.sort_by(|a, b| (a.0, a.4).cmp(&(b.0, b.4)));

        let mut records: Vec<(u64, PreparedRecord)> = Vec::new();
        for (ts, txn_id, tenant, lsn, _, op) in ops {
            match records.last_mut() {
                Some((last_lsn, rec)) if rec.commit_ts == ts && rec.txn_id == txn_id => {
                    debug_assert_eq!(*last_lsn, lsn);
                    rec.ops.push(op);
                }
                _ => records.push((
                    lsn,
                    PreparedRecord { txn_id, commit_ts: ts, tenant, ops: vec![op] },
                )),
            }
        }
        records
    }

    pub fn is_empty(&self) -> bool {
        self.catalog_ops.is_empty()
            && self.alters.is_empty()
            && self.block_meta.is_empty()
            && self.data_inserts.is_empty()
            && self.data_deletes.is_empty()
    }

    pub fn max_lsn(&self) -> u64 {
        let lsns = self
            .catalog_ops
            .iter()
            .map(|o| o.lsn)
            .chain(self.alters.iter().map(|o| o.lsn))
            .chain(self.block_meta.iter().map(|o| o.lsn))
            .chain(self.data_inserts.iter().map(|o| o.lsn))
            .chain(self.data_deletes.iter().map(|o| o.lsn));
        lsns.max().unwrap_or(0)
    }
}

fn stamp<T>(rec: &PreparedRecord, lsn: u64, idx: usize, op: T) -> CkpOp<T> {
    CkpOp {
        commit_ts: rec.commit_ts,
        txn_id: rec.txn_id,
        tenant: rec.tenant,
        lsn,
        op_index: idx as u32,
        op,
    }
}
