//! Prepared transaction records
//!
//! A committing transaction serializes its whole effect as one ordered op
//! list: catalog ops, block mutations and alters. The same record type flows
//! through the WAL, the incremental checkpoint and restart replay; applying
//! it is idempotent.

use crate::catalog::EntryOp;
use crate::data::Batch;
use crate::fs::Location;
use crate::schema::{AlterRequest, Schema};
use crate::types::{BlockAddr, DatabaseId, SegmentId, TableId, Timestamp, TxnId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CatalogOp {
    CreateDatabase {
        id: DatabaseId,
        name: String,
        tenant: u32,
    },
    DropDatabase {
        id: DatabaseId,
        name: String,
        tenant: u32,
        hard: bool,
    },
    CreateTable {
        db: DatabaseId,
        id: TableId,
        tenant: u32,
        schema: Schema,
    },
    DropTable {
        db: DatabaseId,
        id: TableId,
        tenant: u32,
        name: String,
        hard: bool,
    },
    CreateSegment {
        db: DatabaseId,
        table: TableId,
        id: SegmentId,
        appendable: bool,
        sorted: bool,
    },
    DropSegment {
        db: DatabaseId,
        table: TableId,
        id: SegmentId,
    },
    UpgradeSegment {
        db: DatabaseId,
        table: TableId,
        id: SegmentId,
        op: EntryOp,
    },
    CreateBlock {
        addr: BlockAddr,
        schema_version: u32,
    },
    UpgradeBlock {
        addr: BlockAddr,
        op: EntryOp,
    },
    DropBlock {
        addr: BlockAddr,
        hard: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BlockMutation {
    Append {
        addr: BlockAddr,
        batch: Batch,
    },
    Delete {
        addr: BlockAddr,
        rows: Vec<u32>,
        /// Deletes carried forward by a flush/merge keep their original
        /// commit timestamp; `None` means the record's own.
        at: Option<Timestamp>,
    },
    SetMetaLoc {
        addr: BlockAddr,
        loc: Location,
        row_count: u32,
        schema_version: u32,
    },
    SetDeltaLoc {
        addr: BlockAddr,
        loc: Location,
        /// Resident delete nodes at or before this are covered by the delta.
        covered_ts: Timestamp,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlterRecord {
    pub db: DatabaseId,
    pub table: TableId,
    pub tenant: u32,
    pub req: AlterRequest,
    /// Schema produced by the alter; replay installs it verbatim.
    pub new_schema: Schema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RecordOp {
    Catalog(CatalogOp),
    Mutation(BlockMutation),
    Alter(AlterRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreparedRecord {
    pub txn_id: TxnId,
    pub commit_ts: Timestamp,
    pub tenant: u32,
    pub ops: Vec<RecordOp>,
}

impl PreparedRecord {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Tables touched by this record, deduplicated.
    pub fn touched_tables(&self) -> Vec<(DatabaseId, TableId)> {
        let mut tables: Vec<(DatabaseId, TableId)> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                RecordOp::Catalog(CatalogOp::CreateTable { db, id, .. })
                | RecordOp::Catalog(CatalogOp::DropTable { db, id, .. })
                | RecordOp::Catalog(CatalogOp::CreateSegment { db, table: id, .. })
                | RecordOp::Catalog(CatalogOp::DropSegment { db, table: id, .. })
                | RecordOp::Catalog(CatalogOp::UpgradeSegment { db, table: id, .. }) => {
                    Some((*db, *id))
                }
                RecordOp::Catalog(CatalogOp::CreateBlock { addr, .. })
                | RecordOp::Catalog(CatalogOp::UpgradeBlock { addr, .. })
                | RecordOp::Catalog(CatalogOp::DropBlock { addr, .. }) => {
                    Some((addr.db, addr.table))
                }
                RecordOp::Mutation(m) => {
                    let addr = match m {
                        BlockMutation::Append { addr, .. }
                        | BlockMutation::Delete { addr, .. }
                        | BlockMutation::SetMetaLoc { addr, .. }
                        | BlockMutation::SetDeltaLoc { addr, .. } => addr,
                    };
                    Some((addr.db, addr.table))
                }
                RecordOp::Alter(a) => Some((a.db, a.table)),
                RecordOp::Catalog(CatalogOp::CreateDatabase { .. })
                | RecordOp::Catalog(CatalogOp::DropDatabase { .. }) => None,
            })
            .collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }
}

/// What a WAL frame carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WalPayload {
    Prepared(PreparedRecord),
    /// Durable pointer to a cut checkpoint; replay before it is redundant.
    CheckpointPointer {
        start: Timestamp,
        end: Timestamp,
        location: Vec<u8>,
    },
}
