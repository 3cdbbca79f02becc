//! Committed-record application
//!
//! The single path that turns a prepared record into catalog and block state.
//! Live commits and restart replay both come through here; every op guards on
//! already-applied state, so replaying a record any number of times converges
//! to the same catalog (checkpoint + WAL overlap is harmless).

use super::{
    BlockEntry, Catalog, CommitChain, DatabaseEntry, EntryOp, SegmentEntry, TableEntry,
};
use crate::data::{BlockData, PersistedData};
use crate::error::{EngineError, Result};
use crate::types::{Sequence, Timestamp, TxnId};
use crate::wal::record::{AlterRecord, BlockMutation, CatalogOp, PreparedRecord, RecordOp};
use std::sync::Arc;

pub fn apply_record(
    catalog: &Catalog,
    seq: &Sequence,
    record: &PreparedRecord,
    lsn: Option<u64>,
) -> Result<()> {
    let ts = record.commit_ts;
    let txn = record.txn_id;
    for op in &record.ops {
        match op {
            RecordOp::Catalog(op) => apply_catalog_op(catalog, seq, op, txn, ts, lsn)?,
            RecordOp::Mutation(m) => apply_mutation(catalog, m, txn, ts)?,
            RecordOp::Alter(a) => apply_alter(catalog, a, ts)?,
        }
    }
    Ok(())
}

fn apply_catalog_op(
    catalog: &Catalog,
    seq: &Sequence,
    op: &CatalogOp,
    txn: TxnId,
    ts: Timestamp,
    lsn: Option<u64>,
) -> Result<()> {
    match op {
        CatalogOp::CreateDatabase { id, name, tenant } => {
            seq.observe_database_id(*id);
            if let Some(db) = catalog.database(*id) {
                if db.chain.read().has_op_at(ts, EntryOp::Create) {
                    return Ok(());
                }
            }
            let db = DatabaseEntry::new(*id, name.clone(), *tenant);
            *db.chain.write() = CommitChain::committed(txn, ts, EntryOp::Create);
            catalog.insert_database(db);
            catalog.db_names.write().insert(*tenant, name, *id, ts);
        }
        CatalogOp::DropDatabase { id, name, tenant, hard } => {
            let db = catalog
                .database(*id)
                .ok_or_else(|| EngineError::Internal(format!("drop of unknown db {}", id)))?;
            let op = if *hard { EntryOp::HardDelete } else { EntryOp::SoftDelete };
            let mut chain = db.chain.write();
            if chain.has_op_at(ts, op) {
                return Ok(());
            }
            chain.push_committed(txn, ts, op, lsn);
            drop(chain);
            catalog.db_names.write().mark_dropped(*tenant, name, *id, ts);
        }
        CatalogOp::CreateTable { db, id, tenant, schema } => {
            seq.observe_table_id(*id);
            let database = catalog
                .database(*db)
                .ok_or_else(|| EngineError::Internal(format!("table in unknown db {}", db)))?;
            if let Some(table) = database.table(*id) {
                if table.chain.read().has_op_at(ts, EntryOp::Create) {
                    return Ok(());
                }
            }
            let table = TableEntry::new(*id, *db, *tenant, Arc::new(schema.clone()));
            *table.chain.write() = CommitChain::committed(txn, ts, EntryOp::Create);
            database.insert_table(table);
            database.table_names.write().insert(*tenant, &schema.name, *id, ts);
        }
        CatalogOp::DropTable { db, id, tenant, name, hard } => {
            let database = catalog
                .database(*db)
                .ok_or_else(|| EngineError::Internal(format!("drop in unknown db {}", db)))?;
            let table = database
                .table(*id)
                .ok_or_else(|| EngineError::Internal(format!("drop of unknown table {}", id)))?;
            let op = if *hard { EntryOp::HardDelete } else { EntryOp::SoftDelete };
            let mut chain = table.chain.write();
            if chain.has_op_at(ts, op) {
                return Ok(());
            }
            chain.push_committed(txn, ts, op, lsn);
            drop(chain);
            database.table_names.write().mark_dropped(*tenant, name, *id, ts);
        }
        CatalogOp::CreateSegment { db, table, id, appendable, sorted } => {
            let entry = catalog.get_table_raw(*db, *table)?;
            if let Some(segment) = entry.segment(*id) {
                if segment.chain.read().has_op_at(ts, EntryOp::Create) {
                    return Ok(());
                }
            }
            let segment = SegmentEntry::new(*id, *table, *db, *appendable, *sorted);
            *segment.chain.write() = CommitChain::committed(txn, ts, EntryOp::Create);
            entry.insert_segment(segment);
        }
        CatalogOp::DropSegment { db, table, id } => {
            let entry = catalog.get_table_raw(*db, *table)?;
            let segment = entry
                .segment(*id)
                .ok_or_else(|| EngineError::Internal(format!("drop of unknown segment {}", id)))?;
            let mut chain = segment.chain.write();
            if !chain.has_op_at(ts, EntryOp::SoftDelete) {
                chain.push_committed(txn, ts, EntryOp::SoftDelete, lsn);
            }
        }
        CatalogOp::UpgradeSegment { db, table, id, op } => {
            let entry = catalog.get_table_raw(*db, *table)?;
            let segment = entry
                .segment(*id)
                .ok_or_else(|| EngineError::Internal(format!("upgrade of unknown segment {}", id)))?;
            let mut chain = segment.chain.write();
            if !chain.has_op_at(ts, *op) {
                chain.push_committed(txn, ts, *op, lsn);
            }
        }
        CatalogOp::CreateBlock { addr, schema_version } => {
            let table = catalog.get_table_raw(addr.db, addr.table)?;
            let segment = table.segment(addr.segment()).ok_or_else(|| {
                EngineError::Internal(format!("block in unknown segment {}", addr.segment()))
            })?;
            if let Some(block) = segment.block(addr.block.offset) {
                if block.chain.read().has_op_at(ts, EntryOp::Create) {
                    return Ok(());
                }
            }
            let schema = table.schema_at(*schema_version).ok_or_else(|| {
                EngineError::Internal(format!("unknown schema version {}", schema_version))
            })?;
            let block = BlockEntry::new_appendable(*addr, schema);
            *block.chain.write() = CommitChain::committed(txn, ts, EntryOp::Create);
            segment.insert_block(block);
        }
        CatalogOp::UpgradeBlock { addr, op } => {
            let block = catalog.get_block(*addr)?;
            let mut chain = block.chain.write();
            if !chain.has_op_at(ts, *op) {
                chain.push_committed(txn, ts, *op, lsn);
            }
        }
        CatalogOp::DropBlock { addr, hard } => {
            let block = catalog.get_block(*addr)?;
            let op = if *hard { EntryOp::HardDelete } else { EntryOp::SoftDelete };
            let mut chain = block.chain.write();
            if !chain.has_op_at(ts, op) {
                chain.push_committed(txn, ts, op, lsn);
            }
        }
    }
    Ok(())
}

fn apply_mutation(catalog: &Catalog, m: &BlockMutation, txn: TxnId, ts: Timestamp) -> Result<()> {
    match m {
        BlockMutation::Append { addr, batch } => {
            let block = catalog.get_block(*addr)?;
            let mut data = block.data.write();
            let appendable = data.as_appendable_mut().ok_or_else(|| {
                EngineError::Internal(format!("append to non-appendable block {}", addr))
            })?;
            appendable.apply_append(txn, ts, batch)?;
        }
        BlockMutation::Delete { addr, rows, at } => {
            let block = catalog.get_block(*addr)?;
            let at = at.unwrap_or(ts);
            let mut data = block.data.write();
            let chain = data.deletes_mut();
            if !chain.has_commit_at(at) {
                chain.add_committed(txn, at, rows.iter().copied().collect());
            }
        }
        BlockMutation::SetMetaLoc { addr, loc, row_count, schema_version } => {
            let block = catalog.get_block(*addr)?;
            let mut data = block.data.write();
            if matches!(data.as_persisted(), Some(p) if p.meta_loc == *loc) {
                return Ok(());
            }
            let mut persisted = PersistedData::new(loc.clone(), *row_count, *schema_version);
            // Deletes already applied on this block survive the swap.
            persisted.deletes = data.deletes().clone();
            *data = BlockData::Persisted(persisted);
        }
        BlockMutation::SetDeltaLoc { addr, loc, covered_ts } => {
            let block = catalog.get_block(*addr)?;
            let mut data = block.data.write();
            let persisted = data.as_persisted_mut().ok_or_else(|| {
                EngineError::Internal(format!("delta location on appendable block {}", addr))
            })?;
            if persisted.delta_loc.as_ref() == Some(loc) {
                return Ok(());
            }
            persisted.delta_loc = Some(loc.clone());
            persisted.deletes.prune_upto(*covered_ts);
        }
    }
    Ok(())
}

fn apply_alter(catalog: &Catalog, a: &AlterRecord, ts: Timestamp) -> Result<()> {
    let table = catalog.get_table_raw(a.db, a.table)?;
    if table.schema().version >= a.new_schema.version {
        return Ok(());
    }
    let old_name = table.name();
    table.push_schema(Arc::new(a.new_schema.clone()))?;
    if a.new_schema.name != old_name {
        let db = catalog
            .database(a.db)
            .ok_or_else(|| EngineError::Internal(format!("alter in unknown db {}", a.db)))?;
        let mut names = db.table_names.write();
        names.mark_dropped(a.tenant, &old_name, a.table, ts);
        names.insert(a.tenant, &a.new_schema.name, a.table, ts);
    }
    Ok(())
}

impl Catalog {
    /// Entry lookup without visibility filtering; apply and replay use it.
    pub(crate) fn get_table_raw(
        &self,
        db: crate::types::DatabaseId,
        table: crate::types::TableId,
    ) -> Result<Arc<TableEntry>> {
        self.database(db)
            .and_then(|d| d.table(table))
            .ok_or_else(|| EngineError::Internal(format!("unknown table {}/{}", db, table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::types::{BlockAddr, BlockId, ColumnVector, LogicalType, SegmentId, Value};
    use crate::wal::record::WalPayload;

    fn ts(n: i64) -> Timestamp {
        Timestamp::new(n, 0)
    }

    fn schema() -> Schema {
        Schema::new("t1", vec![("pk", LogicalType::Int32)], "pk", 10, 2).unwrap()
    }

    fn sample_record() -> PreparedRecord {
        let seg = SegmentId(42);
        let addr = BlockAddr::new(7, 100, BlockId::new(seg, 0));
        let batch = crate::data::Batch::new(vec![ColumnVector::from_values(
            LogicalType::Int32,
            vec![Value::Int32(1), Value::Int32(2)],
        )])
        .unwrap();
        PreparedRecord {
            txn_id: 9,
            commit_ts: ts(10),
            tenant: 1,
            ops: vec![
                RecordOp::Catalog(CatalogOp::CreateDatabase { id: 7, name: "db1".into(), tenant: 1 }),
                RecordOp::Catalog(CatalogOp::CreateTable {
                    db: 7,
                    id: 100,
                    tenant: 1,
                    schema: schema(),
                }),
                RecordOp::Catalog(CatalogOp::CreateSegment {
                    db: 7,
                    table: 100,
                    id: seg,
                    appendable: true,
                    sorted: true,
                }),
                RecordOp::Catalog(CatalogOp::CreateBlock { addr, schema_version: 0 }),
                RecordOp::Mutation(BlockMutation::Append { addr, batch }),
            ],
        }
    }

    #[test]
    fn test_apply_builds_tree() {
        let catalog = Catalog::new();
        let seq = Sequence::new();
        apply_record(&catalog, &seq, &sample_record(), Some(1)).unwrap();

        let table = catalog.get_table_by_name(1, 7, "t1", ts(10)).unwrap();
        assert_eq!(table.id, 100);
        let segments = table.visible_segments(ts(10), None);
        assert_eq!(segments.len(), 1);
        let blocks = segments[0].visible_blocks(ts(10), None);
        assert_eq!(blocks.len(), 1);
        let data = blocks[0].data.read();
        assert_eq!(data.as_appendable().unwrap().total_rows(), 2);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let catalog = Catalog::new();
        let seq = Sequence::new();
        let record = sample_record();
        apply_record(&catalog, &seq, &record, Some(1)).unwrap();
        apply_record(&catalog, &seq, &record, Some(1)).unwrap();

        let table = catalog.get_table_by_name(1, 7, "t1", ts(10)).unwrap();
        let blocks = table.visible_segments(ts(10), None)[0].visible_blocks(ts(10), None);
        let data = blocks[0].data.read();
        assert_eq!(data.as_appendable().unwrap().total_rows(), 2);
        assert_eq!(table.chain.read().len(), 1);
    }

    #[test]
    fn test_apply_observes_id_sequences() {
        let catalog = Catalog::new();
        let seq = Sequence::new();
        apply_record(&catalog, &seq, &sample_record(), None).unwrap();
        assert!(seq.next_database_id() > 7);
        assert!(seq.next_table_id() > 100);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let payload = WalPayload::Prepared(sample_record());
        let bytes = bincode::serialize(&payload).unwrap();
        let back: WalPayload = bincode::deserialize(&bytes).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn test_drop_and_rename_update_names() {
        let catalog = Catalog::new();
        let seq = Sequence::new();
        apply_record(&catalog, &seq, &sample_record(), None).unwrap();

        let renamed = schema()
            .apply_alter(&crate::schema::AlterRequest::RenameTable {
                old: "t1".into(),
                new: "t2".into(),
            })
            .unwrap();
        let record = PreparedRecord {
            txn_id: 10,
            commit_ts: ts(20),
            tenant: 1,
            ops: vec![RecordOp::Alter(AlterRecord {
                db: 7,
                table: 100,
                tenant: 1,
                req: crate::schema::AlterRequest::RenameTable { old: "t1".into(), new: "t2".into() },
                new_schema: renamed,
            })],
        };
        apply_record(&catalog, &seq, &record, None).unwrap();
        apply_record(&catalog, &seq, &record, None).unwrap();

        assert!(catalog.get_table_by_name(1, 7, "t1", ts(25)).is_err());
        assert_eq!(catalog.get_table_by_name(1, 7, "t2", ts(25)).unwrap().id, 100);
        // The old name still resolves at an old snapshot.
        assert_eq!(catalog.get_table_by_name(1, 7, "t1", ts(15)).unwrap().id, 100);
    }
}
