//! Logtail producer
//!
//! Every commit publishes its prepared record here, ordered by commit
//! timestamp, globally and per table. Subscribers pull `(have, want]`
//! windows; the same retained records feed the incremental checkpointer.
//!
//! Commands are typed as two logical tables per user table: `data` commands
//! carry the user table's name with the reserved columns `rowid` and
//! `commit_ts` (`aborted` added for deletes); `meta` commands describe
//! block-location changes. `want_state` adds a synthetic catalog snapshot
//! typed as the system tables `mo_database`, `mo_tables` and `mo_columns`,
//! scoped to the caller's tenant.

use crate::catalog::{Catalog, Visibility, SYSTEM_TENANT};
use crate::data::Batch;
use crate::error::Result;
use crate::types::{
    pack_rowid, ColumnVector, DatabaseId, LogicalType, TableId, Timestamp, Value,
};
use crate::wal::record::{BlockMutation, PreparedRecord, RecordOp};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Logical table name for block-meta commands.
pub const META_TABLE: &str = "meta";

#[derive(Debug)]
pub struct CommittedRecord {
    pub commit_ts: Timestamp,
    pub lsn: u64,
    pub record: PreparedRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Insert,
    Delete,
}

#[derive(Debug, Clone)]
pub struct LogtailCommand {
    pub entry_type: EntryType,
    pub table_name: String,
    pub batch: Batch,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncLogtailReq {
    pub cn_have: Timestamp,
    pub cn_want: Timestamp,
    pub db: DatabaseId,
    pub table: TableId,
    pub want_state: bool,
}

#[derive(Debug, Default)]
pub struct LogtailResponse {
    pub commands: Vec<LogtailCommand>,
}

#[derive(Default)]
pub struct LogtailMgr {
    /// Ascending commit timestamp.
    records: RwLock<Vec<Arc<CommittedRecord>>>,
    by_table: RwLock<AHashMap<(DatabaseId, TableId), Vec<Arc<CommittedRecord>>>>,
}

impl LogtailMgr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, record: Arc<CommittedRecord>) {
        let mut by_table = self.by_table.write();
        for key in record.record.touched_tables() {
            by_table.entry(key).or_default().push(record.clone());
        }
        drop(by_table);
        self.records.write().push(record);
    }

    /// Records with `commit_ts ∈ (after, until]`, globally ordered.
    pub fn records_in(&self, after: Timestamp, until: Timestamp) -> Vec<Arc<CommittedRecord>> {
        self.records
            .read()
            .iter()
            .filter(|r| r.commit_ts > after && r.commit_ts <= until)
            .cloned()
            .collect()
    }

    pub fn count_in(&self, after: Timestamp, until: Timestamp) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.commit_ts > after && r.commit_ts <= until)
            .count()
    }

    pub fn max_ts(&self) -> Option<Timestamp> {
        self.records.read().last().map(|r| r.commit_ts)
    }

    /// Drop retained records covered by a global checkpoint.
    pub fn prune_upto(&self, ts: Timestamp) {
        self.records.write().retain(|r| r.commit_ts > ts);
        let mut by_table = self.by_table.write();
        for records in by_table.values_mut() {
            records.retain(|r| r.commit_ts > ts);
        }
        by_table.retain(|_, records| !records.is_empty());
    }

    /// The tail reader: every command for one table in `(have, want]`.
    pub fn sync(
        &self,
        catalog: &Catalog,
        tenant: u32,
        req: &SyncLogtailReq,
    ) -> Result<LogtailResponse> {
        let mut response = LogtailResponse::default();

        let table_name = catalog
            .get_table_by_id(req.db, req.table, req.cn_want, None)
            .map(|t| t.name())
            .unwrap_or_default();

        let records = {
            let by_table = self.by_table.read();
            by_table
                .get(&(req.db, req.table))
                .map(|rs| {
                    rs.iter()
                        .filter(|r| r.commit_ts > req.cn_have && r.commit_ts <= req.cn_want)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        for committed in records {
            for op in &committed.record.ops {
                let mutation = match op {
                    RecordOp::Mutation(m) => m,
                    _ => continue,
                };
                match mutation {
                    BlockMutation::Append { addr, batch }
                        if addr.db == req.db && addr.table == req.table =>
                    {
                        let mut out = batch.clone();
                        let rows = batch.row_count();
                        let mut rowid = ColumnVector::new(LogicalType::Varchar);
                        let mut commit = ColumnVector::new(LogicalType::Varchar);
                        // Row offsets within the target block start where the
                        // block stood before this append; the subscriber only
                        // needs uniqueness, so the offset within the batch is
                        // carried.
                        for row in 0..rows {
                            rowid.push(Value::Varchar(pack_rowid(addr.block, row)));
                            commit.push(Value::Varchar(committed.commit_ts.to_bytes().to_vec()));
                        }
                        out.columns.push(rowid);
                        out.columns.push(commit);
                        response.commands.push(LogtailCommand {
                            entry_type: EntryType::Insert,
                            table_name: table_name.clone(),
                            batch: out,
                        });
                    }
                    BlockMutation::Delete { addr, rows, at }
                        if addr.db == req.db && addr.table == req.table =>
                    {
                        let ts = at.unwrap_or(committed.commit_ts);
                        let mut rowid = ColumnVector::new(LogicalType::Varchar);
                        let mut commit = ColumnVector::new(LogicalType::Varchar);
                        let mut aborted = ColumnVector::new(LogicalType::Bool);
                        for row in rows {
                            rowid.push(Value::Varchar(pack_rowid(addr.block, *row)));
                            commit.push(Value::Varchar(ts.to_bytes().to_vec()));
                            aborted.push(Value::Bool(false));
                        }
                        response.commands.push(LogtailCommand {
                            entry_type: EntryType::Delete,
                            table_name: table_name.clone(),
                            batch: Batch::new(vec![rowid, commit, aborted])?,
                        });
                    }
                    BlockMutation::SetMetaLoc { addr, loc, .. }
                    | BlockMutation::SetDeltaLoc { addr, loc, .. }
                        if addr.db == req.db && addr.table == req.table =>
                    {
                        let block_col = ColumnVector::from_values(
                            LogicalType::Varchar,
                            vec![Value::Varchar(addr.block.to_bytes().to_vec())],
                        );
                        let loc_col = ColumnVector::from_values(
                            LogicalType::Varchar,
                            vec![Value::Varchar(loc.pack())],
                        );
                        let commit_col = ColumnVector::from_values(
                            LogicalType::Varchar,
                            vec![Value::Varchar(committed.commit_ts.to_bytes().to_vec())],
                        );
                        response.commands.push(LogtailCommand {
                            entry_type: EntryType::Insert,
                            table_name: META_TABLE.to_string(),
                            batch: Batch::new(vec![block_col, loc_col, commit_col])?,
                        });
                    }
                    _ => {}
                }
            }
        }

        if req.want_state {
            response.commands.extend(catalog_state(catalog, tenant, req.cn_want)?);
        }
        Ok(response)
    }
}

/// Full catalog snapshot at `ts`, typed as the system tables.
fn catalog_state(catalog: &Catalog, tenant: u32, ts: Timestamp) -> Result<Vec<LogtailCommand>> {
    let mut dat_id = ColumnVector::new(LogicalType::Int64);
    let mut datname = ColumnVector::new(LogicalType::Varchar);
    let mut dat_account = ColumnVector::new(LogicalType::Int64);

    let mut rel_id = ColumnVector::new(LogicalType::Int64);
    let mut relname = ColumnVector::new(LogicalType::Varchar);
    let mut reldatabase = ColumnVector::new(LogicalType::Int64);
    let mut rel_version = ColumnVector::new(LogicalType::Int64);
    let mut rel_account = ColumnVector::new(LogicalType::Int64);

    let mut att_table = ColumnVector::new(LogicalType::Int64);
    let mut attname = ColumnVector::new(LogicalType::Varchar);
    let mut attnum = ColumnVector::new(LogicalType::Int64);
    let mut att_pos = ColumnVector::new(LogicalType::Int64);
    let mut att_notnull = ColumnVector::new(LogicalType::Bool);
    let mut att_primary = ColumnVector::new(LogicalType::Bool);

    for db in catalog.databases_vec() {
        if db.tenant != tenant && db.tenant != SYSTEM_TENANT {
            continue;
        }
        if db.visibility(ts, None) != Visibility::Visible {
            continue;
        }
        dat_id.push(Value::Int64(db.id as i64));
        datname.push(Value::Varchar(db.name.clone().into_bytes()));
        dat_account.push(Value::Int64(db.tenant as i64));

        for table in db.tables_vec() {
            if table.visibility(ts, None) != Visibility::Visible {
                continue;
            }
            let schema = table.schema();
            rel_id.push(Value::Int64(table.id as i64));
            relname.push(Value::Varchar(schema.name.clone().into_bytes()));
            reldatabase.push(Value::Int64(db.id as i64));
            rel_version.push(Value::Int64(schema.version as i64));
            rel_account.push(Value::Int64(table.tenant as i64));

            for (pos, col) in schema.columns.iter().enumerate() {
                att_table.push(Value::Int64(table.id as i64));
                attname.push(Value::Varchar(col.name.clone().into_bytes()));
                attnum.push(Value::Int64(col.seq_num as i64));
                att_pos.push(Value::Int64(pos as i64));
                att_notnull.push(Value::Bool(!col.nullable));
                att_primary.push(Value::Bool(col.primary));
            }
        }
    }

    Ok(vec![
        LogtailCommand {
            entry_type: EntryType::Insert,
            table_name: "mo_database".to_string(),
            batch: Batch::new(vec![dat_id, datname, dat_account])?,
        },
        LogtailCommand {
            entry_type: EntryType::Insert,
            table_name: "mo_tables".to_string(),
            batch: Batch::new(vec![rel_id, relname, reldatabase, rel_version, rel_account])?,
        },
        LogtailCommand {
            entry_type: EntryType::Insert,
            table_name: "mo_columns".to_string(),
            batch: Batch::new(vec![att_table, attname, attnum, att_pos, att_notnull, att_primary])?,
        },
    ])
}
