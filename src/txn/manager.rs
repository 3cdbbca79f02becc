//! Transaction manager
//!
//! Owns the active-transaction table and the commit pipeline. Reads run
//! concurrently against the snapshot; the validate-and-apply half of commit
//! is serialized by a single commit lock, which is what makes the commit
//! timestamp a linearization point. The pipeline on commit:
//!
//! 1. `Active → Preparing`, allocate `prepare_ts`
//! 2. validate: DDL WW checks, delete WW checks (remapping through the
//!    transfer table when a block was retired mid-flight), PK dedup against
//!    the latest committed state (zonemap → bloom → exact)
//! 3. plan append placement: tail blocks first, new blocks/segments as needed
//! 4. allocate `commit_ts`, fsync the prepared record to the WAL
//! 5. apply the record to the catalog, publish logtail, `→ Committed`

use super::txn::{AccessInfo, DedupType, Txn, TxnState};
use super::workspace::{TableWrites, WsCatalogOp};
use crate::catalog::{Catalog, EntryOp, TableEntry, Visibility};
use crate::data::{Batch, BlockData, BlockReader};
use crate::error::{EngineError, Result};
use crate::logtail::{CommittedRecord, LogtailMgr};
use crate::schema::{AlterRequest, Schema};
use crate::tasks::transfer::{Remap, TransferTable};
use crate::types::{
    BlockAddr, BlockId, ColumnVector, DatabaseId, Sequence, TableId, Timestamp, TsAllocator,
    TxnId, Value,
};
use crate::wal::record::{BlockMutation, CatalogOp, PreparedRecord, RecordOp, WalPayload};
use crate::wal::Wal;
use dashmap::DashMap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a row lives from a transaction's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRef {
    /// Appended by this transaction, not yet committed.
    Workspace(u32),
    /// A committed block row.
    Block(BlockAddr, u32),
}

#[derive(Debug, Default)]
pub struct TxnStats {
    pub committed: AtomicU64,
    pub aborted: AtomicU64,
}

pub struct TxnMgr {
    catalog: Arc<Catalog>,
    wal: Arc<Wal>,
    ts: Arc<TsAllocator>,
    seq: Arc<Sequence>,
    reader: Arc<BlockReader>,
    transfer: Arc<TransferTable>,
    logtail: Arc<LogtailMgr>,

    active: DashMap<TxnId, Arc<Txn>>,
    commit_lock: Mutex<()>,
    pub stats: TxnStats,
}

impl TxnMgr {
    pub fn new(
        catalog: Arc<Catalog>,
        wal: Arc<Wal>,
        ts: Arc<TsAllocator>,
        seq: Arc<Sequence>,
        reader: Arc<BlockReader>,
        transfer: Arc<TransferTable>,
        logtail: Arc<LogtailMgr>,
    ) -> Self {
        Self {
            catalog,
            wal,
            ts,
            seq,
            reader,
            transfer,
            logtail,
            active: DashMap::new(),
            commit_lock: Mutex::new(()),
            stats: TxnStats::default(),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn reader(&self) -> &Arc<BlockReader> {
        &self.reader
    }

    pub fn transfer(&self) -> &Arc<TransferTable> {
        &self.transfer
    }

    pub fn begin(&self, access: AccessInfo, dedup: DedupType) -> Arc<Txn> {
        self.begin_at(self.ts.alloc(), access, dedup)
    }

    /// Explicit start timestamp; incremental replication relies on it.
    pub fn begin_at(&self, start_ts: Timestamp, access: AccessInfo, dedup: DedupType) -> Arc<Txn> {
        let txn = Arc::new(Txn::new(self.seq.next_txn_id(), start_ts, access, dedup));
        self.active.insert(txn.id, txn.clone());
        txn
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Oldest start timestamp among live transactions; transfer-table and
    /// catalog GC gate on it.
    pub fn min_active_start_ts(&self) -> Option<Timestamp> {
        self.active.iter().map(|e| e.value().start_ts).min()
    }

    fn ensure_active(&self, txn: &Txn) -> Result<()> {
        if txn.is_active() {
            Ok(())
        } else {
            Err(EngineError::TxnNotFound(txn.id))
        }
    }

    // ---------------------------------------------------------------- DDL

    pub fn create_database(&self, txn: &Txn, name: &str) -> Result<DatabaseId> {
        self.ensure_active(txn)?;
        let tenant = txn.access.tenant_id;
        let mut ws = txn.workspace.lock();
        match ws.resolve_db_name(name) {
            Some(Some(_)) => {
                return Err(EngineError::DuplicateEntry(format!("database {}", name)))
            }
            Some(None) => {}
            None => {
                if self.catalog.db_names.read().resolve(tenant, name, txn.start_ts).is_some() {
                    return Err(EngineError::DuplicateEntry(format!("database {}", name)));
                }
            }
        }
        let id = self.seq.next_database_id();
        ws.ddl.push(WsCatalogOp::CreateDatabase { id, name: name.to_string() });
        Ok(id)
    }

    pub fn drop_database(&self, txn: &Txn, name: &str) -> Result<DatabaseId> {
        self.ensure_active(txn)?;
        let mut ws = txn.workspace.lock();
        let id = match ws.resolve_db_name(name) {
            Some(Some(id)) => id,
            Some(None) => return Err(EngineError::NotFound(format!("database {}", name))),
            None => {
                self.catalog
                    .get_database_by_name(txn.access.tenant_id, name, txn.start_ts)?
                    .id
            }
        };
        ws.ddl.push(WsCatalogOp::DropDatabase { id, name: name.to_string() });
        Ok(id)
    }

    pub fn get_database_id(&self, txn: &Txn, name: &str) -> Result<DatabaseId> {
        self.ensure_active(txn)?;
        let ws = txn.workspace.lock();
        match ws.resolve_db_name(name) {
            Some(Some(id)) => Ok(id),
            Some(None) => Err(EngineError::NotFound(format!("database {}", name))),
            None => Ok(self
                .catalog
                .get_database_by_name(txn.access.tenant_id, name, txn.start_ts)?
                .id),
        }
    }

    pub fn create_table(&self, txn: &Txn, db: DatabaseId, schema: Schema) -> Result<TableId> {
        self.ensure_active(txn)?;
        let tenant = txn.access.tenant_id;
        let mut ws = txn.workspace.lock();

        let created_here =
            ws.ddl.iter().any(|op| matches!(op, WsCatalogOp::CreateDatabase { id, .. } if *id == db));
        if !created_here {
            let entry = self.catalog.get_database_by_id(db, txn.start_ts, None)?;
            if entry.visibility(txn.start_ts, None) != Visibility::Visible {
                return Err(EngineError::NotFound(format!("database {}", db)));
            }
        }
        match ws.resolve_table_name(db, &schema.name) {
            Some(Some(_)) => {
                return Err(EngineError::DuplicateEntry(format!("table {}", schema.name)))
            }
            Some(None) => {}
            None => {
                if !created_here {
                    let entry = self.catalog.get_database_by_id(db, txn.start_ts, None)?;
                    if entry
                        .table_names
                        .read()
                        .resolve(tenant, &schema.name, txn.start_ts)
                        .is_some()
                    {
                        return Err(EngineError::DuplicateEntry(format!(
                            "table {}",
                            schema.name
                        )));
                    }
                }
            }
        }
        let id = self.seq.next_table_id();
        ws.ddl.push(WsCatalogOp::CreateTable { db, id, schema: Arc::new(schema) });
        Ok(id)
    }

    pub fn drop_table(&self, txn: &Txn, db: DatabaseId, name: &str) -> Result<TableId> {
        self.ensure_active(txn)?;
        let mut ws = txn.workspace.lock();
        let id = match ws.resolve_table_name(db, name) {
            Some(Some(id)) => id,
            Some(None) => return Err(EngineError::NotFound(format!("table {}", name))),
            None => {
                self.catalog
                    .get_table_by_name(txn.access.tenant_id, db, name, txn.start_ts)?
                    .id
            }
        };
        ws.ddl.push(WsCatalogOp::DropTable { db, id, name: name.to_string() });
        Ok(id)
    }

    pub fn get_table_id(&self, txn: &Txn, db: DatabaseId, name: &str) -> Result<TableId> {
        self.ensure_active(txn)?;
        let ws = txn.workspace.lock();
        match ws.resolve_table_name(db, name) {
            Some(Some(id)) => Ok(id),
            Some(None) => Err(EngineError::NotFound(format!("table {}", name))),
            None => Ok(self
                .catalog
                .get_table_by_name(txn.access.tenant_id, db, name, txn.start_ts)?
                .id),
        }
    }

    pub fn alter_table(
        &self,
        txn: &Txn,
        db: DatabaseId,
        table: TableId,
        req: AlterRequest,
    ) -> Result<u32> {
        self.ensure_active(txn)?;
        let mut ws = txn.workspace.lock();
        let base = match ws.pending_schema(db, table) {
            Some(schema) => schema,
            None => self.catalog.get_table_by_id(db, table, txn.start_ts, None)?.schema(),
        };
        let new_schema = Arc::new(base.apply_alter(&req)?);
        let version = new_schema.version;
        ws.ddl.push(WsCatalogOp::Alter { db, table, req, new_schema });
        Ok(version)
    }

    // --------------------------------------------------------------- data

    /// Schema a write to `(db, table)` is shaped by, from this transaction's
    /// point of view.
    pub fn effective_schema(&self, txn: &Txn, db: DatabaseId, table: TableId) -> Result<Arc<Schema>> {
        let ws = txn.workspace.lock();
        if ws.is_table_dropped_here(db, table) {
            return Err(EngineError::NotFound(format!("table {}", table)));
        }
        if let Some(schema) = ws.pending_schema(db, table) {
            return Ok(schema);
        }
        drop(ws);
        Ok(self.catalog.get_table_by_id(db, table, txn.start_ts, None)?.schema())
    }

    pub fn append(&self, txn: &Txn, db: DatabaseId, table: TableId, batch: Batch) -> Result<()> {
        self.ensure_active(txn)?;
        let schema = self.effective_schema(txn, db, table)?;
        if batch.column_count() != schema.column_count() {
            return Err(EngineError::Internal(format!(
                "batch width {} vs schema width {}",
                batch.column_count(),
                schema.column_count()
            )));
        }
        let pk_pos = schema
            .pk_pos()
            .ok_or_else(|| EngineError::Internal("append requires a primary key".into()))?;

        let mut ws = txn.workspace.lock();
        let writes = ws.writes_mut(db, table, schema.clone());
        if txn.dedup != DedupType::FullSkipWorkspace {
            if let Some(keys) = batch.column(pk_pos) {
                for key in &keys.values {
                    if writes.find_live(key).is_some() {
                        return Err(EngineError::DuplicateEntry(format!("key {:?}", key)));
                    }
                }
            }
        }
        writes.appends.extend_from(&batch)?;
        Ok(())
    }

    /// Newest visible row for a primary key: workspace first, then committed
    /// blocks newest-first.
    pub fn get_by_filter(
        &self,
        txn: &Txn,
        db: DatabaseId,
        table: TableId,
        key: &Value,
    ) -> Result<RowRef> {
        self.ensure_active(txn)?;
        let snapshot = txn.start_ts;
        {
            let ws = txn.workspace.lock();
            if let Some(writes) = ws.writes_of(db, table) {
                if let Some(row) = writes.find_live(key) {
                    return Ok(RowRef::Workspace(row));
                }
            }
        }
        let entry = self.catalog.get_table_by_id(db, table, snapshot, None)?;
        for segment in entry.visible_segments(snapshot, None).into_iter().rev() {
            for block in segment.visible_blocks(snapshot, None).into_iter().rev() {
                let hit = {
                    let data = block.data.read();
                    match &*data {
                        BlockData::Appendable(a) => a.get_by_filter(key, snapshot),
                        BlockData::Persisted(p) => self.reader.get_by_filter(p, key, snapshot)?,
                    }
                };
                if let Some(row) = hit {
                    // A row this transaction already deleted is not found.
                    let ws = txn.workspace.lock();
                    let own_delete = ws
                        .writes_of(db, table)
                        .and_then(|w| w.deletes.get(&block.addr.block))
                        .map(|rows| rows.contains(row))
                        .unwrap_or(false);
                    if !own_delete {
                        return Ok(RowRef::Block(block.addr, row));
                    }
                }
            }
        }
        Err(EngineError::NotFound(format!("key {:?}", key)))
    }

    pub fn get_value(
        &self,
        txn: &Txn,
        db: DatabaseId,
        table: TableId,
        row: RowRef,
        col_pos: usize,
    ) -> Result<Value> {
        self.ensure_active(txn)?;
        match row {
            RowRef::Workspace(ws_row) => {
                let ws = txn.workspace.lock();
                let writes = ws
                    .writes_of(db, table)
                    .ok_or_else(|| EngineError::NotFound(format!("row {:?}", row)))?;
                if writes.append_dead.contains(ws_row) {
                    return Err(EngineError::NotFound(format!("row {:?}", row)));
                }
                writes
                    .appends
                    .column(col_pos)
                    .and_then(|c| c.get(ws_row as usize))
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("column {}", col_pos)))
            }
            RowRef::Block(addr, block_row) => {
                let schema = self.effective_schema(txn, db, table)?;
                let col = schema
                    .columns
                    .get(col_pos)
                    .ok_or_else(|| EngineError::NotFound(format!("column {}", col_pos)))?;
                {
                    let ws = txn.workspace.lock();
                    let own_delete = ws
                        .writes_of(db, table)
                        .and_then(|w| w.deletes.get(&addr.block))
                        .map(|rows| rows.contains(block_row))
                        .unwrap_or(false);
                    if own_delete {
                        return Err(EngineError::NotFound(format!("row {:?}", row)));
                    }
                }
                let block = self.catalog.get_block(addr)?;
                let data = block.data.read();
                match &*data {
                    BlockData::Appendable(a) => {
                        a.column_view_by_seqnum(col.seq_num, col.typ, txn.start_ts).and_then(
                            |view| {
                                if view.is_deleted(block_row) || block_row >= view.row_count() {
                                    Err(EngineError::NotFound(format!("row {:?}", row)))
                                } else {
                                    Ok(view.data.values[block_row as usize].clone())
                                }
                            },
                        )
                    }
                    BlockData::Persisted(p) => {
                        let views = self.reader.column_views(
                            p,
                            &[(col.seq_num, col.typ)],
                            txn.start_ts,
                        )?;
                        let view = &views[0];
                        if view.is_deleted(block_row) || block_row >= view.row_count() {
                            Err(EngineError::NotFound(format!("row {:?}", row)))
                        } else {
                            Ok(view.data.values[block_row as usize].clone())
                        }
                    }
                }
            }
        }
    }

    pub fn delete_row(&self, txn: &Txn, db: DatabaseId, table: TableId, row: RowRef) -> Result<()> {
        self.ensure_active(txn)?;
        let schema = self.effective_schema(txn, db, table)?;
        let mut ws = txn.workspace.lock();
        let writes = ws.writes_mut(db, table, schema);
        match row {
            RowRef::Workspace(ws_row) => {
                if ws_row >= writes.appends.row_count() || writes.append_dead.contains(ws_row) {
                    return Err(EngineError::NotFound(format!("row {:?}", row)));
                }
                writes.append_dead.insert(ws_row);
            }
            RowRef::Block(addr, block_row) => {
                // Fail fast when a delete of this row already committed past
                // this snapshot; commit re-validates anyway.
                let block = self.catalog.get_block(addr)?;
                {
                    let data = block.data.read();
                    let mut probe = RoaringBitmap::new();
                    probe.insert(block_row);
                    data.deletes().check_ww(&probe, txn.start_ts)?;
                }
                writes.deletes.entry(addr.block).or_default().insert(block_row);
            }
        }
        Ok(())
    }

    /// Delete rows `lo..=hi` of one block.
    pub fn range_delete(&self, txn: &Txn, addr: BlockAddr, lo: u32, hi: u32) -> Result<()> {
        self.ensure_active(txn)?;
        let block = self.catalog.get_block(addr)?;
        if block.visibility(txn.start_ts, None) != Visibility::Visible {
            return Err(EngineError::NotFound(format!("block {}", addr)));
        }
        let schema = self.effective_schema(txn, addr.db, addr.table)?;
        let mut ws = txn.workspace.lock();
        let writes = ws.writes_mut(addr.db, addr.table, schema);
        let rows = writes.deletes.entry(addr.block).or_default();
        rows.insert_range(lo..hi + 1);
        Ok(())
    }

    /// Update one column of the row holding `key`: delete the old row,
    /// append a copy with the column replaced.
    pub fn update_by_filter(
        &self,
        txn: &Txn,
        db: DatabaseId,
        table: TableId,
        key: &Value,
        col_pos: usize,
        value: Value,
    ) -> Result<()> {
        self.ensure_active(txn)?;
        let schema = self.effective_schema(txn, db, table)?;
        let row = self.get_by_filter(txn, db, table, key)?;
        let mut values = Vec::with_capacity(schema.column_count());
        for pos in 0..schema.column_count() {
            values.push(self.get_value(txn, db, table, row, pos)?);
        }
        // Write-write guard before buffering: a delete that raced in after
        // this snapshot fails the txn at commit anyway, but updating a column
        // on a row another txn deleted should fail fast.
        if let RowRef::Block(addr, block_row) = row {
            let block = self.catalog.get_block(addr)?;
            let data = block.data.read();
            let mut rows = RoaringBitmap::new();
            rows.insert(block_row);
            data.deletes().check_ww(&rows, txn.start_ts)?;
        }
        values[col_pos] = value;
        self.delete_row(txn, db, table, row)?;
        let mut batch = Batch::empty_like(&schema);
        batch.push_row(&values)?;
        self.append(txn, db, table, batch)
    }

    /// Live rows of the table at the snapshot, one batch per block, plus the
    /// workspace batch; shaped by the latest schema the txn sees.
    pub fn scan(&self, txn: &Txn, db: DatabaseId, table: TableId) -> Result<Vec<Batch>> {
        self.ensure_active(txn)?;
        let snapshot = txn.start_ts;
        let schema = self.effective_schema(txn, db, table)?;
        let wanted: Vec<_> = schema.columns.iter().map(|c| (c.seq_num, c.typ)).collect();
        let mut batches = Vec::new();

        if let Ok(entry) = self.catalog.get_table_by_id(db, table, snapshot, None) {
            for segment in entry.visible_segments(snapshot, None) {
                for block in segment.visible_blocks(snapshot, None) {
                    let mut views = {
                        let data = block.data.read();
                        match &*data {
                            BlockData::Appendable(a) => wanted
                                .iter()
                                .map(|(seq, typ)| a.column_view_by_seqnum(*seq, *typ, snapshot))
                                .collect::<Result<Vec<_>>>()?,
                            BlockData::Persisted(p) => {
                                self.reader.column_views(p, &wanted, snapshot)?
                            }
                        }
                    };
                    // Overlay this transaction's own deletes.
                    let ws = txn.workspace.lock();
                    if let Some(rows) = ws
                        .writes_of(db, table)
                        .and_then(|w| w.deletes.get(&block.addr.block))
                    {
                        for view in views.iter_mut() {
                            view.delete_mask |= rows;
                        }
                    }
                    drop(ws);
                    let columns: Vec<ColumnVector> =
                        views.iter().map(|v| v.apply_deletes()).collect();
                    let batch = Batch::new(columns)?;
                    if batch.row_count() > 0 {
                        batches.push(batch);
                    }
                }
            }
        }

        let ws = txn.workspace.lock();
        if let Some(writes) = ws.writes_of(db, table) {
            if writes.has_appends() {
                let live = writes.live_rows();
                if !live.is_empty() {
                    batches.push(writes.appends.take(&live));
                }
            }
        }
        Ok(batches)
    }

    /// Logical row count at the snapshot (I3).
    pub fn row_count(&self, txn: &Txn, db: DatabaseId, table: TableId) -> Result<u64> {
        Ok(self.scan(txn, db, table)?.iter().map(|b| b.row_count() as u64).sum())
    }

    // ------------------------------------------------------------- commit

    pub fn rollback(&self, txn: &Txn) -> Result<()> {
        if txn.state().is_terminal() {
            return Err(EngineError::TxnNotFound(txn.id));
        }
        txn.set_state(TxnState::Aborted);
        self.active.remove(&txn.id);
        self.stats.aborted.fetch_add(1, Ordering::Relaxed);
        log::debug!("txn {} rolled back", txn.id);
        Ok(())
    }

    pub fn commit(&self, txn: &Txn) -> Result<Timestamp> {
        if !txn.begin_prepare() {
            return Err(EngineError::TxnNotFound(txn.id));
        }
        match self.commit_inner(txn) {
            Ok(ts) => {
                txn.set_state(TxnState::Committed);
                self.active.remove(&txn.id);
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                Ok(ts)
            }
            Err(e) => {
                txn.set_state(TxnState::Aborted);
                self.active.remove(&txn.id);
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                log::debug!("txn {} aborted at commit: {}", txn.id, e);
                Err(e)
            }
        }
    }

    fn commit_inner(&self, txn: &Txn) -> Result<Timestamp> {
        let _commit = self.commit_lock.lock();
        let prepare_ts = self.ts.alloc();
        txn.set_prepare_ts(prepare_ts);

        let ws = txn.workspace.lock();
        if ws.is_empty() {
            txn.set_commit_ts(prepare_ts);
            return Ok(prepare_ts);
        }

        let mut ops: Vec<RecordOp> = Vec::new();
        self.validate_ddl(txn, &ws.ddl, &mut ops)?;
        for ((db, table), writes) in ws.writes.iter() {
            self.validate_and_plan_table(txn, &ws, *db, *table, writes, &mut ops)?;
        }
        drop(ws);

        let commit_ts = self.ts.alloc();
        txn.set_commit_ts(commit_ts);
        let record = PreparedRecord {
            txn_id: txn.id,
            commit_ts,
            tenant: txn.access.tenant_id,
            ops,
        };

        let lsn = self.wal.append(&WalPayload::Prepared(record.clone()))?;
        txn.set_state(TxnState::Prepared);

        crate::catalog::apply::apply_record(&self.catalog, &self.seq, &record, Some(lsn))?;
        self.logtail.publish(Arc::new(CommittedRecord { commit_ts, lsn, record }));
        log::debug!("txn {} committed at {}", txn.id, commit_ts);
        Ok(commit_ts)
    }

    /// Commit a system task (flush, merge, delta flush). `finish` runs under
    /// the commit lock with the prepare timestamp; it does the task's final
    /// validation against the then-latest state and returns the ops plus any
    /// transfer mappings to install at the commit timestamp.
    pub fn commit_system(
        &self,
        txn: &Txn,
        finish: impl FnOnce(Timestamp) -> Result<TaskCommit>,
    ) -> Result<Timestamp> {
        if !txn.begin_prepare() {
            return Err(EngineError::TxnNotFound(txn.id));
        }
        let result = (|| {
            let _commit = self.commit_lock.lock();
            let prepare_ts = self.ts.alloc();
            txn.set_prepare_ts(prepare_ts);
            let task = finish(prepare_ts)?;
            if task.ops.is_empty() {
                txn.set_commit_ts(prepare_ts);
                return Ok(prepare_ts);
            }
            let commit_ts = self.ts.alloc();
            txn.set_commit_ts(commit_ts);
            let record = PreparedRecord {
                txn_id: txn.id,
                commit_ts,
                tenant: txn.access.tenant_id,
                ops: task.ops,
            };
            let lsn = self.wal.append(&WalPayload::Prepared(record.clone()))?;
            txn.set_state(TxnState::Prepared);
            crate::catalog::apply::apply_record(&self.catalog, &self.seq, &record, Some(lsn))?;
            for (old_block, mapping) in task.transfers {
                self.transfer.install(old_block, commit_ts, mapping);
            }
            self.logtail.publish(Arc::new(CommittedRecord { commit_ts, lsn, record }));
            Ok(commit_ts)
        })();
        match result {
            Ok(ts) => {
                txn.set_state(TxnState::Committed);
                self.active.remove(&txn.id);
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                Ok(ts)
            }
            Err(e) => {
                txn.set_state(TxnState::Aborted);
                self.active.remove(&txn.id);
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn validate_ddl(
        &self,
        txn: &Txn,
        ddl: &[WsCatalogOp],
        ops: &mut Vec<RecordOp>,
    ) -> Result<()> {
        let tenant = txn.access.tenant_id;
        for op in ddl {
            match op {
                WsCatalogOp::CreateDatabase { id, name } => {
                    let names = self.catalog.db_names.read();
                    if names.changed_after(tenant, name, txn.start_ts) {
                        return Err(EngineError::WWConflict(format!("database name {}", name)));
                    }
                    if names.resolve(tenant, name, txn.start_ts).is_some() {
                        return Err(EngineError::DuplicateEntry(format!("database {}", name)));
                    }
                    ops.push(RecordOp::Catalog(CatalogOp::CreateDatabase {
                        id: *id,
                        name: name.clone(),
                        tenant,
                    }));
                }
                WsCatalogOp::DropDatabase { id, name } => {
                    if let Some(db) = self.catalog.database(*id) {
                        db.chain.read().check_ww(txn.start_ts, txn.id)?;
                    }
                    ops.push(RecordOp::Catalog(CatalogOp::DropDatabase {
                        id: *id,
                        name: name.clone(),
                        tenant,
                        hard: false,
                    }));
                }
                WsCatalogOp::CreateTable { db, id, schema } => {
                    if let Some(database) = self.catalog.database(*db) {
                        let names = database.table_names.read();
                        if names.changed_after(tenant, &schema.name, txn.start_ts) {
                            return Err(EngineError::WWConflict(format!(
                                "table name {}",
                                schema.name
                            )));
                        }
                    }
                    ops.push(RecordOp::Catalog(CatalogOp::CreateTable {
                        db: *db,
                        id: *id,
                        tenant,
                        schema: schema.as_ref().clone(),
                    }));
                }
                WsCatalogOp::DropTable { db, id, name } => {
                    if let Some(table) = self.catalog.database(*db).and_then(|d| d.table(*id)) {
                        table.chain.read().check_ww(txn.start_ts, txn.id)?;
                    }
                    ops.push(RecordOp::Catalog(CatalogOp::DropTable {
                        db: *db,
                        id: *id,
                        tenant,
                        name: name.clone(),
                        hard: false,
                    }));
                }
                WsCatalogOp::Alter { db, table, req, new_schema } => {
                    if let Some(entry) = self.catalog.database(*db).and_then(|d| d.table(*table)) {
                        entry.chain.read().check_ww(txn.start_ts, txn.id)?;
                        // The alter was derived from the version this txn
                        // saw; anything newer is a lost update.
                        let committed = entry.schema().version;
                        if new_schema.version <= committed {
                            return Err(EngineError::WWConflict(format!(
                                "table {} altered concurrently (version {} vs {})",
                                table, new_schema.version, committed
                            )));
                        }
                    }
                    ops.push(RecordOp::Alter(crate::wal::record::AlterRecord {
                        db: *db,
                        table: *table,
                        tenant,
                        req: req.clone(),
                        new_schema: new_schema.as_ref().clone(),
                    }));
                }
            }
        }
        Ok(())
    }

    fn validate_and_plan_table(
        &self,
        txn: &Txn,
        ws: &super::workspace::Workspace,
        db: DatabaseId,
        table: TableId,
        writes: &TableWrites,
        ops: &mut Vec<RecordOp>,
    ) -> Result<()> {
        let created_here = ws.is_table_created_here(db, table);
        if ws.is_table_dropped_here(db, table) {
            // Writes to a table this txn dropped die with the drop.
            return Ok(());
        }
        let entry = if created_here {
            None
        } else {
            let entry = self.catalog.get_table_by_id(db, table, txn.start_ts, None)?;
            entry.chain.read().check_ww(txn.start_ts, txn.id)?;
            if ws.pending_schema(db, table).is_none()
                && entry.schema().version != writes.schema.version
            {
                return Err(EngineError::WWConflict(format!(
                    "table {} schema changed under writer",
                    table
                )));
            }
            Some(entry)
        };

        // Dedup appended keys against the latest committed state.
        if writes.has_appends() {
            let keys = self.live_append_keys(writes)?;
            if let Some(entry) = &entry {
                self.dedup_against_table(txn, entry, &keys)?;
            }
            self.plan_appends(db, table, entry.as_ref(), writes, ops)?;
        }

        // Deletes against committed blocks, remapped when the block retired.
        let mut remapped: ahash::AHashMap<BlockId, RoaringBitmap> = ahash::AHashMap::new();
        for (block_id, rows) in &writes.deletes {
            let addr = BlockAddr::new(db, table, *block_id);
            let block = match self.catalog.get_block(addr) {
                Ok(block) => block,
                Err(_) => return Err(EngineError::WWConflict(format!("block {} gone", addr))),
            };
            match block.visibility(Timestamp::MAX, None) {
                Visibility::Visible => {
                    block.data.read().deletes().check_ww(rows, txn.start_ts)?;
                    remapped.entry(*block_id).or_default().extend(rows.iter());
                }
                _ => {
                    // Retired mid-flight: follow the transfer table.
                    for row in rows {
                        match self.transfer.remap(*block_id, row) {
                            Remap::To(new_block, new_row) => {
                                remapped.entry(new_block).or_default().insert(new_row);
                            }
                            Remap::Dropped => {}
                            Remap::Unknown => {
                                return Err(EngineError::WWConflict(format!(
                                    "block {} retired and no transfer entry",
                                    addr
                                )));
                            }
                        }
                    }
                }
            }
        }
        for (block_id, rows) in remapped {
            if rows.is_empty() {
                continue;
            }
            let addr = BlockAddr::new(db, table, block_id);
            let block = self.catalog.get_block(addr)?;
            block.data.read().deletes().check_ww(&rows, txn.start_ts)?;
            ops.push(RecordOp::Mutation(BlockMutation::Delete {
                addr,
                rows: rows.iter().collect(),
                at: None,
            }));
        }
        Ok(())
    }

    fn live_append_keys(&self, writes: &TableWrites) -> Result<Vec<Value>> {
        let pk_pos = writes
            .schema
            .pk_pos()
            .ok_or_else(|| EngineError::Internal("append requires a primary key".into()))?;
        let col = writes
            .appends
            .column(pk_pos)
            .ok_or_else(|| EngineError::Internal("pk column missing".into()))?;
        Ok(writes
            .live_rows()
            .into_iter()
            .map(|r| col.values[r as usize].clone())
            .collect())
    }

    fn dedup_against_table(&self, txn: &Txn, entry: &Arc<TableEntry>, keys: &[Value]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let since = match txn.dedup {
            DedupType::Incremental => Some(txn.start_ts),
            _ => None,
        };
        for segment in entry.visible_segments(Timestamp::MAX, None) {
            for block in segment.visible_blocks(Timestamp::MAX, None) {
                let data = block.data.read();
                match &*data {
                    BlockData::Appendable(a) => {
                        if let Some((row, at)) = a.find_duplicate(keys, since) {
                            return Err(if at > txn.start_ts {
                                EngineError::WWConflict(format!(
                                    "key appended concurrently at {} (row {})",
                                    at, row
                                ))
                            } else {
                                EngineError::DuplicateEntry(format!("row {} in {}", row, block.addr))
                            });
                        }
                    }
                    BlockData::Persisted(p) => {
                        if matches!(since, Some(since)
                            if block.chain.read().created_at().map(|c| c <= since).unwrap_or(false))
                        {
                            continue;
                        }
                        match self.reader.batch_dedup(p, keys) {
                            Ok(()) => {}
                            Err(EngineError::DuplicateEntry(msg)) => {
                                let created = block.chain.read().created_at();
                                return Err(
                                    if created.map(|c| c > txn.start_ts).unwrap_or(false) {
                                        EngineError::WWConflict(msg)
                                    } else {
                                        EngineError::DuplicateEntry(msg)
                                    },
                                );
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Lay the workspace batch out over tail blocks and fresh blocks,
    /// emitting the catalog ops and append/delete mutations in order.
    fn plan_appends(
        &self,
        db: DatabaseId,
        table: TableId,
        entry: Option<&Arc<TableEntry>>,
        writes: &TableWrites,
        ops: &mut Vec<RecordOp>,
    ) -> Result<()> {
        let schema = &writes.schema;
        let total = writes.appends.row_count();
        // Workspace row ranges per target block, plus the block-local row
        // offset the range starts at.
        let mut placements: Vec<(BlockAddr, u32, u32, u32)> = Vec::new();
        let mut placed = 0u32;

        let mut cursor = match entry.map(|e| self.appendable_target(e)) {
            Some(Ok(cursor)) => Some(cursor),
            Some(Err(EngineError::AppendableSegmentNotFound(_))) | None => None,
            Some(Err(e)) => return Err(e),
        };

        while placed < total {
            // Make sure the cursor points at a block with free space.
            let target = match cursor.take() {
                Some(c) if c.space > 0 => c,
                Some(c) => {
                    if c.seg_blocks < schema.segment_max_blocks {
                        let offset = c.offset + 1;
                        let addr = BlockAddr::new(db, table, BlockId::new(c.segment, offset));
                        ops.push(RecordOp::Catalog(CatalogOp::CreateBlock {
                            addr,
                            schema_version: schema.version,
                        }));
                        AppendCursor {
                            segment: c.segment,
                            offset,
                            space: schema.block_max_rows,
                            seg_blocks: c.seg_blocks + 1,
                            block_base: 0,
                        }
                    } else {
                        ops.push(RecordOp::Catalog(CatalogOp::UpgradeSegment {
                            db,
                            table,
                            id: c.segment,
                            op: EntryOp::UpgradeClose,
                        }));
                        self.open_segment(db, table, schema, ops)
                    }
                }
                None => self.open_segment(db, table, schema, ops),
            };

            let take = target.space.min(total - placed);
            let addr = BlockAddr::new(db, table, BlockId::new(target.segment, target.offset));
            placements.push((addr, placed, placed + take, target.block_base));
            ops.push(RecordOp::Mutation(BlockMutation::Append {
                addr,
                batch: writes.appends.slice(placed, placed + take),
            }));
            placed += take;

            if take == target.space {
                ops.push(RecordOp::Catalog(CatalogOp::UpgradeBlock {
                    addr,
                    op: EntryOp::UpgradeFull,
                }));
                cursor = Some(AppendCursor { space: 0, ..target });
            } else {
                cursor = Some(AppendCursor {
                    space: target.space - take,
                    block_base: target.block_base + take,
                    ..target
                });
            }
        }

        // This transaction's deleted-again workspace rows become committed
        // phantoms: appended, then deleted in the same record.
        if !writes.append_dead.is_empty() {
            let mut per_block: ahash::AHashMap<BlockAddr, Vec<u32>> = ahash::AHashMap::new();
            for dead in &writes.append_dead {
                let (addr, start, _, base) = placements
                    .iter()
                    .find(|(_, start, end, _)| dead >= *start && dead < *end)
                    .ok_or_else(|| EngineError::Internal("dead row not placed".into()))?;
                per_block.entry(*addr).or_default().push(base + (dead - start));
            }
            for (addr, mut rows) in per_block {
                rows.sort_unstable();
                ops.push(RecordOp::Mutation(BlockMutation::Delete { addr, rows, at: None }));
            }
        }
        Ok(())
    }

    fn open_segment(
        &self,
        db: DatabaseId,
        table: TableId,
        schema: &Arc<Schema>,
        ops: &mut Vec<RecordOp>,
    ) -> AppendCursor {
        let segment = self.seq.next_segment_id();
        ops.push(RecordOp::Catalog(CatalogOp::CreateSegment {
            db,
            table,
            id: segment,
            appendable: true,
            sorted: schema.sorted,
        }));
        let addr = BlockAddr::new(db, table, BlockId::new(segment, 0));
        ops.push(RecordOp::Catalog(CatalogOp::CreateBlock {
            addr,
            schema_version: schema.version,
        }));
        AppendCursor { segment, offset: 0, space: schema.block_max_rows, seg_blocks: 1, block_base: 0 }
    }

    /// Tail of the last appendable segment. `AppendableSegmentNotFound`
    /// means the planner has to open one (spec: the caller creates it).
    fn appendable_target(&self, entry: &Arc<TableEntry>) -> Result<AppendCursor> {
        let segment = entry
            .last_appendable_segment(Timestamp::MAX, None)
            .ok_or(EngineError::AppendableSegmentNotFound(entry.id))?;
        let seg_blocks = segment.block_count() as u16;
        match segment.appendable_tail(Timestamp::MAX, None) {
            Some(tail) => {
                let (space, base) = {
                    let data = tail.data.read();
                    let a = data
                        .as_appendable()
                        .ok_or_else(|| EngineError::Internal("tail lost appendability".into()))?;
                    (a.space_left(), a.total_rows())
                };
                Ok(AppendCursor {
                    segment: segment.id,
                    offset: tail.addr.block.offset,
                    space,
                    seg_blocks,
                    block_base: base,
                })
            }
            None => {
                // The tail block is full or already persisted; hand the
                // planner a zero-space cursor so it grows the segment.
                Ok(AppendCursor {
                    segment: segment.id,
                    offset: segment.next_block_offset().saturating_sub(1),
                    space: 0,
                    seg_blocks,
                    block_base: 0,
                })
            }
        }
    }
}

/// What a system task hands the commit pipeline.
#[derive(Debug, Default)]
pub struct TaskCommit {
    pub ops: Vec<RecordOp>,
    /// `(retired block, old row → new address)` installed at the commit
    /// timestamp.
    pub transfers: Vec<(BlockId, Vec<(u32, (BlockId, u32))>)>,
}

/// Planner position: where the next appended row lands.
#[derive(Debug, Clone, Copy)]
struct AppendCursor {
    segment: crate::types::SegmentId,
    offset: u16,
    space: u32,
    seg_blocks: u16,
    /// Rows already in the target block before this transaction's slice.
    block_base: u32,
}
