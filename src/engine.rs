//! Engine façade
//!
//! Wires the catalog, transaction manager, WAL, file service, checkpointer
//! and background workers into one handle. `open` replays the newest global
//! checkpoint, later incrementals and the WAL tail before accepting
//! transactions; `Drop` stops the workers deterministically.

use crate::catalog::Catalog;
use crate::checkpoint::{CheckpointEntryMeta, CheckpointMgr, GcRunner, GcStats};
use crate::config::EngineConfig;
use crate::data::{Batch, BlockReader};
use crate::error::Result;
use crate::fs::{FileService, LocalFileService};
use crate::logtail::{LogtailMgr, LogtailResponse, SyncLogtailReq};
use crate::schema::{AlterRequest, Schema};
use crate::tasks::{Flusher, Merger, TransferTable, Worker};
use crate::txn::{AccessInfo, DedupType, RowRef, Txn, TxnMgr};
use crate::types::{
    BlockAddr, Cancel, DatabaseId, Sequence, TableId, Timestamp, TsAllocator, Value,
};
use crate::wal::{Wal, WalPayload};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct EngineInner {
    pub config: EngineConfig,
    pub catalog: Arc<Catalog>,
    pub ts: Arc<TsAllocator>,
    pub seq: Arc<Sequence>,
    pub fs: Arc<dyn FileService>,
    pub reader: Arc<BlockReader>,
    pub wal: Arc<Wal>,
    pub logtail: Arc<LogtailMgr>,
    pub transfer: Arc<TransferTable>,
    pub txns: Arc<TxnMgr>,
    pub checkpoints: Arc<CheckpointMgr>,
    flusher: Flusher,
    merger: Merger,
    gc: GcRunner,
}

pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<Worker>>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub active_txns: usize,
    pub committed_txns: u64,
    pub aborted_txns: u64,
    pub wal_last_lsn: u64,
    pub checkpoint_entries: usize,
    pub transfer_tables: usize,
}

impl Engine {
    pub fn open(dir: impl AsRef<Path>, config: EngineConfig) -> Result<Engine> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let fs: Arc<dyn FileService> = Arc::new(LocalFileService::new(dir.join("objects"))?);
        let wal = Arc::new(Wal::open(dir.join("wal.log"))?);
        let catalog = Arc::new(Catalog::new());
        let ts = Arc::new(TsAllocator::new());
        let seq = Arc::new(Sequence::new());
        let reader = Arc::new(BlockReader::new(fs.clone()));
        let logtail = Arc::new(LogtailMgr::new());
        let transfer = Arc::new(TransferTable::new());
        let checkpoints = Arc::new(CheckpointMgr::open(
            fs.clone(),
            dir.join("checkpoints.json"),
            config.checkpoint.clone(),
        )?);

        // Restart: global snapshot, later incrementals, then the WAL tail.
        let from_lsn = checkpoints.replay_into(&catalog, &seq, &ts, &logtail)?;
        wal.replay(from_lsn, |lsn, payload| match payload {
            WalPayload::Prepared(record) => {
                ts.observe(record.commit_ts);
                crate::catalog::apply::apply_record(&catalog, &seq, &record, Some(lsn))?;
                logtail.publish(Arc::new(crate::logtail::CommittedRecord {
                    commit_ts: record.commit_ts,
                    lsn,
                    record,
                }));
                Ok(())
            }
            WalPayload::CheckpointPointer { .. } => Ok(()),
        })?;

        let txns = Arc::new(TxnMgr::new(
            catalog.clone(),
            wal.clone(),
            ts.clone(),
            seq.clone(),
            reader.clone(),
            transfer.clone(),
            logtail.clone(),
        ));
        let flusher = Flusher::new(txns.clone(), fs.clone(), config.clone());
        let merger = Merger::new(txns.clone(), fs.clone(), config.clone());
        let gc = GcRunner::new(
            catalog.clone(),
            txns.clone(),
            checkpoints.clone(),
            wal.clone(),
            fs.clone(),
            transfer.clone(),
            logtail.clone(),
        );

        let inner = Arc::new(EngineInner {
            config,
            catalog,
            ts,
            seq,
            fs,
            reader,
            wal,
            logtail,
            transfer,
            txns,
            checkpoints,
            flusher,
            merger,
            gc,
        });

        let engine = Engine { inner, workers: Mutex::new(Vec::new()) };
        engine.start_workers();
        log::info!("engine opened at {}", dir.display());
        Ok(engine)
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock();

        let flush_inner = self.inner.clone();
        workers.push(Worker::spawn("basalt-flush", self.inner.config.flush_interval, move || {
            flush_inner.flusher.tick(&Cancel::new());
        }));

        let ckp_inner = self.inner.clone();
        workers.push(Worker::spawn(
            "basalt-checkpoint",
            self.inner.config.checkpoint.interval,
            move || {
                if let Err(e) =
                    ckp_inner.checkpoints.run_incremental(&ckp_inner.logtail, &ckp_inner.wal, false)
                {
                    log::warn!("incremental checkpoint failed: {}", e);
                }
                if let Err(e) = ckp_inner.checkpoints.run_global(&ckp_inner.logtail, false) {
                    log::warn!("global checkpoint failed: {}", e);
                }
            },
        ));

        let gc_inner = self.inner.clone();
        workers.push(Worker::spawn(
            "basalt-gc",
            self.inner.config.checkpoint.interval,
            move || {
                if let Err(e) = gc_inner.gc.run() {
                    log::warn!("gc failed: {}", e);
                }
            },
        ));
    }

    pub fn start_txn(&self) -> TxnHandle {
        self.start_txn_with(AccessInfo::default(), DedupType::Normal)
    }

    pub fn start_txn_for_tenant(&self, tenant: u32) -> TxnHandle {
        self.start_txn_with(AccessInfo::for_tenant(tenant), DedupType::Normal)
    }

    pub fn start_txn_with(&self, access: AccessInfo, dedup: DedupType) -> TxnHandle {
        TxnHandle { inner: self.inner.clone(), txn: self.inner.txns.begin(access, dedup) }
    }

    /// Explicit snapshot; incremental-dedup replication starts here.
    pub fn start_txn_at(&self, start_ts: Timestamp, access: AccessInfo, dedup: DedupType) -> TxnHandle {
        TxnHandle { inner: self.inner.clone(), txn: self.inner.txns.begin_at(start_ts, access, dedup) }
    }

    /// Flush one appendable block now.
    pub fn flush_block(&self, addr: BlockAddr) -> Result<(BlockAddr, Timestamp)> {
        self.inner.flusher.flush_block(addr, &Cancel::new())
    }

    /// Fold a persisted block's resident deletes into a delta object.
    pub fn flush_deletes(&self, addr: BlockAddr) -> Result<Option<Timestamp>> {
        self.inner.flusher.flush_deletes(addr, &Cancel::new())
    }

    /// Merge blocks into a fresh segment.
    pub fn merge_blocks(
        &self,
        inputs: &[BlockAddr],
        max_rows: Option<u32>,
    ) -> Result<(Vec<BlockAddr>, Timestamp)> {
        self.inner.merger.merge_blocks(inputs, max_rows, &Cancel::new())
    }

    /// Every visible block address of a table, at the latest committed
    /// state, in segment/block order.
    pub fn table_blocks(&self, db: DatabaseId, table: TableId) -> Result<Vec<BlockAddr>> {
        let entry = self.inner.catalog.get_table_by_id(db, table, Timestamp::MAX, None)?;
        let mut addrs = Vec::new();
        for segment in entry.visible_segments(Timestamp::MAX, None) {
            for block in segment.visible_blocks(Timestamp::MAX, None) {
                addrs.push(block.addr);
            }
        }
        Ok(addrs)
    }

    pub fn force_checkpoint(&self) -> Result<Option<CheckpointEntryMeta>> {
        self.inner.checkpoints.run_incremental(&self.inner.logtail, &self.inner.wal, true)
    }

    pub fn force_global_checkpoint(&self) -> Result<Option<CheckpointEntryMeta>> {
        self.inner.checkpoints.run_global(&self.inner.logtail, true)
    }

    pub fn run_gc(&self) -> Result<GcStats> {
        self.inner.gc.run()
    }

    pub fn sync_logtail(&self, tenant: u32, req: &SyncLogtailReq) -> Result<LogtailResponse> {
        self.inner.logtail.sync(&self.inner.catalog, tenant, req)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_txns: self.inner.txns.active_count(),
            committed_txns: self.inner.txns.stats.committed.load(Ordering::Relaxed),
            aborted_txns: self.inner.txns.stats.aborted.load(Ordering::Relaxed),
            wal_last_lsn: self.inner.wal.last_lsn(),
            checkpoint_entries: self.inner.checkpoints.entries().len(),
            transfer_tables: self.inner.transfer.len(),
        }
    }

    /// Stop the background workers; `Drop` calls this too.
    pub fn shutdown(&self) {
        self.workers.lock().drain(..).for_each(Worker::stop);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A transaction bound to its engine. Thin delegation to the manager; the
/// handle is what sessions hold.
pub struct TxnHandle {
    inner: Arc<EngineInner>,
    txn: Arc<Txn>,
}

impl TxnHandle {
    pub fn id(&self) -> crate::types::TxnId {
        self.txn.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.txn.start_ts
    }

    pub fn create_database(&self, name: &str) -> Result<DatabaseId> {
        self.inner.txns.create_database(&self.txn, name)
    }

    pub fn drop_database(&self, name: &str) -> Result<DatabaseId> {
        self.inner.txns.drop_database(&self.txn, name)
    }

    pub fn get_database_id(&self, name: &str) -> Result<DatabaseId> {
        self.inner.txns.get_database_id(&self.txn, name)
    }

    pub fn create_table(&self, db: DatabaseId, schema: Schema) -> Result<TableId> {
        self.inner.txns.create_table(&self.txn, db, schema)
    }

    pub fn drop_table(&self, db: DatabaseId, name: &str) -> Result<TableId> {
        self.inner.txns.drop_table(&self.txn, db, name)
    }

    pub fn get_table_id(&self, db: DatabaseId, name: &str) -> Result<TableId> {
        self.inner.txns.get_table_id(&self.txn, db, name)
    }

    pub fn alter_table(&self, db: DatabaseId, table: TableId, req: AlterRequest) -> Result<u32> {
        self.inner.txns.alter_table(&self.txn, db, table, req)
    }

    pub fn append(&self, db: DatabaseId, table: TableId, batch: Batch) -> Result<()> {
        self.inner.txns.append(&self.txn, db, table, batch)
    }

    pub fn get_by_filter(&self, db: DatabaseId, table: TableId, key: &Value) -> Result<RowRef> {
        self.inner.txns.get_by_filter(&self.txn, db, table, key)
    }

    pub fn get_value(
        &self,
        db: DatabaseId,
        table: TableId,
        row: RowRef,
        col_pos: usize,
    ) -> Result<Value> {
        self.inner.txns.get_value(&self.txn, db, table, row, col_pos)
    }

    pub fn delete_row(&self, db: DatabaseId, table: TableId, row: RowRef) -> Result<()> {
        self.inner.txns.delete_row(&self.txn, db, table, row)
    }

    pub fn delete_by_filter(&self, db: DatabaseId, table: TableId, key: &Value) -> Result<()> {
        let row = self.get_by_filter(db, table, key)?;
        self.delete_row(db, table, row)
    }

    pub fn range_delete(&self, addr: BlockAddr, lo: u32, hi: u32) -> Result<()> {
        self.inner.txns.range_delete(&self.txn, addr, lo, hi)
    }

    pub fn update_by_filter(
        &self,
        db: DatabaseId,
        table: TableId,
        key: &Value,
        col_pos: usize,
        value: Value,
    ) -> Result<()> {
        self.inner.txns.update_by_filter(&self.txn, db, table, key, col_pos, value)
    }

    pub fn scan(&self, db: DatabaseId, table: TableId) -> Result<Vec<Batch>> {
        self.inner.txns.scan(&self.txn, db, table)
    }

    pub fn row_count(&self, db: DatabaseId, table: TableId) -> Result<u64> {
        self.inner.txns.row_count(&self.txn, db, table)
    }

    pub fn commit(self) -> Result<Timestamp> {
        self.inner.txns.commit(&self.txn)
    }

    pub fn rollback(self) -> Result<()> {
        self.inner.txns.rollback(&self.txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::types::{ColumnVector, LogicalType};
    use tempfile::TempDir;

    fn open_engine(dir: &TempDir) -> Engine {
        let _ = env_logger::builder().is_test(true).try_init();
        Engine::open(dir.path(), EngineConfig::for_tests()).unwrap()
    }

    fn int_schema(name: &str, block_rows: u32, seg_blocks: u16) -> Schema {
        Schema::new(
            name,
            vec![("k", LogicalType::Int32), ("v", LogicalType::Int64)],
            "k",
            block_rows,
            seg_blocks,
        )
        .unwrap()
    }

    fn rows(keys: &[i32]) -> Batch {
        Batch::new(vec![
            ColumnVector::from_values(
                LogicalType::Int32,
                keys.iter().map(|k| Value::Int32(*k)).collect(),
            ),
            ColumnVector::from_values(
                LogicalType::Int64,
                keys.iter().map(|k| Value::Int64(*k as i64 * 10)).collect(),
            ),
        ])
        .unwrap()
    }

    fn one_row(k: i32) -> Batch {
        rows(&[k])
    }

    fn setup_table(engine: &Engine, db_name: &str, schema: Schema) -> (DatabaseId, TableId) {
        let txn = engine.start_txn();
        let db = txn.create_database(db_name).unwrap();
        let table = txn.create_table(db, schema).unwrap();
        txn.commit().unwrap();
        (db, table)
    }

    fn total_rows(engine: &Engine, db: DatabaseId, table: TableId) -> u64 {
        let txn = engine.start_txn();
        let count = txn.row_count(db, table).unwrap();
        txn.rollback().unwrap();
        count
    }

    #[test]
    fn test_basic_append_and_scan() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1, 2, 3])).unwrap();
        // Read-your-writes before commit.
        assert_eq!(txn.row_count(db, table).unwrap(), 3);
        txn.commit().unwrap();

        assert_eq!(total_rows(&engine, db, table), 3);
        let txn = engine.start_txn();
        let row = txn.get_by_filter(db, table, &Value::Int32(2)).unwrap();
        assert_eq!(txn.get_value(db, table, row, 1).unwrap(), Value::Int64(20));
        txn.rollback().unwrap();
    }

    #[test]
    fn test_snapshot_isolation_monotone() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1])).unwrap();
        txn.commit().unwrap();

        // A reader that started before the second append never sees it.
        let early = engine.start_txn();
        let txn = engine.start_txn();
        txn.append(db, table, rows(&[2])).unwrap();
        txn.commit().unwrap();

        assert_eq!(early.row_count(db, table).unwrap(), 1);
        early.rollback().unwrap();
        assert_eq!(total_rows(&engine, db, table), 2);
    }

    // Scenario 1: append/delete/append cycles leave one live row and
    // committed phantoms behind.
    #[test]
    fn test_ada_cycle() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        for _ in 0..3 {
            txn.append(db, table, one_row(1)).unwrap();
            txn.delete_by_filter(db, table, &Value::Int32(1)).unwrap();
        }
        txn.append(db, table, one_row(1)).unwrap();
        txn.commit().unwrap();

        // One live row, three deleted phantoms.
        assert_eq!(total_rows(&engine, db, table), 1);
        let addr = engine.table_blocks(db, table).unwrap()[0];
        let block = engine.inner.catalog.get_block(addr).unwrap();
        let data = block.data.read();
        let appendable = data.as_appendable().unwrap();
        assert_eq!(appendable.total_rows(), 4);
        assert_eq!(appendable.deletes.deleted_count_at(Timestamp::MAX), 3);
        drop(data);

        let txn = engine.start_txn();
        let row = txn.get_by_filter(db, table, &Value::Int32(1)).unwrap();
        assert_eq!(row, RowRef::Block(addr, 3));
        txn.rollback().unwrap();
    }

    // Scenario 2: two txns racing on the same row; the later one conflicts
    // on update and on delete, then rolls back.
    #[test]
    fn test_ww_conflict_on_update() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[3])).unwrap();
        txn.commit().unwrap();

        let t1 = engine.start_txn();
        let t2 = engine.start_txn();
        // Both can read the row.
        t1.get_by_filter(db, table, &Value::Int32(3)).unwrap();
        t2.get_by_filter(db, table, &Value::Int32(3)).unwrap();

        t2.update_by_filter(db, table, &Value::Int32(3), 1, Value::Int64(2222)).unwrap();
        t2.commit().unwrap();

        let err = t1
            .update_by_filter(db, table, &Value::Int32(3), 1, Value::Int64(1111))
            .unwrap_err();
        assert!(matches!(err, EngineError::WWConflict(_)), "got {:?}", err);
        let err = t1.delete_by_filter(db, table, &Value::Int32(3)).unwrap_err();
        assert!(matches!(err, EngineError::WWConflict(_)), "got {:?}", err);
        t1.rollback().unwrap();

        let txn = engine.start_txn();
        let row = txn.get_by_filter(db, table, &Value::Int32(3)).unwrap();
        assert_eq!(txn.get_value(db, table, row, 1).unwrap(), Value::Int64(2222));
        txn.rollback().unwrap();
    }

    // Two concurrent appends of the same key: the later preparer aborts.
    #[test]
    fn test_ww_conflict_on_duplicate_append() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let t1 = engine.start_txn();
        let t2 = engine.start_txn();
        t1.append(db, table, rows(&[7])).unwrap();
        t2.append(db, table, rows(&[7])).unwrap();
        t1.commit().unwrap();
        let err = t2.commit().unwrap_err();
        assert!(matches!(err, EngineError::WWConflict(_)), "got {:?}", err);
        assert_eq!(total_rows(&engine, db, table), 1);
    }

    #[test]
    fn test_duplicate_append_same_snapshot_is_dup() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[5])).unwrap();
        txn.commit().unwrap();

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[5])).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(err, EngineError::DuplicateEntry(_)), "got {:?}", err);
    }

    #[test]
    fn test_block_and_segment_rollover() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        // 10-row blocks, 2 blocks per segment.
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        let keys: Vec<i32> = (0..50).collect();
        txn.append(db, table, rows(&keys)).unwrap();
        txn.commit().unwrap();

        assert_eq!(total_rows(&engine, db, table), 50);
        let blocks = engine.table_blocks(db, table).unwrap();
        assert_eq!(blocks.len(), 5);
        let segments: std::collections::BTreeSet<_> =
            blocks.iter().map(|b| b.segment()).collect();
        assert_eq!(segments.len(), 3);

        // Every key resolves.
        let txn = engine.start_txn();
        for k in [0, 9, 10, 25, 49] {
            txn.get_by_filter(db, table, &Value::Int32(k)).unwrap();
        }
        txn.rollback().unwrap();
    }

    #[test]
    fn test_flush_preserves_reads_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 4));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();

        // Delete one row, keep an old reader alive across the flush.
        let txn = engine.start_txn();
        txn.delete_by_filter(db, table, &Value::Int32(4)).unwrap();
        txn.commit().unwrap();
        let old_reader = engine.start_txn();

        let addr = engine.table_blocks(db, table).unwrap()[0];
        let (new_addr, _) = engine.flush_block(addr).unwrap();
        assert_ne!(addr, new_addr);

        // Old reader still sees 9 rows through the retired block.
        assert_eq!(old_reader.row_count(db, table).unwrap(), 9);
        old_reader.rollback().unwrap();

        // New readers see the persisted block.
        let txn = engine.start_txn();
        assert_eq!(txn.row_count(db, table).unwrap(), 9);
        let row = txn.get_by_filter(db, table, &Value::Int32(7)).unwrap();
        assert_eq!(txn.get_value(db, table, row, 1).unwrap(), Value::Int64(70));
        assert!(txn.get_by_filter(db, table, &Value::Int32(4)).is_err());
        txn.rollback().unwrap();
    }

    // I6: an in-flight deleter survives a flush through the transfer table.
    #[test]
    fn test_inflight_delete_redirected_through_transfer() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 4));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();
        let addr = engine.table_blocks(db, table).unwrap()[0];

        // T1 records its delete against the old block, then the flush
        // retires the block, then T1 commits.
        let t1 = engine.start_txn();
        t1.delete_by_filter(db, table, &Value::Int32(6)).unwrap();
        engine.flush_block(addr).unwrap();
        t1.commit().unwrap();

        assert_eq!(total_rows(&engine, db, table), 9);
        let txn = engine.start_txn();
        assert!(txn.get_by_filter(db, table, &Value::Int32(6)).is_err());
        txn.rollback().unwrap();
    }

    // Scenario 3: merge three blocks (one with deletes) into two persisted
    // blocks; lookups survive the move.
    #[test]
    fn test_merge_with_deletes_and_transfer() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 4));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&(0..30).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();
        let blocks = engine.table_blocks(db, table).unwrap();
        assert_eq!(blocks.len(), 3);

        // Delete rows 5..=9 of the first block.
        let txn = engine.start_txn();
        txn.range_delete(blocks[0], 5, 9).unwrap();
        txn.commit().unwrap();
        assert_eq!(total_rows(&engine, db, table), 25);

        let (outputs, _) = engine.merge_blocks(&blocks, Some(13)).unwrap();
        assert_eq!(outputs.len(), 2);

        assert_eq!(total_rows(&engine, db, table), 25);
        let txn = engine.start_txn();
        for k in 0..30 {
            let result = txn.get_by_filter(db, table, &Value::Int32(k));
            if (5..10).contains(&k) {
                assert!(result.is_err(), "key {} should be gone", k);
            } else {
                let row = result.unwrap();
                assert_eq!(
                    txn.get_value(db, table, row, 1).unwrap(),
                    Value::Int64(k as i64 * 10)
                );
            }
        }
        txn.rollback().unwrap();

        // The merged-out segments are retired; a fresh append opens a new
        // appendable segment.
        let txn = engine.start_txn();
        txn.append(db, table, rows(&[100])).unwrap();
        txn.commit().unwrap();
        assert_eq!(total_rows(&engine, db, table), 26);
    }

    // Scenario 4: incremental checkpoint, restart, state matches.
    #[test]
    fn test_checkpoint_restart() {
        let dir = TempDir::new().unwrap();
        let mut expected = Vec::new();
        {
            let engine = open_engine(&dir);
            for i in 0..4 {
                let db_name = format!("db{}", i);
                let txn = engine.start_txn();
                let db = txn.create_database(&db_name).unwrap();
                let mut tables = Vec::new();
                for t in 0..2 {
                    let table = txn
                        .create_table(db, int_schema(&format!("t{}", t), 10, 2))
                        .unwrap();
                    tables.push(table);
                }
                txn.commit().unwrap();

                let txn = engine.start_txn();
                for (t, table) in tables.iter().enumerate() {
                    let keys: Vec<i32> = (0..(3 + t as i32 + i)).collect();
                    txn.append(db, *table, rows(&keys)).unwrap();
                }
                txn.commit().unwrap();
                for (t, table) in tables.iter().enumerate() {
                    expected.push((db_name.clone(), format!("t{}", t), *table, db, 3 + t as i32 + i));
                }
            }
            engine.force_checkpoint().unwrap().unwrap();
            engine.shutdown();
        }

        let engine = open_engine(&dir);
        for (db_name, table_name, table, db, count) in &expected {
            let txn = engine.start_txn();
            let found_db = txn.get_database_id(db_name).unwrap();
            assert_eq!(found_db, *db);
            let found_table = txn.get_table_id(*db, table_name).unwrap();
            assert_eq!(found_table, *table);
            assert_eq!(txn.row_count(*db, *table).unwrap(), *count as u64);
            // Column values survive the restart.
            let row = txn.get_by_filter(*db, *table, &Value::Int32(0)).unwrap();
            assert_eq!(txn.get_value(*db, *table, row, 1).unwrap(), Value::Int64(0));
            txn.rollback().unwrap();
        }
    }

    // P3/P4: restart replays WAL-only state too, and a second restart
    // converges to the same counts.
    #[test]
    fn test_restart_wal_tail_idempotent() {
        let dir = TempDir::new().unwrap();
        let (db, table);
        {
            let engine = open_engine(&dir);
            let handles = setup_table(&engine, "db1", int_schema("t1", 10, 2));
            db = handles.0;
            table = handles.1;
            let txn = engine.start_txn();
            txn.append(db, table, rows(&[1, 2, 3])).unwrap();
            txn.commit().unwrap();
            let txn = engine.start_txn();
            txn.delete_by_filter(db, table, &Value::Int32(2)).unwrap();
            txn.commit().unwrap();
            engine.shutdown();
        }
        for _ in 0..2 {
            let engine = open_engine(&dir);
            assert_eq!(total_rows(&engine, db, table), 2);
            engine.shutdown();
        }
    }

    // Scenario 5: rename, then a new table reuses the old name; overlapping
    // keys dedup against the new table only.
    #[test]
    fn test_rename_then_dedup() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, t1) = setup_table(&engine, "db1", int_schema("t1", 20, 2));

        let txn = engine.start_txn();
        txn.append(db, t1, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();

        let txn = engine.start_txn();
        txn.alter_table(
            db,
            t1,
            AlterRequest::RenameTable { old: "t1".into(), new: "t2".into() },
        )
        .unwrap();
        txn.commit().unwrap();

        // A brand-new t1 takes overlapping keys without conflict.
        let txn = engine.start_txn();
        let new_t1 = txn.create_table(db, int_schema("t1", 20, 2)).unwrap();
        txn.append(db, new_t1, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();
        assert_ne!(new_t1, t1);

        let txn = engine.start_txn();
        let t2 = txn.get_table_id(db, "t2").unwrap();
        assert_eq!(t2, t1);
        assert_eq!(txn.row_count(db, t2).unwrap(), 10);
        assert_eq!(txn.row_count(db, new_t1).unwrap(), 10);
        txn.rollback().unwrap();
    }

    // Scenario 6: truncated varchar zonemap still excludes keys below the
    // minimum without touching the bloom filter; exact keys resolve.
    #[test]
    fn test_zonemap_truncation_on_persisted_block() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let schema = Schema::new(
            "t1",
            vec![("k", LogicalType::Varchar), ("v", LogicalType::Int64)],
            "k",
            10,
            2,
        )
        .unwrap();
        let txn = engine.start_txn();
        let db = txn.create_database("db1").unwrap();
        let table = txn.create_table(db, schema).unwrap();
        txn.commit().unwrap();

        let min_key = vec![0x01u8; 35];
        let mut keys: Vec<Vec<u8>> = vec![min_key.clone()];
        for i in 0..5u8 {
            keys.push(vec![0x02 + i; 35]);
        }
        let batch = Batch::new(vec![
            ColumnVector::from_values(
                LogicalType::Varchar,
                keys.iter().map(|k| Value::Varchar(k.clone())).collect(),
            ),
            ColumnVector::from_values(
                LogicalType::Int64,
                (0..keys.len() as i64).map(Value::Int64).collect(),
            ),
        ])
        .unwrap();
        let txn = engine.start_txn();
        txn.append(db, table, batch).unwrap();
        txn.commit().unwrap();

        let addr = engine.table_blocks(db, table).unwrap()[0];
        engine.flush_block(addr).unwrap();

        let txn = engine.start_txn();
        // Below the truncated zonemap minimum: excluded by the zonemap
        // alone.
        let below = Value::Varchar(vec![0x00u8; 33]);
        assert!(matches!(
            txn.get_by_filter(db, table, &below),
            Err(EngineError::NotFound(_))
        ));
        // The exact long key still resolves.
        let row = txn.get_by_filter(db, table, &Value::Varchar(min_key)).unwrap();
        assert_eq!(txn.get_value(db, table, row, 1).unwrap(), Value::Int64(0));
        txn.rollback().unwrap();
    }

    #[test]
    fn test_delta_flush_and_snapshot_reads() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 4));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();
        let addr = engine.table_blocks(db, table).unwrap()[0];
        let (new_addr, _) = engine.flush_block(addr).unwrap();

        // Delete against the persisted block, then fold to a delta object.
        let txn = engine.start_txn();
        txn.delete_by_filter(db, table, &Value::Int32(3)).unwrap();
        txn.commit().unwrap();
        engine.flush_deletes(new_addr).unwrap().unwrap();

        let block = engine.inner.catalog.get_block(new_addr).unwrap();
        {
            let data = block.data.read();
            let persisted = data.as_persisted().unwrap();
            assert!(persisted.delta_loc.is_some());
            // Resident chain was pruned into the delta.
            assert!(persisted.deletes.is_empty());
        }

        assert_eq!(total_rows(&engine, db, table), 9);
        let txn = engine.start_txn();
        assert!(txn.get_by_filter(db, table, &Value::Int32(3)).is_err());
        txn.rollback().unwrap();
    }

    #[test]
    fn test_logtail_stream_and_state() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));
        let before = engine.inner.ts.last();

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1, 2])).unwrap();
        txn.commit().unwrap();
        let txn = engine.start_txn();
        txn.delete_by_filter(db, table, &Value::Int32(1)).unwrap();
        let commit_ts = txn.commit().unwrap();

        let response = engine
            .sync_logtail(
                0,
                &SyncLogtailReq {
                    cn_have: before,
                    cn_want: commit_ts,
                    db,
                    table,
                    want_state: true,
                },
            )
            .unwrap();
        let inserts = response
            .commands
            .iter()
            .filter(|c| {
                c.table_name == "t1" && c.entry_type == crate::logtail::EntryType::Insert
            })
            .count();
        let deletes = response
            .commands
            .iter()
            .filter(|c| {
                c.table_name == "t1" && c.entry_type == crate::logtail::EntryType::Delete
            })
            .count();
        assert_eq!(inserts, 1);
        assert_eq!(deletes, 1);
        assert!(response.commands.iter().any(|c| c.table_name == "mo_tables"));
    }

    #[test]
    fn test_global_checkpoint_and_gc() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 4));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&(0..10).collect::<Vec<_>>())).unwrap();
        txn.commit().unwrap();
        let addr = engine.table_blocks(db, table).unwrap()[0];
        engine.flush_block(addr).unwrap();
        engine.force_checkpoint().unwrap().unwrap();

        let txn = engine.start_txn();
        txn.drop_table(db, "t1").unwrap();
        txn.commit().unwrap();
        engine.force_checkpoint().unwrap().unwrap();
        engine.force_global_checkpoint().unwrap().unwrap();

        let stats = engine.run_gc().unwrap();
        assert!(stats.swept_entries > 0);
        // The dropped table is gone even by id.
        let txn = engine.start_txn();
        assert!(txn.get_table_id(db, "t1").is_err());
        txn.rollback().unwrap();

        // Restart from the global checkpoint alone.
        engine.shutdown();
        drop(engine);
        let engine = open_engine(&dir);
        let txn = engine.start_txn();
        assert!(txn.get_database_id("db1").is_ok());
        assert!(txn.get_table_id(db, "t1").is_err());
        txn.rollback().unwrap();
    }

    #[test]
    fn test_tenant_scoped_names() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        let txn = engine.start_txn_for_tenant(1);
        let db1 = txn.create_database("shared").unwrap();
        txn.commit().unwrap();
        let txn = engine.start_txn_for_tenant(2);
        // Same name under another tenant is no duplicate.
        let db2 = txn.create_database("shared").unwrap();
        txn.commit().unwrap();
        assert_ne!(db1, db2);

        let txn = engine.start_txn_for_tenant(1);
        assert_eq!(txn.get_database_id("shared").unwrap(), db1);
        // The system database is visible to every tenant.
        assert!(txn.get_database_id(crate::catalog::SYSTEM_DB_NAME).is_ok());
        txn.rollback().unwrap();
    }

    #[test]
    fn test_commit_after_terminal_state() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1])).unwrap();
        let inner_txn = txn.txn.clone();
        txn.commit().unwrap();
        // Idempotence: a second commit or rollback reports TxnNotFound.
        assert!(matches!(
            engine.inner.txns.commit(&inner_txn),
            Err(EngineError::TxnNotFound(_))
        ));
        assert!(matches!(
            engine.inner.txns.rollback(&inner_txn),
            Err(EngineError::TxnNotFound(_))
        ));
    }

    #[test]
    fn test_rollback_discards_everything() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1, 2])).unwrap();
        txn.create_database("doomed").unwrap();
        txn.rollback().unwrap();

        assert_eq!(total_rows(&engine, db, table), 0);
        let txn = engine.start_txn();
        assert!(txn.get_database_id("doomed").is_err());
        txn.rollback().unwrap();
    }

    #[test]
    fn test_schema_alter_add_column_reads_null() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let (db, table) = setup_table(&engine, "db1", int_schema("t1", 10, 2));

        let txn = engine.start_txn();
        txn.append(db, table, rows(&[1])).unwrap();
        txn.commit().unwrap();

        let txn = engine.start_txn();
        txn.alter_table(
            db,
            table,
            AlterRequest::AddColumn { name: "extra".into(), typ: LogicalType::Varchar, logical_pos: 2 },
        )
        .unwrap();
        txn.commit().unwrap();

        // Old rows read the new column as null.
        let txn = engine.start_txn();
        let row = txn.get_by_filter(db, table, &Value::Int32(1)).unwrap();
        assert_eq!(txn.get_value(db, table, row, 2).unwrap(), Value::Null);
        txn.rollback().unwrap();
    }
}
