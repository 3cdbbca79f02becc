//! Checkpointing
//!
//! Incremental checkpoints drain committed windows `(prev_end, end]` into
//! self-describing objects; a registry file (JSON, atomically rewritten)
//! records the strictly contiguous entry list. When enough incrementals
//! accumulate, they fold into a global snapshot capturing the state as of
//! the fold's end; superseded entries and objects are dropped. Restart loads
//! the newest global, replays later incrementals, then the WAL tail.

pub mod gc;
pub mod global;
pub mod incremental;

pub use gc::{GcRunner, GcStats};
pub use global::{restore_catalog, snapshot_catalog, GlobalSnapshot};
pub use incremental::CheckpointData;

use crate::catalog::Catalog;
use crate::error::{EngineError, Result};
use crate::fs::{FileService, Location};
use crate::logtail::{CommittedRecord, LogtailMgr};
use crate::types::{Sequence, Timestamp, TsAllocator};
use crate::wal::record::WalPayload;
use crate::wal::Wal;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CheckpointKind {
    Incremental,
    Global,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointEntryMeta {
    pub kind: CheckpointKind,
    pub start: Timestamp,
    pub end: Timestamp,
    pub location: Location,
    pub covered_lsn: u64,
}

pub struct CheckpointMgr {
    fs: Arc<dyn FileService>,
    registry_path: PathBuf,
    config: crate::config::CheckpointConfig,
    entries: RwLock<Vec<CheckpointEntryMeta>>,
}

impl CheckpointMgr {
    pub fn open(
        fs: Arc<dyn FileService>,
        registry_path: impl Into<PathBuf>,
        config: crate::config::CheckpointConfig,
    ) -> Result<Self> {
        let registry_path = registry_path.into();
        let entries = if registry_path.exists() {
            let bytes = std::fs::read(&registry_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Vec::new()
        };
        Ok(Self { fs, registry_path, config, entries: RwLock::new(entries) })
    }

    fn persist(&self, entries: &[CheckpointEntryMeta]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.registry_path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.registry_path)?;
        Ok(())
    }

    pub fn entries(&self) -> Vec<CheckpointEntryMeta> {
        self.entries.read().clone()
    }

    /// End of the newest entry; collection resumes right after it.
    pub fn last_end(&self) -> Timestamp {
        self.entries.read().iter().map(|e| e.end).max().unwrap_or(Timestamp::MIN)
    }

    pub fn latest_global(&self) -> Option<CheckpointEntryMeta> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.kind == CheckpointKind::Global)
            .max_by_key(|e| e.end)
            .cloned()
    }

    pub fn max_covered_lsn(&self) -> u64 {
        self.entries.read().iter().map(|e| e.covered_lsn).max().unwrap_or(0)
    }

    /// Cut an incremental checkpoint over everything committed since the
    /// last entry. Skips below the dirty threshold unless forced.
    pub fn run_incremental(
        &self,
        logtail: &LogtailMgr,
        wal: &Wal,
        force: bool,
    ) -> Result<Option<CheckpointEntryMeta>> {
        let prev_end = self.last_end();
        let until = match logtail.max_ts() {
            Some(ts) if ts > prev_end => ts,
            _ => return Ok(None),
        };
        let records = logtail.records_in(prev_end, until);
        if records.is_empty() || (!force && records.len() < self.config.dirty_threshold) {
            return Ok(None);
        }

        let start = prev_end.next();
        let data = CheckpointData::from_records(start, until, &records);
        let covered_lsn = data.max_lsn();
        let bytes = bincode::serialize(&data)?;
        let name = format!("ckp/incr-{}", until);
        let location = self.fs.write(&name, &bytes)?;

        wal.append(&WalPayload::CheckpointPointer {
            start,
            end: until,
            location: location.pack(),
        })?;

        let meta = CheckpointEntryMeta {
            kind: CheckpointKind::Incremental,
            start,
            end: until,
            location,
            covered_lsn,
        };
        {
            let mut entries = self.entries.write();
            entries.push(meta.clone());
            self.persist(&entries)?;
        }
        wal.truncate_to(covered_lsn)?;
        log::info!("incremental checkpoint ({}, {}] with {} records", prev_end, until, records.len());
        Ok(Some(meta))
    }

    /// Fold the incremental prefix into a global snapshot once the count
    /// crosses the threshold.
    pub fn run_global(&self, logtail: &LogtailMgr, force: bool) -> Result<Option<CheckpointEntryMeta>> {
        let (prev_global, pending): (Option<CheckpointEntryMeta>, Vec<CheckpointEntryMeta>) = {
            let entries = self.entries.read();
            let prev = entries
                .iter()
                .filter(|e| e.kind == CheckpointKind::Global)
                .max_by_key(|e| e.end)
                .cloned();
            let after = prev.as_ref().map(|g| g.end).unwrap_or(Timestamp::MIN);
            let mut pending: Vec<_> = entries
                .iter()
                .filter(|e| e.kind == CheckpointKind::Incremental && e.start > after)
                .cloned()
                .collect();
            pending.sort_by_key(|e| e.start);
            (prev, pending)
        };
        if pending.is_empty() || (!force && pending.len() < self.config.global_threshold) {
            return Ok(None);
        }

        // Fold into a scratch catalog: previous global state plus every
        // pending incremental, in order.
        let scratch = Catalog::new();
        let scratch_seq = Sequence::new();
        if let Some(prev) = &prev_global {
            let snap = self.read_global(prev)?;
            restore_catalog(&scratch, &scratch_seq, &snap)?;
        }
        let mut covered_lsn = prev_global.as_ref().map(|g| g.covered_lsn).unwrap_or(0);
        for entry in &pending {
            let data = self.read_incremental(entry)?;
            covered_lsn = covered_lsn.max(data.max_lsn());
            for (lsn, record) in data.into_records() {
                crate::catalog::apply::apply_record(&scratch, &scratch_seq, &record, Some(lsn))?;
            }
        }

        let end = pending.last().map(|e| e.end).unwrap_or(Timestamp::MIN);
        let snap = snapshot_catalog(&scratch, end);
        let bytes = bincode::serialize(&snap)?;
        let name = format!("ckp/global-{}", end);
        let location = self.fs.write(&name, &bytes)?;
        let meta = CheckpointEntryMeta {
            kind: CheckpointKind::Global,
            start: Timestamp::MIN,
            end,
            location,
            covered_lsn,
        };

        // Superseded entries (the folded incrementals and the old global)
        // leave the registry; their objects go with them.
        let mut stale = Vec::new();
        {
            let mut entries = self.entries.write();
            let mut kept = Vec::new();
            for entry in entries.iter() {
                let superseded = match entry.kind {
                    CheckpointKind::Incremental => entry.end <= end,
                    CheckpointKind::Global => entry.end < end,
                };
                if superseded {
                    stale.push(entry.location.object.clone());
                } else {
                    kept.push(entry.clone());
                }
            }
            kept.push(meta.clone());
            kept.sort_by_key(|e| e.end);
            *entries = kept;
            self.persist(&entries)?;
        }
        for object in stale {
            self.fs.delete(&object)?;
        }
        logtail.prune_upto(end);
        log::info!("global checkpoint at {} folded {} incrementals", end, pending.len());
        Ok(Some(meta))
    }

    pub fn read_incremental(&self, entry: &CheckpointEntryMeta) -> Result<CheckpointData> {
        let bytes = self.fs.read(&entry.location, None)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn read_global(&self, entry: &CheckpointEntryMeta) -> Result<GlobalSnapshot> {
        if entry.kind != CheckpointKind::Global {
            return Err(EngineError::Internal("entry is not a global checkpoint".into()));
        }
        let bytes = self.fs.read(&entry.location, None)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Restart: newest global, then later incrementals in order. Returns the
    /// LSN the WAL tail replay should start after.
    pub fn replay_into(
        &self,
        catalog: &Catalog,
        seq: &Sequence,
        ts: &TsAllocator,
        logtail: &LogtailMgr,
    ) -> Result<u64> {
        let entries = self.entries();
        let global = self.latest_global();
        if let Some(global) = &global {
            let snap = self.read_global(global)?;
            restore_catalog(catalog, seq, &snap)?;
            ts.observe(snap.end);
        }
        let after = global.as_ref().map(|g| g.end).unwrap_or(Timestamp::MIN);
        let mut incrementals: Vec<_> = entries
            .iter()
            .filter(|e| e.kind == CheckpointKind::Incremental && e.start > after)
            .cloned()
            .collect();
        incrementals.sort_by_key(|e| e.start);
        for entry in &incrementals {
            let data = self.read_incremental(entry)?;
            for (lsn, record) in data.into_records() {
                ts.observe(record.commit_ts);
                crate::catalog::apply::apply_record(catalog, seq, &record, Some(lsn))?;
                logtail.publish(Arc::new(CommittedRecord {
                    commit_ts: record.commit_ts,
                    lsn,
                    record,
                }));
            }
        }
        Ok(self.max_covered_lsn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileService;
    use crate::types::{BlockAddr, BlockId, ColumnVector, LogicalType, SegmentId, Value};
    use crate::wal::record::{BlockMutation, CatalogOp, PreparedRecord, RecordOp};
    use tempfile::TempDir;

    fn ts(n: i64) -> Timestamp {
        Timestamp::new(n, 0)
    }

    fn setup(dir: &TempDir) -> (Arc<LocalFileService>, CheckpointMgr, LogtailMgr, Wal) {
        let fs = Arc::new(LocalFileService::new(dir.path().join("objects")).unwrap());
        let config = crate::config::CheckpointConfig {
            dirty_threshold: 1,
            global_threshold: 2,
            ..Default::default()
        };
        let mgr =
            CheckpointMgr::open(fs.clone(), dir.path().join("checkpoints.json"), config).unwrap();
        let logtail = LogtailMgr::new();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        (fs, mgr, logtail, wal)
    }

    fn publish_create(logtail: &LogtailMgr, ts_n: i64, lsn: u64, db: u64) {
        let seg = SegmentId(ts_n as u128);
        let addr = BlockAddr::new(db, 100, BlockId::new(seg, 0));
        let schema =
            crate::schema::Schema::new("t1", vec![("pk", LogicalType::Int32)], "pk", 10, 2)
                .unwrap();
        let record = PreparedRecord {
            txn_id: lsn,
            commit_ts: ts(ts_n),
            tenant: 1,
            ops: vec![
                RecordOp::Catalog(CatalogOp::CreateDatabase {
                    id: db,
                    name: format!("db{}", db),
                    tenant: 1,
                }),
                RecordOp::Catalog(CatalogOp::CreateTable { db, id: 100, tenant: 1, schema }),
                RecordOp::Catalog(CatalogOp::CreateSegment {
                    db,
                    table: 100,
                    id: seg,
                    appendable: true,
                    sorted: true,
                }),
                RecordOp::Catalog(CatalogOp::CreateBlock { addr, schema_version: 0 }),
                RecordOp::Mutation(BlockMutation::Append {
                    addr,
                    batch: crate::data::Batch::new(vec![ColumnVector::from_values(
                        LogicalType::Int32,
                        vec![Value::Int32(1)],
                    )])
                    .unwrap(),
                }),
            ],
        };
        logtail.publish(Arc::new(CommittedRecord { commit_ts: ts(ts_n), lsn, record }));
    }

    #[test]
    fn test_incremental_entries_contiguous() {
        let dir = TempDir::new().unwrap();
        let (_fs, mgr, logtail, wal) = setup(&dir);

        publish_create(&logtail, 10, 1, 7);
        let first = mgr.run_incremental(&logtail, &wal, true).unwrap().unwrap();
        publish_create(&logtail, 20, 2, 8);
        let second = mgr.run_incremental(&logtail, &wal, true).unwrap().unwrap();

        assert_eq!(second.start, first.end.next());
        // Nothing new: no entry.
        assert!(mgr.run_incremental(&logtail, &wal, true).unwrap().is_none());
    }

    #[test]
    fn test_global_fold_supersedes_incrementals() {
        let dir = TempDir::new().unwrap();
        let (fs, mgr, logtail, wal) = setup(&dir);

        publish_create(&logtail, 10, 1, 7);
        mgr.run_incremental(&logtail, &wal, true).unwrap().unwrap();
        publish_create(&logtail, 20, 2, 8);
        mgr.run_incremental(&logtail, &wal, true).unwrap().unwrap();

        let global = mgr.run_global(&logtail, false).unwrap().unwrap();
        assert_eq!(global.end, ts(20));
        let entries = mgr.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, CheckpointKind::Global);
        // Folded incremental objects are gone.
        assert!(fs.list("ckp/incr-").unwrap().is_empty());
    }

    #[test]
    fn test_replay_rebuilds_catalog() {
        let dir = TempDir::new().unwrap();
        let (_fs, mgr, logtail, wal) = setup(&dir);
        publish_create(&logtail, 10, 1, 7);
        mgr.run_incremental(&logtail, &wal, true).unwrap();
        publish_create(&logtail, 20, 2, 8);
        mgr.run_incremental(&logtail, &wal, true).unwrap();
        mgr.run_global(&logtail, true).unwrap();
        publish_create(&logtail, 30, 3, 9);
        mgr.run_incremental(&logtail, &wal, true).unwrap();

        let catalog = Catalog::new();
        let seq = Sequence::new();
        let ts_alloc = TsAllocator::with_start(ts(1));
        let fresh_tail = LogtailMgr::new();
        mgr.replay_into(&catalog, &seq, &ts_alloc, &fresh_tail).unwrap();

        for db in [7u64, 8, 9] {
            let table = catalog.get_table_by_id(db, 100, ts(40), None).unwrap();
            let blocks = table.visible_segments(ts(40), None)[0].visible_blocks(ts(40), None);
            assert_eq!(blocks.len(), 1, "db {}", db);
        }
        // Replaying twice converges (idempotence).
        mgr.replay_into(&catalog, &seq, &ts_alloc, &fresh_tail).unwrap();
        let table = catalog.get_table_by_id(7, 100, ts(40), None).unwrap();
        let data_rows = {
            let blocks = table.visible_segments(ts(40), None)[0].visible_blocks(ts(40), None);
            let data = blocks[0].data.read();
            data.as_appendable().unwrap().total_rows()
        };
        assert_eq!(data_rows, 1);
    }
}
