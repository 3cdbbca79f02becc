//! Tombstone and object GC
//!
//! Driven by the newest global checkpoint: catalog entries deleted at or
//! before its end — and before every live snapshot — are removed together
//! with their on-disk objects, transfer mappings nobody can use anymore are
//! dropped, and the WAL is truncated to the covered LSN.

use crate::catalog::Catalog;
use crate::error::Result;
use crate::fs::FileService;
use crate::logtail::LogtailMgr;
use crate::tasks::TransferTable;
use crate::txn::TxnMgr;
use crate::types::Timestamp;
use crate::wal::Wal;
use std::sync::Arc;

use super::CheckpointMgr;

#[derive(Debug, Default)]
pub struct GcStats {
    pub swept_entries: usize,
    pub unlinked_objects: usize,
    pub wal_truncated_to: u64,
}

pub struct GcRunner {
    catalog: Arc<Catalog>,
    txns: Arc<TxnMgr>,
    checkpoints: Arc<CheckpointMgr>,
    wal: Arc<Wal>,
    fs: Arc<dyn FileService>,
    transfer: Arc<TransferTable>,
    logtail: Arc<LogtailMgr>,
}

impl GcRunner {
    pub fn new(
        catalog: Arc<Catalog>,
        txns: Arc<TxnMgr>,
        checkpoints: Arc<CheckpointMgr>,
        wal: Arc<Wal>,
        fs: Arc<dyn FileService>,
        transfer: Arc<TransferTable>,
        logtail: Arc<LogtailMgr>,
    ) -> Self {
        Self { catalog, txns, checkpoints, wal, fs, transfer, logtail }
    }

    pub fn run(&self) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let global = match self.checkpoints.latest_global() {
            Some(global) => global,
            // Nothing is durably folded yet; sweeping would lose state.
            None => return Ok(stats),
        };

        let min_active = self.txns.min_active_start_ts();
        let mut limit = global.end;
        if let Some(min) = min_active {
            // An entry deleted exactly at a live snapshot must survive.
            limit = limit.min(min.prev());
        }

        let sweep = self.catalog.sweep_deleted(limit);
        stats.swept_entries = sweep.removed_entries;
        for object in &sweep.freed_objects {
            self.fs.delete(object)?;
            stats.unlinked_objects += 1;
        }

        self.transfer.sweep(min_active.unwrap_or(Timestamp::MAX));
        self.logtail.prune_upto(global.end);

        let covered = self.checkpoints.max_covered_lsn();
        if covered > 0 {
            self.wal.truncate_to(covered)?;
            stats.wal_truncated_to = covered;
        }
        if stats.swept_entries > 0 || stats.unlinked_objects > 0 {
            log::info!(
                "gc swept {} entries, unlinked {} objects (limit {})",
                stats.swept_entries,
                stats.unlinked_objects,
                limit
            );
        }
        Ok(stats)
    }
}
