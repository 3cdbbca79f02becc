//! Flush task: appendable block → persisted block
//!
//! Runs under its own transaction. The read phase snapshots the block's live
//! rows at `txn.start_ts` and writes the object outside any lock; the commit
//! phase, serialized with every other commit, re-validates the block, carries
//! forward deletes that committed during the task, soft-deletes the old block
//! and installs the row transfer mapping. A transaction that touched the old
//! block and prepares later is redirected through the mapping or aborts.
//!
//! The same file hosts the delta flush: resident deletes of a persisted
//! block are folded into a new delta-delete object.

use crate::config::EngineConfig;
use crate::data::{write_block_object, write_delta_object, Batch, DeltaEntry};
use crate::error::{EngineError, Result};
use crate::fs::FileService;
use crate::schema::Schema;
use crate::txn::manager::TaskCommit;
use crate::txn::{AccessInfo, DedupType, TxnMgr};
use crate::types::{BlockAddr, BlockId, Cancel, Timestamp, Value};
use crate::wal::record::{BlockMutation, CatalogOp, RecordOp};
use crate::catalog::{EntryOp, Visibility};
use std::sync::Arc;
use std::time::Instant;

pub struct Flusher {
    mgr: Arc<TxnMgr>,
    fs: Arc<dyn FileService>,
    config: EngineConfig,
}

impl Flusher {
    pub fn new(mgr: Arc<TxnMgr>, fs: Arc<dyn FileService>, config: EngineConfig) -> Self {
        Self { mgr, fs, config }
    }

    /// One unit of background work: flush the first full appendable block.
    pub fn tick(&self, cancel: &Cancel) {
        if let Some(addr) = self.pick_candidate() {
            match self.flush_block(addr, cancel) {
                Ok((new_addr, ts)) => {
                    log::info!("flushed {} -> {} at {}", addr, new_addr, ts);
                }
                Err(EngineError::WWConflict(msg)) => {
                    log::debug!("flush of {} lost a race: {}", addr, msg);
                }
                Err(e) => log::warn!("flush of {} failed: {}", addr, e),
            }
        }
    }

    fn pick_candidate(&self) -> Option<BlockAddr> {
        let catalog = self.mgr.catalog();
        for db in catalog.databases_vec() {
            for table in db.tables_vec() {
                for segment in table.segments_vec() {
                    for block in segment.blocks_vec() {
                        if block.visibility(Timestamp::MAX, None) != Visibility::Visible {
                            continue;
                        }
                        let data = block.data.read();
                        if matches!(data.as_appendable(), Some(a) if a.is_full()) {
                            return Some(block.addr);
                        }
                    }
                }
            }
        }
        None
    }

    /// Flush one appendable block. Returns the new block's address and the
    /// task's commit timestamp.
    pub fn flush_block(&self, addr: BlockAddr, cancel: &Cancel) -> Result<(BlockAddr, Timestamp)> {
        let txn = self.mgr.begin(AccessInfo::default(), DedupType::FullSkipWorkspace);
        let result = self.flush_block_inner(&txn, addr, cancel);
        if result.is_err() && !txn.state().is_terminal() {
            let _ = self.mgr.rollback(&txn);
        }
        result
    }

    fn flush_block_inner(
        &self,
        txn: &Arc<crate::txn::Txn>,
        addr: BlockAddr,
        cancel: &Cancel,
    ) -> Result<(BlockAddr, Timestamp)> {
        let deadline = Instant::now() + self.config.flush_timeout;
        let snapshot = txn.start_ts;
        let catalog = self.mgr.catalog().clone();

        let block = catalog.get_block(addr)?;
        if block.visibility(snapshot, None) != Visibility::Visible {
            return Err(EngineError::NotFound(format!("block {}", addr)));
        }

        // Read phase: live rows at the snapshot.
        let (batch, schema, live): (Batch, Arc<Schema>, Vec<u32>) = {
            let data = block.data.read();
            let appendable = data.as_appendable().ok_or_else(|| {
                EngineError::Internal(format!("flush target {} is not appendable", addr))
            })?;
            let live = appendable.live_rows(snapshot);
            (appendable.batch().take(&live), appendable.schema().clone(), live)
        };

        let outcome = if live.is_empty() {
            // Nothing survives: retire the block without writing an object.
            self.mgr.commit_system(txn, |prepare_ts| {
                validate_source(&catalog, addr, snapshot)?;
                let carried = carried_deletes(&catalog, addr, snapshot, prepare_ts)?;
                if !carried.is_empty() {
                    return Err(EngineError::WWConflict(format!(
                        "deletes raced an empty flush of {}",
                        addr
                    )));
                }
                Ok(TaskCommit {
                    ops: vec![RecordOp::Catalog(CatalogOp::DropBlock { addr, hard: false })],
                    transfers: vec![(addr.block, Vec::new())],
                })
            })?;
            (addr, txn.commit_ts().unwrap_or(snapshot))
        } else {
            let name = format!("tbl-{}/flush-{}-{}", addr.table, addr.block, txn.id);
            let loc = self.write_with_retries(&name, &batch, &schema, cancel, deadline)?;

            let mut new_addr = BlockAddr::default();
            let commit_ts = self.mgr.commit_system(txn, |prepare_ts| {
                validate_source(&catalog, addr, snapshot)?;

                let table = catalog.get_table_raw(addr.db, addr.table)?;
                let segment = table.segment(addr.segment()).ok_or_else(|| {
                    EngineError::Internal(format!("segment of {} gone", addr))
                })?;
                let new_block = BlockId::new(segment.id, segment.next_block_offset());
                new_addr = BlockAddr::new(addr.db, addr.table, new_block);

                let mut ops = vec![
                    RecordOp::Catalog(CatalogOp::CreateBlock {
                        addr: new_addr,
                        schema_version: schema.version,
                    }),
                    RecordOp::Mutation(BlockMutation::SetMetaLoc {
                        addr: new_addr,
                        loc: loc.clone(),
                        row_count: batch.row_count(),
                        schema_version: schema.version,
                    }),
                    RecordOp::Catalog(CatalogOp::UpgradeBlock {
                        addr: new_addr,
                        op: EntryOp::UpgradeSorted,
                    }),
                ];

                // Deletes that committed while the task ran move with their
                // rows, keeping their original commit timestamps.
                let mapping: Vec<(u32, (BlockId, u32))> = live
                    .iter()
                    .enumerate()
                    .map(|(new_row, old_row)| (*old_row, (new_block, new_row as u32)))
                    .collect();
                for (ts, rows) in carried_deletes(&catalog, addr, snapshot, prepare_ts)? {
                    let mut moved = Vec::new();
                    for row in rows {
                        if let Some((_, (_, new_row))) =
                            mapping.iter().find(|(old, _)| *old == row)
                        {
                            moved.push(*new_row);
                        }
                    }
                    if !moved.is_empty() {
                        ops.push(RecordOp::Mutation(BlockMutation::Delete {
                            addr: new_addr,
                            rows: moved,
                            at: Some(ts),
                        }));
                    }
                }
                ops.push(RecordOp::Catalog(CatalogOp::DropBlock { addr, hard: false }));

                Ok(TaskCommit { ops, transfers: vec![(addr.block, mapping)] })
            })?;
            (new_addr, commit_ts)
        };
        Ok(outcome)
    }

    fn write_with_retries(
        &self,
        name: &str,
        batch: &Batch,
        schema: &Schema,
        cancel: &Cancel,
        deadline: Instant,
    ) -> Result<crate::fs::Location> {
        let mut last_err = None;
        for attempt in 0..self.config.io_retries.max(1) {
            cancel.check()?;
            if Instant::now() >= deadline {
                return Err(EngineError::FlushTimeout(self.config.flush_timeout));
            }
            let attempt_name =
                if attempt == 0 { name.to_string() } else { format!("{}-r{}", name, attempt) };
            match write_block_object(
                self.fs.as_ref(),
                &attempt_name,
                batch,
                schema,
                self.config.bloom,
            ) {
                Ok(loc) => return Ok(loc),
                Err(e @ EngineError::Io(_)) => {
                    log::warn!("flush write attempt {} failed: {}", attempt, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::Internal(format!(
            "flush write exhausted retries: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Fold a persisted block's resident deletes into a delta-delete object.
    pub fn flush_deletes(&self, addr: BlockAddr, cancel: &Cancel) -> Result<Option<Timestamp>> {
        cancel.check()?;
        let txn = self.mgr.begin(AccessInfo::default(), DedupType::FullSkipWorkspace);
        let result = self.flush_deletes_inner(&txn, addr);
        if !txn.state().is_terminal() {
            let _ = self.mgr.rollback(&txn);
        }
        result
    }

    fn flush_deletes_inner(
        &self,
        txn: &Arc<crate::txn::Txn>,
        addr: BlockAddr,
    ) -> Result<Option<Timestamp>> {
        let snapshot = txn.start_ts;
        let catalog = self.mgr.catalog().clone();
        let reader = self.mgr.reader().clone();

        let block = catalog.get_block(addr)?;
        let (meta_loc, old_delta, resident) = {
            let data = block.data.read();
            let persisted = match data.as_persisted() {
                Some(p) => p,
                None => return Ok(None),
            };
            (
                persisted.meta_loc.clone(),
                persisted.delta_loc.clone(),
                persisted.deletes.committed_in(Timestamp::MIN, snapshot),
            )
        };
        if resident.is_empty() {
            return Ok(None);
        }

        // Primary keys of the deleted rows come from the block object.
        let decoded = reader.load_block(&meta_loc)?;
        let mut entries: Vec<DeltaEntry> = match &old_delta {
            Some(loc) => reader.load_delta(loc)?.entries.clone(),
            None => Vec::new(),
        };
        let mut covered = Timestamp::MIN;
        for (ts, rows) in &resident {
            covered = covered.max(*ts);
            for row in rows {
                let pk = decoded
                    .pk_column()
                    .get(row as usize)
                    .cloned()
                    .unwrap_or(Value::Null);
                entries.push(DeltaEntry { row, commit_ts: *ts, aborted: false, pk });
            }
        }

        let name = format!("tbl-{}/delta-{}-{}", addr.table, addr.block, txn.id);
        let loc = write_delta_object(self.fs.as_ref(), &name, addr.block, &entries)?;

        let commit_ts = self.mgr.commit_system(txn, |_prepare_ts| {
            let block = catalog.get_block(addr)?;
            let data = block.data.read();
            let persisted = data.as_persisted().ok_or_else(|| {
                EngineError::WWConflict(format!("block {} changed during delta flush", addr))
            })?;
            if persisted.delta_loc != old_delta {
                return Err(EngineError::WWConflict(format!(
                    "delta of {} rewritten concurrently",
                    addr
                )));
            }
            Ok(TaskCommit {
                ops: vec![RecordOp::Mutation(BlockMutation::SetDeltaLoc {
                    addr,
                    loc: loc.clone(),
                    covered_ts: covered,
                })],
                transfers: Vec::new(),
            })
        })?;
        Ok(Some(commit_ts))
    }
}

/// The source block must not have moved since the task's snapshot.
fn validate_source(
    catalog: &crate::catalog::Catalog,
    addr: BlockAddr,
    snapshot: Timestamp,
) -> Result<()> {
    let block = catalog.get_block(addr)?;
    if block.chain.read().has_commit_after(snapshot) {
        return Err(EngineError::WWConflict(format!("block {} changed after task start", addr)));
    }
    let data = block.data.read();
    if let Some(appendable) = data.as_appendable() {
        if appendable.appended_after(snapshot) {
            return Err(EngineError::WWConflict(format!(
                "block {} received appends after task start",
                addr
            )));
        }
    }
    Ok(())
}

/// Deletes committed in `(snapshot, prepare_ts]` on the source block.
fn carried_deletes(
    catalog: &crate::catalog::Catalog,
    addr: BlockAddr,
    snapshot: Timestamp,
    prepare_ts: Timestamp,
) -> Result<Vec<(Timestamp, roaring::RoaringBitmap)>> {
    let block = catalog.get_block(addr)?;
    let data = block.data.read();
    Ok(data.deletes().committed_in(snapshot, prepare_ts))
}
