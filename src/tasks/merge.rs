//! Merge task: N blocks → ≥1 persisted blocks in a fresh segment
//!
//! Inputs are typically persisted blocks of one segment, but appendable
//! blocks merge the same way. Live rows are read at the task snapshot,
//! concatenated (sorted on the primary key when the schema is sorted), split
//! into output blocks, and written as new objects. Commit retires every
//! input, installs one transfer mapping per input, and drops input segments
//! that end up empty.

use crate::catalog::{EntryOp, Visibility};
use crate::config::EngineConfig;
use crate::data::{write_block_object, Batch, BlockData};
use crate::error::{EngineError, Result};
use crate::fs::{FileService, Location};
use crate::txn::manager::TaskCommit;
use crate::txn::{AccessInfo, DedupType, TxnMgr};
use crate::types::{BlockAddr, BlockId, Cancel, ColumnVector, SegmentId, Timestamp};
use crate::wal::record::{BlockMutation, CatalogOp, RecordOp};
use ahash::AHashMap;
use std::sync::Arc;

pub struct Merger {
    mgr: Arc<TxnMgr>,
    fs: Arc<dyn FileService>,
    config: EngineConfig,
}

impl Merger {
    pub fn new(mgr: Arc<TxnMgr>, fs: Arc<dyn FileService>, config: EngineConfig) -> Self {
        Self { mgr, fs, config }
    }

    /// Merge the given blocks (all of one table). `max_rows` caps each
    /// output block; `None` uses the schema's `block_max_rows`.
    pub fn merge_blocks(
        &self,
        inputs: &[BlockAddr],
        max_rows: Option<u32>,
        cancel: &Cancel,
    ) -> Result<(Vec<BlockAddr>, Timestamp)> {
        let txn = self.mgr.begin(AccessInfo::default(), DedupType::FullSkipWorkspace);
        let result = self.merge_blocks_inner(&txn, inputs, max_rows, cancel);
        if result.is_err() && !txn.state().is_terminal() {
            let _ = self.mgr.rollback(&txn);
        }
        result
    }

    fn merge_blocks_inner(
        &self,
        txn: &Arc<crate::txn::Txn>,
        inputs: &[BlockAddr],
        max_rows: Option<u32>,
        cancel: &Cancel,
    ) -> Result<(Vec<BlockAddr>, Timestamp)> {
        let first = *inputs.first().ok_or_else(|| {
            EngineError::Internal("merge requires at least one input block".into())
        })?;
        if inputs.iter().any(|a| a.db != first.db || a.table != first.table) {
            return Err(EngineError::Internal("merge inputs span tables".into()));
        }

        let snapshot = txn.start_ts;
        let catalog = self.mgr.catalog().clone();
        let reader = self.mgr.reader().clone();

        let table = catalog.get_table_by_id(first.db, first.table, snapshot, None)?;
        let schema = table.schema();
        let wanted: Vec<_> = schema.columns.iter().map(|c| (c.seq_num, c.typ)).collect();
        let cap = max_rows.unwrap_or(schema.block_max_rows).max(1);

        // Read phase: live rows per input, tracked back to their source.
        let mut concat = Batch::empty_like(&schema);
        let mut sources: Vec<(usize, u32)> = Vec::new();
        let mut input_deltas: Vec<Option<Location>> = Vec::new();
        for (idx, addr) in inputs.iter().enumerate() {
            cancel.check()?;
            let block = catalog.get_block(*addr)?;
            if block.visibility(snapshot, None) != Visibility::Visible {
                return Err(EngineError::NotFound(format!("block {}", addr)));
            }
            let data = block.data.read();
            let (views, delta_loc) = match &*data {
                BlockData::Appendable(a) => (
                    wanted
                        .iter()
                        .map(|(seq, typ)| a.column_view_by_seqnum(*seq, *typ, snapshot))
                        .collect::<Result<Vec<_>>>()?,
                    None,
                ),
                BlockData::Persisted(p) => (
                    reader.column_views(p, &wanted, snapshot)?,
                    p.delta_loc.clone(),
                ),
            };
            input_deltas.push(delta_loc);
            let mask = &views[0].delete_mask;
            let live: Vec<u32> =
                (0..views[0].row_count()).filter(|r| !mask.contains(*r)).collect();
            let columns: Vec<ColumnVector> = views
                .iter()
                .map(|v| {
                    ColumnVector::from_values(
                        v.data.typ,
                        live.iter().map(|r| v.data.values[*r as usize].clone()).collect(),
                    )
                })
                .collect();
            concat.extend_from(&Batch::new(columns)?)?;
            sources.extend(live.into_iter().map(|r| (idx, r)));
        }

        // Sort on the primary key, carrying the source mapping along.
        if schema.sorted {
            if let Some(pk_pos) = schema.pk_pos() {
                let key = &concat.columns[pk_pos];
                let mut order: Vec<u32> = (0..concat.row_count()).collect();
                order.sort_by(|a, b| {
                    key.values[*a as usize].cmp(&key.values[*b as usize])
                });
                concat = concat.take(&order);
                sources = order.iter().map(|o| sources[*o as usize]).collect();
            }
        }

        // Write phase: one object per output chunk.
        let new_segment = SegmentId::generate();
        let total = concat.row_count();
        let out_count = ((total + cap - 1) / cap).max(1);
        let mut locations: Vec<(BlockAddr, Location, u32)> = Vec::new();
        for chunk in 0..out_count {
            cancel.check()?;
            let start = chunk * cap;
            let end = (start + cap).min(total);
            let out = concat.slice(start, end);
            let addr = BlockAddr::new(first.db, first.table, BlockId::new(new_segment, chunk as u16));
            let name = format!("tbl-{}/merge-{}-{}", first.table, addr.block, txn.id);
            let loc = write_block_object(self.fs.as_ref(), &name, &out, &schema, self.config.bloom)?;
            locations.push((addr, loc, out.row_count()));
        }

        // Old (input, row) → new (block, row).
        let mut mappings: AHashMap<BlockId, Vec<(u32, (BlockId, u32))>> = AHashMap::new();
        for (new_pos, (input_idx, old_row)) in sources.iter().enumerate() {
            let chunk = new_pos as u32 / cap;
            let new_block = BlockId::new(new_segment, chunk as u16);
            let new_row = new_pos as u32 % cap;
            mappings
                .entry(inputs[*input_idx].block)
                .or_default()
                .push((*old_row, (new_block, new_row)));
        }

        let inputs_owned: Vec<BlockAddr> = inputs.to_vec();
        let schema_version = schema.version;
        let sorted = schema.sorted;
        let commit_ts = self.mgr.commit_system(txn, |prepare_ts| {
            let mut ops = vec![RecordOp::Catalog(CatalogOp::CreateSegment {
                db: first.db,
                table: first.table,
                id: new_segment,
                appendable: false,
                sorted,
            })];
            for (addr, loc, rows) in &locations {
                ops.push(RecordOp::Catalog(CatalogOp::CreateBlock {
                    addr: *addr,
                    schema_version,
                }));
                ops.push(RecordOp::Mutation(BlockMutation::SetMetaLoc {
                    addr: *addr,
                    loc: loc.clone(),
                    row_count: *rows,
                    schema_version,
                }));
                ops.push(RecordOp::Catalog(CatalogOp::UpgradeBlock {
                    addr: *addr,
                    op: EntryOp::UpgradeSorted,
                }));
            }

            let mut transfers = Vec::new();
            for (idx, addr) in inputs_owned.iter().enumerate() {
                let block = catalog.get_block(*addr)?;
                if block.chain.read().has_commit_after(snapshot) {
                    return Err(EngineError::WWConflict(format!(
                        "merge input {} changed after task start",
                        addr
                    )));
                }
                let data = block.data.read();
                if let Some(a) = data.as_appendable() {
                    if a.appended_after(snapshot) {
                        return Err(EngineError::WWConflict(format!(
                            "merge input {} received appends after task start",
                            addr
                        )));
                    }
                }
                if let Some(p) = data.as_persisted() {
                    if p.delta_loc != input_deltas[idx] {
                        return Err(EngineError::WWConflict(format!(
                            "merge input {} delta rewritten during task",
                            addr
                        )));
                    }
                }

                let mapping = mappings.remove(&addr.block).unwrap_or_default();
                for (ts, rows) in data.deletes().committed_in(snapshot, prepare_ts) {
                    let mut moved = Vec::new();
                    for row in rows {
                        if let Some((_, (new_block, new_row))) =
                            mapping.iter().find(|(old, _)| *old == row)
                        {
                            moved.push((*new_block, *new_row));
                        }
                    }
                    let mut per_block: AHashMap<BlockId, Vec<u32>> = AHashMap::new();
                    for (block_id, row) in moved {
                        per_block.entry(block_id).or_default().push(row);
                    }
                    for (block_id, mut rows) in per_block {
                        rows.sort_unstable();
                        ops.push(RecordOp::Mutation(BlockMutation::Delete {
                            addr: BlockAddr::new(first.db, first.table, block_id),
                            rows,
                            at: Some(ts),
                        }));
                    }
                }
                ops.push(RecordOp::Catalog(CatalogOp::DropBlock { addr: *addr, hard: false }));
                transfers.push((addr.block, mapping));
            }

            // Input segments that end up with every block retired go too.
            let mut segments: Vec<SegmentId> = inputs_owned.iter().map(|a| a.segment()).collect();
            segments.sort_unstable();
            segments.dedup();
            for segment_id in segments {
                if let Some(segment) = table.segment(segment_id) {
                    let all_retired = segment.blocks_vec().into_iter().all(|b| {
                        inputs_owned.iter().any(|a| a.block == b.addr.block)
                            || b.visibility(Timestamp::MAX, None) != Visibility::Visible
                    });
                    if all_retired {
                        ops.push(RecordOp::Catalog(CatalogOp::DropSegment {
                            db: first.db,
                            table: first.table,
                            id: segment_id,
                        }));
                    }
                }
            }

            Ok(TaskCommit { ops, transfers })
        })?;

        Ok((locations.into_iter().map(|(addr, _, _)| addr).collect(), commit_ts))
    }
}
