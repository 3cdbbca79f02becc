//! Appendable block data
//!
//! In-memory column batch plus the MVCC bookkeeping that makes it readable at
//! any snapshot: append ranges stamped with their commit timestamp, a delete
//! chain, and the primary-key index. Rows are applied at commit under the
//! block write lock; readers reconstruct the visible prefix from the append
//! ranges.

use super::batch::Batch;
use super::deletes::DeleteChain;
use super::view::ColumnView;
use crate::error::{EngineError, Result};
use crate::index::PkIndex;
use crate::schema::Schema;
use crate::types::{ColumnVector, Timestamp, TxnId, Value};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One committed append: rows `[start_row, end_row)` became visible at
/// `commit_ts`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppendNode {
    pub start_row: u32,
    pub end_row: u32,
    pub commit_ts: Timestamp,
    pub tran_id: TxnId,
}

#[derive(Debug)]
pub struct AppendableData {
    schema: Arc<Schema>,
    batch: Batch,
    appends: Vec<AppendNode>,
    pub deletes: DeleteChain,
    pk: PkIndex,
}

impl AppendableData {
    pub fn new(schema: Arc<Schema>) -> Self {
        let batch = Batch::empty_like(&schema);
        let pk = PkIndex::new(schema.sorted);
        Self { schema, batch, appends: Vec::new(), deletes: DeleteChain::new(), pk }
    }

    /// Rebuild from checkpointed parts; the PK index is re-derived.
    pub fn from_parts(
        schema: Arc<Schema>,
        batch: Batch,
        appends: Vec<AppendNode>,
        deletes: DeleteChain,
    ) -> Self {
        let mut pk = PkIndex::new(schema.sorted);
        if let Some(pk_pos) = schema.pk_pos() {
            if let Some(keys) = batch.column(pk_pos) {
                for (row, key) in keys.values.iter().enumerate() {
                    pk.insert(key.clone(), row as u32);
                }
            }
        }
        Self { schema, batch, appends, deletes, pk }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn total_rows(&self) -> u32 {
        self.batch.row_count()
    }

    pub fn space_left(&self) -> u32 {
        self.schema.block_max_rows.saturating_sub(self.total_rows())
    }

    pub fn is_full(&self) -> bool {
        self.space_left() == 0
    }

    /// Rows visible at a snapshot: the longest committed prefix.
    pub fn visible_rows(&self, snapshot: Timestamp) -> u32 {
        self.appends
            .iter()
            .rev()
            .find(|n| n.commit_ts <= snapshot)
            .map(|n| n.end_row)
            .unwrap_or(0)
    }

    /// Append a committed batch. Idempotent per commit timestamp so replay
    /// can re-apply records.
    pub fn apply_append(&mut self, tran_id: TxnId, ts: Timestamp, rows: &Batch) -> Result<()> {
        if self.appends.iter().any(|n| n.commit_ts == ts && n.tran_id == tran_id) {
            return Ok(());
        }
        if rows.column_count() != self.batch.column_count() {
            return Err(EngineError::Internal(format!(
                "append width {} vs block width {}",
                rows.column_count(),
                self.batch.column_count()
            )));
        }
        let start = self.total_rows();
        if rows.row_count() > self.space_left() {
            return Err(EngineError::Internal(format!(
                "append of {} rows overflows block ({} left)",
                rows.row_count(),
                self.space_left()
            )));
        }
        self.batch.extend_from(rows)?;
        let end = self.total_rows();
        if let Some(pk_pos) = self.schema.pk_pos() {
            if let Some(keys) = rows.column(pk_pos) {
                for (i, key) in keys.values.iter().enumerate() {
                    self.pk.insert(key.clone(), start + i as u32);
                }
            }
        }
        self.appends.push(AppendNode { start_row: start, end_row: end, commit_ts: ts, tran_id });
        Ok(())
    }

    pub fn apply_delete(&mut self, tran_id: TxnId, ts: Timestamp, rows: RoaringBitmap) {
        if self.deletes.has_commit_at(ts) {
            return;
        }
        self.deletes.add_committed(tran_id, ts, rows);
    }

    /// All append ranges committed in `(after, until]`; checkpoint collection
    /// walks these.
    pub fn appends_in(&self, after: Timestamp, until: Timestamp) -> Vec<(AppendNode, Batch)> {
        self.appends
            .iter()
            .filter(|n| n.commit_ts > after && n.commit_ts <= until)
            .map(|n| (n.clone(), self.batch.slice(n.start_row, n.end_row)))
            .collect()
    }

    pub fn append_nodes(&self) -> &[AppendNode] {
        &self.appends
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Any append committed after `ts`? Flush aborts when the block moved
    /// under it.
    pub fn appended_after(&self, ts: Timestamp) -> bool {
        self.appends.iter().any(|n| n.commit_ts > ts)
    }

    pub fn is_row_visible(&self, row: u32, snapshot: Timestamp) -> bool {
        row < self.visible_rows(snapshot) && !self.deletes.is_deleted_at(row, snapshot)
    }

    pub fn live_count(&self, snapshot: Timestamp) -> u32 {
        let visible = self.visible_rows(snapshot);
        let deleted = self.deletes.mask_at(snapshot).iter().filter(|r| *r < visible).count();
        visible - deleted as u32
    }

    /// Live rows at a snapshot, ascending row order.
    pub fn live_rows(&self, snapshot: Timestamp) -> Vec<u32> {
        let visible = self.visible_rows(snapshot);
        let mask = self.deletes.mask_at(snapshot);
        (0..visible).filter(|r| !mask.contains(*r)).collect()
    }

    /// Newest visible row holding `key`.
    pub fn get_by_filter(&self, key: &Value, snapshot: Timestamp) -> Option<u32> {
        self.pk
            .get(key)
            .iter()
            .rev()
            .copied()
            .find(|row| self.is_row_visible(*row, snapshot))
    }

    pub fn get_value(&self, row: u32, col_pos: usize, snapshot: Timestamp) -> Result<Value> {
        if !self.is_row_visible(row, snapshot) {
            return Err(EngineError::NotFound(format!("row {}", row)));
        }
        self.batch
            .column(col_pos)
            .and_then(|c| c.get(row as usize))
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("column {}", col_pos)))
    }

    pub fn column_view(&self, col_pos: usize, snapshot: Timestamp) -> Result<ColumnView> {
        let visible = self.visible_rows(snapshot);
        let col = self
            .batch
            .column(col_pos)
            .ok_or_else(|| EngineError::NotFound(format!("column {}", col_pos)))?;
        let data = col.slice(0, visible as usize);
        let mut mask = self.deletes.mask_at(snapshot);
        mask.remove_range(visible..);
        Ok(ColumnView::new(data, mask))
    }

    /// A requested seqnum that predates this block's schema version reads as
    /// an all-null column.
    pub fn column_view_by_seqnum(
        &self,
        seq_num: crate::types::ColSeqNum,
        typ: crate::types::LogicalType,
        snapshot: Timestamp,
    ) -> Result<ColumnView> {
        match self.schema.logical_pos_of(seq_num) {
            Some(pos) => self.column_view(pos, snapshot),
            None => {
                let visible = self.visible_rows(snapshot);
                let mut mask = self.deletes.mask_at(snapshot);
                mask.remove_range(visible..);
                Ok(ColumnView::new(ColumnVector::all_null(typ, visible as usize), mask))
            }
        }
    }

    /// Like `dedup`, but reports the conflicting row and the commit
    /// timestamp of its append, letting the caller distinguish a plain
    /// duplicate from a write-write race.
    pub fn find_duplicate(&self, keys: &[Value], since: Option<Timestamp>) -> Option<(u32, Timestamp)> {
        for key in keys {
            for row in self.pk.get(key) {
                let node = match self
                    .appends
                    .iter()
                    .find(|n| *row >= n.start_row && *row < n.end_row)
                {
                    Some(node) => node,
                    None => continue,
                };
                if matches!(since, Some(since) if node.commit_ts <= since) {
                    continue;
                }
                if !self.deletes.is_deleted_at(*row, Timestamp::MAX) {
                    return Some((*row, node.commit_ts));
                }
            }
        }
        None
    }

    /// Duplicate check against the latest committed state. `since` restricts
    /// the probe to rows appended after it (incremental dedup).
    pub fn dedup(&self, keys: &[Value], since: Option<Timestamp>) -> Result<()> {
        for key in keys {
            for row in self.pk.get(key) {
                if let Some(since) = since {
                    let node = self
                        .appends
                        .iter()
                        .find(|n| *row >= n.start_row && *row < n.end_row);
                    if matches!(node, Some(n) if n.commit_ts <= since) {
                        continue;
                    }
                }
                if !self.deletes.is_deleted_at(*row, Timestamp::MAX) {
                    return Err(EngineError::DuplicateEntry(format!("key {:?}", key)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalType;

    fn ts(n: i64) -> Timestamp {
        Timestamp::new(n, 0)
    }

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                "t",
                vec![("pk", LogicalType::Int32), ("v", LogicalType::Int64)],
                "pk",
                10,
                2,
            )
            .unwrap(),
        )
    }

    fn rows(keys: &[i32]) -> Batch {
        Batch::new(vec![
            ColumnVector::from_values(
                LogicalType::Int32,
                keys.iter().map(|k| Value::Int32(*k)).collect(),
            ),
            ColumnVector::from_values(
                LogicalType::Int64,
                keys.iter().map(|k| Value::Int64(*k as i64 * 100)).collect(),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_append_visibility_by_snapshot() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[1, 2, 3])).unwrap();
        data.apply_append(2, ts(20), &rows(&[4, 5])).unwrap();

        assert_eq!(data.visible_rows(ts(5)), 0);
        assert_eq!(data.visible_rows(ts(10)), 3);
        assert_eq!(data.visible_rows(ts(25)), 5);
        assert_eq!(data.live_count(ts(25)), 5);
    }

    #[test]
    fn test_apply_append_idempotent() {
        let mut data = AppendableData::new(schema());
        let batch = rows(&[1, 2]);
        data.apply_append(1, ts(10), &batch).unwrap();
        data.apply_append(1, ts(10), &batch).unwrap();
        assert_eq!(data.total_rows(), 2);
    }

    #[test]
    fn test_delete_and_get_by_filter() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[1, 2, 3])).unwrap();
        data.apply_delete(2, ts(20), [1u32].into_iter().collect());

        // Row 1 (key 2) visible before the delete, gone after.
        assert_eq!(data.get_by_filter(&Value::Int32(2), ts(15)), Some(1));
        assert_eq!(data.get_by_filter(&Value::Int32(2), ts(20)), None);
        assert_eq!(data.live_count(ts(20)), 2);
    }

    #[test]
    fn test_reinsert_finds_newest_row() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[7])).unwrap();
        data.apply_delete(2, ts(20), [0u32].into_iter().collect());
        data.apply_append(3, ts(30), &rows(&[7])).unwrap();

        assert_eq!(data.get_by_filter(&Value::Int32(7), ts(35)), Some(1));
        assert_eq!(data.get_by_filter(&Value::Int32(7), ts(15)), Some(0));
        assert_eq!(data.live_count(ts(35)), 1);
    }

    #[test]
    fn test_dedup_modes() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[1, 2])).unwrap();

        assert!(data.dedup(&[Value::Int32(1)], None).is_err());
        assert!(data.dedup(&[Value::Int32(9)], None).is_ok());

        // Incremental: rows appended at or before `since` are skipped.
        assert!(data.dedup(&[Value::Int32(1)], Some(ts(10))).is_ok());
        assert!(data.dedup(&[Value::Int32(1)], Some(ts(5))).is_err());

        // Deleted rows no longer count as duplicates.
        data.apply_delete(2, ts(20), [0u32].into_iter().collect());
        assert!(data.dedup(&[Value::Int32(1)], None).is_ok());
    }

    #[test]
    fn test_column_view_masks_deletes() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[1, 2, 3])).unwrap();
        data.apply_delete(2, ts(20), [0u32].into_iter().collect());

        let view = data.column_view(0, ts(25)).unwrap();
        assert_eq!(view.row_count(), 3);
        assert_eq!(view.live_count(), 2);
        let compact = view.apply_deletes();
        assert_eq!(compact.values, vec![Value::Int32(2), Value::Int32(3)]);

        // Older snapshot: delete invisible.
        let view = data.column_view(0, ts(15)).unwrap();
        assert_eq!(view.live_count(), 3);
    }

    #[test]
    fn test_column_view_by_missing_seqnum_is_all_null() {
        let mut data = AppendableData::new(schema());
        data.apply_append(1, ts(10), &rows(&[1])).unwrap();
        let view = data.column_view_by_seqnum(9, LogicalType::Varchar, ts(15)).unwrap();
        assert_eq!(view.row_count(), 1);
        assert!(view.data.values[0].is_null());
    }

    #[test]
    fn test_overflow_rejected() {
        let mut data = AppendableData::new(schema());
        let keys: Vec<i32> = (0..11).collect();
        assert!(data.apply_append(1, ts(10), &rows(&keys)).is_err());
    }
}
