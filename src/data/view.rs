//! Snapshot column views
//!
//! A read returns the column data visible at the snapshot plus the delete
//! mask; callers either iterate the mask or compact it away.

use crate::types::{ColumnVector, Value};
use roaring::RoaringBitmap;

#[derive(Debug, Clone)]
pub struct ColumnView {
    pub data: ColumnVector,
    pub delete_mask: RoaringBitmap,
}

impl ColumnView {
    pub fn new(data: ColumnVector, delete_mask: RoaringBitmap) -> Self {
        Self { data, delete_mask }
    }

    pub fn row_count(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn live_count(&self) -> u32 {
        self.row_count() - self.delete_mask.len() as u32
    }

    pub fn is_deleted(&self, row: u32) -> bool {
        self.delete_mask.contains(row)
    }

    /// Compacted data with deleted rows dropped.
    pub fn apply_deletes(&self) -> ColumnVector {
        ColumnVector::from_values(
            self.data.typ,
            self.data
                .values
                .iter()
                .enumerate()
                .filter(|(row, _)| !self.delete_mask.contains(*row as u32))
                .map(|(_, v)| v.clone())
                .collect(),
        )
    }

    pub fn live_values(&self) -> Vec<&Value> {
        self.data
            .values
            .iter()
            .enumerate()
            .filter(|(row, _)| !self.delete_mask.contains(*row as u32))
            .map(|(_, v)| v)
            .collect()
    }
}
