//! Column batches
//!
//! A batch is an ordered set of equal-length column vectors, the unit of
//! append, flush and logtail payloads. Column order matches the logical
//! order of the schema version it was written under.

use crate::error::{EngineError, Result};
use crate::schema::Schema;
use crate::types::{ColumnVector, Value};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Batch {
    pub columns: Vec<ColumnVector>,
}

impl Batch {
    pub fn new(columns: Vec<ColumnVector>) -> Result<Self> {
        let batch = Self { columns };
        batch.validate()?;
        Ok(batch)
    }

    /// Empty batch shaped like `schema`'s live columns.
    pub fn empty_like(schema: &Schema) -> Self {
        Self { columns: schema.columns.iter().map(|c| ColumnVector::new(c.typ)).collect() }
    }

    fn validate(&self) -> Result<()> {
        if let Some(first) = self.columns.first() {
            for col in &self.columns[1..] {
                if col.len() != first.len() {
                    return Err(EngineError::Internal(format!(
                        "ragged batch: {} vs {}",
                        col.len(),
                        first.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn row_count(&self) -> u32 {
        self.columns.first().map(|c| c.len() as u32).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, pos: usize) -> Option<&ColumnVector> {
        self.columns.get(pos)
    }

    pub fn push_row(&mut self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EngineError::Internal(format!(
                "row width {} vs batch width {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (col, value) in self.columns.iter_mut().zip(row) {
            col.push(value.clone());
        }
        Ok(())
    }

    pub fn row(&self, idx: u32) -> Option<Vec<Value>> {
        if idx >= self.row_count() {
            return None;
        }
        Some(self.columns.iter().map(|c| c.values[idx as usize].clone()).collect())
    }

    pub fn extend_from(&mut self, other: &Batch) -> Result<()> {
        if other.columns.len() != self.columns.len() {
            return Err(EngineError::Internal("batch width mismatch".into()));
        }
        for (dst, src) in self.columns.iter_mut().zip(&other.columns) {
            dst.extend_from(src);
        }
        Ok(())
    }

    pub fn slice(&self, start: u32, end: u32) -> Batch {
        Batch {
            columns: self
                .columns
                .iter()
                .map(|c| c.slice(start as usize, end as usize))
                .collect(),
        }
    }

    /// Rows not present in `mask`, in order.
    pub fn exclude(&self, mask: &RoaringBitmap) -> Batch {
        let keep: Vec<u32> = (0..self.row_count()).filter(|r| !mask.contains(*r)).collect();
        self.take(&keep)
    }

    pub fn take(&self, rows: &[u32]) -> Batch {
        Batch {
            columns: self
                .columns
                .iter()
                .map(|c| {
                    ColumnVector::from_values(
                        c.typ,
                        rows.iter().map(|r| c.values[*r as usize].clone()).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Stable sort of all columns by the key column.
    pub fn sort_by_column(&self, key_pos: usize) -> Batch {
        let mut order: Vec<u32> = (0..self.row_count()).collect();
        if let Some(key) = self.columns.get(key_pos) {
            order.sort_by(|a, b| key.values[*a as usize].cmp(&key.values[*b as usize]));
        }
        self.take(&order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalType;

    fn int_batch(values: &[i32]) -> Batch {
        Batch::new(vec![ColumnVector::from_values(
            LogicalType::Int32,
            values.iter().map(|v| Value::Int32(*v)).collect(),
        )])
        .unwrap()
    }

    #[test]
    fn test_ragged_batch_rejected() {
        let result = Batch::new(vec![
            ColumnVector::from_values(LogicalType::Int32, vec![Value::Int32(1)]),
            ColumnVector::from_values(LogicalType::Int32, vec![]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exclude_mask() {
        let batch = int_batch(&[10, 11, 12, 13]);
        let mut mask = RoaringBitmap::new();
        mask.insert(1);
        mask.insert(3);
        let kept = batch.exclude(&mask);
        assert_eq!(kept.row_count(), 2);
        assert_eq!(kept.columns[0].values, vec![Value::Int32(10), Value::Int32(12)]);
    }

    #[test]
    fn test_sort_by_column() {
        let batch = int_batch(&[3, 1, 2]);
        let sorted = batch.sort_by_column(0);
        assert_eq!(
            sorted.columns[0].values,
            vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]
        );
    }

    #[test]
    fn test_push_and_read_row() {
        let mut batch = int_batch(&[]);
        batch.push_row(&[Value::Int32(9)]).unwrap();
        assert_eq!(batch.row(0), Some(vec![Value::Int32(9)]));
        assert_eq!(batch.row(1), None);
        assert!(batch.push_row(&[Value::Int32(1), Value::Int32(2)]).is_err());
    }
}
