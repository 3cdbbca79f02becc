//! Per-block primary-key index
//!
//! Hash for unsorted schemas, B-tree for sorted ones. A key can map to
//! several row offsets: delete-then-reinsert of the same key leaves phantom
//! rows behind, and visibility filtering happens at the block, not here.
//! Reads are lock-free; writes are gated by the block's write lock.

use crate::types::Value;
use ahash::AHashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum PkIndex {
    Hash(AHashMap<Value, Vec<u32>>),
    Sorted(BTreeMap<Value, Vec<u32>>),
}

impl PkIndex {
    pub fn new(sorted: bool) -> Self {
        if sorted {
            PkIndex::Sorted(BTreeMap::new())
        } else {
            PkIndex::Hash(AHashMap::new())
        }
    }

    pub fn insert(&mut self, key: Value, row: u32) {
        match self {
            PkIndex::Hash(map) => map.entry(key).or_default().push(row),
            PkIndex::Sorted(map) => map.entry(key).or_default().push(row),
        }
    }

    /// All row offsets ever written under `key`, oldest first.
    pub fn get(&self, key: &Value) -> &[u32] {
        match self {
            PkIndex::Hash(map) => map.get(key).map(|v| v.as_slice()).unwrap_or(&[]),
            PkIndex::Sorted(map) => map.get(key).map(|v| v.as_slice()).unwrap_or(&[]),
        }
    }

    pub fn contains(&self, key: &Value) -> bool {
        !self.get(key).is_empty()
    }

    pub fn key_count(&self) -> usize {
        match self {
            PkIndex::Hash(map) => map.len(),
            PkIndex::Sorted(map) => map.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut index = PkIndex::new(false);
        index.insert(Value::Int32(1), 0);
        index.insert(Value::Int32(2), 1);
        assert_eq!(index.get(&Value::Int32(1)), &[0]);
        assert!(index.get(&Value::Int32(3)).is_empty());
    }

    #[test]
    fn test_duplicate_key_keeps_all_rows() {
        let mut index = PkIndex::new(true);
        index.insert(Value::Int32(7), 0);
        index.insert(Value::Int32(7), 4);
        index.insert(Value::Int32(7), 9);
        assert_eq!(index.get(&Value::Int32(7)), &[0, 4, 9]);
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn test_sorted_variant_orders_keys() {
        let mut index = PkIndex::new(true);
        for k in [5, 1, 3] {
            index.insert(Value::Int32(k), k as u32);
        }
        if let PkIndex::Sorted(map) = &index {
            let keys: Vec<_> = map.keys().cloned().collect();
            assert_eq!(keys, vec![Value::Int32(1), Value::Int32(3), Value::Int32(5)]);
        } else {
            panic!("expected sorted index");
        }
    }
}
