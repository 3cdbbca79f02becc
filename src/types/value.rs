//! Scalar values and typed column vectors
//!
//! Columns are vectors of `Value` tagged with a `LogicalType`; nulls are the
//! `Value::Null` variant so a freshly materialized column for a post-hoc
//! `AddColumn` is just a typed all-null vector. `Value` carries a total order
//! (floats via `total_cmp`) so it can serve as a primary key and feed the
//! zonemap.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Bool,
    Int32,
    Int64,
    Float64,
    Varchar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Varchar(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(LogicalType::Bool),
            Value::Int32(_) => Some(LogicalType::Int32),
            Value::Int64(_) => Some(LogicalType::Int64),
            Value::Float64(_) => Some(LogicalType::Float64),
            Value::Varchar(_) => Some(LogicalType::Varchar),
        }
    }

    /// Byte image of the value, fed to bloom filters and key hashing.
    pub fn key_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![],
            Value::Bool(v) => vec![*v as u8],
            Value::Int32(v) => v.to_be_bytes().to_vec(),
            Value::Int64(v) => v.to_be_bytes().to_vec(),
            Value::Float64(v) => v.to_bits().to_be_bytes().to_vec(),
            Value::Varchar(v) => v.clone(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_) => 2,
            Value::Int64(_) => 3,
            Value::Float64(_) => 4,
            Value::Varchar(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (Float64(a), Float64(b)) => a.total_cmp(b),
            (Varchar(a), Varchar(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int32(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Varchar(v) => v.hash(state),
        }
    }
}

/// Typed column vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnVector {
    pub typ: LogicalType,
    pub values: Vec<Value>,
}

impl ColumnVector {
    pub fn new(typ: LogicalType) -> Self {
        Self { typ, values: Vec::new() }
    }

    pub fn from_values(typ: LogicalType, values: Vec<Value>) -> Self {
        Self { typ, values }
    }

    /// Typed all-null vector of the requested length.
    pub fn all_null(typ: LogicalType, len: usize) -> Self {
        Self { typ, values: vec![Value::Null; len] }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn get(&self, row: usize) -> Option<&Value> {
        self.values.get(row)
    }

    pub fn extend_from(&mut self, other: &ColumnVector) {
        self.values.extend_from_slice(&other.values);
    }

    pub fn slice(&self, start: usize, end: usize) -> ColumnVector {
        ColumnVector { typ: self.typ, values: self.values[start..end].to_vec() }
    }
}
