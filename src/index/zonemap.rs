//! Zonemap: per-block min/max key summary
//!
//! Varchar bounds longer than `PREFIX_LEN` are truncated: the min keeps a
//! 30-byte prefix (still a lower bound), the max keeps the prefix with the
//! last byte incremented (still an upper bound). A probe outside the bounds
//! is definitely absent; inside, the caller falls through to the bloom filter
//! and the exact index.

use crate::types::Value;
use serde::{Deserialize, Serialize};

/// Max stored bytes for a varchar bound.
pub const PREFIX_LEN: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneMap {
    min: Option<Value>,
    max: Option<Value>,

    /// Set when the max bound could not be tightened (all-0xFF prefix); the
    /// upper bound is then unbounded.
    max_unbounded: bool,
}

impl ZoneMap {
    pub fn new() -> Self {
        Self { min: None, max: None, max_unbounded: false }
    }

    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut zm = Self::new();
        for key in keys {
            zm.update(key);
        }
        zm
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_none()
    }

    pub fn update(&mut self, key: &Value) {
        let lo = truncate_min(key);
        let (hi, unbounded) = truncate_max(key);
        match &self.min {
            None => self.min = Some(lo),
            Some(cur) if lo < *cur => self.min = Some(lo),
            _ => {}
        }
        if unbounded {
            self.max_unbounded = true;
        }
        match &self.max {
            None => self.max = Some(hi),
            Some(cur) if hi > *cur => self.max = Some(hi),
            _ => {}
        }
    }

    /// False means every probed key is definitely absent from the block.
    pub fn fast_intersect(&self, keys: &[Value]) -> bool {
        keys.iter().any(|k| self.may_contain(k))
    }

    pub fn may_contain(&self, key: &Value) -> bool {
        let (min, max) = match (&self.min, &self.max) {
            (Some(min), Some(max)) => (min, max),
            _ => return false,
        };
        if key < min {
            return false;
        }
        if !self.max_unbounded && key > max {
            return false;
        }
        true
    }

    pub fn min(&self) -> Option<&Value> {
        self.min.as_ref()
    }

    pub fn max(&self) -> Option<&Value> {
        self.max.as_ref()
    }
}

impl Default for ZoneMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower bound after truncation: a prefix never exceeds the original.
fn truncate_min(key: &Value) -> Value {
    match key {
        Value::Varchar(bytes) if bytes.len() > PREFIX_LEN => {
            Value::Varchar(bytes[..PREFIX_LEN].to_vec())
        }
        other => other.clone(),
    }
}

/// Upper bound after truncation: increment the last prefix byte so the bound
/// stays above every key sharing the prefix. All-0xFF prefixes cannot be
/// incremented and leave the bound open.
fn truncate_max(key: &Value) -> (Value, bool) {
    match key {
        Value::Varchar(bytes) if bytes.len() > PREFIX_LEN => {
            let mut prefix = bytes[..PREFIX_LEN].to_vec();
            for i in (0..prefix.len()).rev() {
                if prefix[i] != 0xFF {
                    prefix[i] += 1;
                    prefix.truncate(i + 1);
                    return (Value::Varchar(prefix), false);
                }
            }
            (Value::Varchar(prefix), true)
        }
        other => (other.clone(), false),
    }
}
