//! Tenant-scoped name index
//!
//! Per-parent multimap from name to id slots. Rename and drop never rewrite
//! slots in place: a drop stamps `drop_ts`, a rename drops the old name and
//! inserts the new one at the same commit timestamp, so resolution at any
//! snapshot stays exact. The index only holds committed state; a
//! transaction's own uncommitted names resolve through its workspace.

use crate::types::Timestamp;
use ahash::AHashMap;

/// Reserved tenant for system entries, visible to every tenant.
pub const SYSTEM_TENANT: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NameKey {
    tenant: u32,
    name: String,
}

#[derive(Debug, Clone)]
struct NameSlot {
    id: u64,
    create_ts: Timestamp,
    drop_ts: Option<Timestamp>,
}

#[derive(Debug, Default)]
pub struct NameIndex {
    map: AHashMap<NameKey, Vec<NameSlot>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tenant: u32, name: &str, id: u64, ts: Timestamp) {
        let key = NameKey { tenant, name: name.to_string() };
        self.map.entry(key).or_default().push(NameSlot { id, create_ts: ts, drop_ts: None });
    }

    pub fn mark_dropped(&mut self, tenant: u32, name: &str, id: u64, ts: Timestamp) {
        let key = NameKey { tenant, name: name.to_string() };
        if let Some(slots) = self.map.get_mut(&key) {
            for slot in slots.iter_mut().rev() {
                if slot.id == id && slot.drop_ts.is_none() {
                    slot.drop_ts = Some(ts);
                    break;
                }
            }
        }
    }

    /// Remove every slot for `id` under `name`; used when an entry is GCed.
    pub fn remove_id(&mut self, tenant: u32, name: &str, id: u64) {
        let key = NameKey { tenant, name: name.to_string() };
        if let Some(slots) = self.map.get_mut(&key) {
            slots.retain(|s| s.id != id);
            if slots.is_empty() {
                self.map.remove(&key);
            }
        }
    }

    /// Resolve a name at a snapshot. Falls back to the system tenant, whose
    /// entries are visible to everyone.
    pub fn resolve(&self, tenant: u32, name: &str, snapshot: Timestamp) -> Option<u64> {
        self.resolve_scoped(tenant, name, snapshot).or_else(|| {
            if tenant != SYSTEM_TENANT {
                self.resolve_scoped(SYSTEM_TENANT, name, snapshot)
            } else {
                None
            }
        })
    }

    fn resolve_scoped(&self, tenant: u32, name: &str, snapshot: Timestamp) -> Option<u64> {
        let key = NameKey { tenant, name: name.to_string() };
        let slots = self.map.get(&key)?;
        slots
            .iter()
            .rev()
            .find(|s| {
                s.create_ts <= snapshot && s.drop_ts.map(|d| d > snapshot).unwrap_or(true)
            })
            .map(|s| s.id)
    }

    /// Any create or drop of this name committed after `ts`? Drives the
    /// WW check for racing DDL on the same name.
    pub fn changed_after(&self, tenant: u32, name: &str, ts: Timestamp) -> bool {
        let key = NameKey { tenant, name: name.to_string() };
        match self.map.get(&key) {
            None => false,
            Some(slots) => slots
                .iter()
                .any(|s| s.create_ts > ts || s.drop_ts.map(|d| d > ts).unwrap_or(false)),
        }
    }
}
