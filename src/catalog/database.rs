//! Database catalog entry

use super::chain::{CommitChain, Visibility};
use super::names::NameIndex;
use super::table::TableEntry;
use crate::types::{DatabaseId, TableId, Timestamp, TxnId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct DatabaseEntry {
    pub id: DatabaseId,
    pub name: String,
    pub tenant: u32,

    pub chain: RwLock<CommitChain>,
    tables: RwLock<BTreeMap<TableId, Arc<TableEntry>>>,

    /// Table name resolution within this database.
    pub table_names: RwLock<NameIndex>,
}

impl DatabaseEntry {
    pub fn new(id: DatabaseId, name: impl Into<String>, tenant: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            tenant,
            chain: RwLock::new(CommitChain::new()),
            tables: RwLock::new(BTreeMap::new()),
            table_names: RwLock::new(NameIndex::new()),
        })
    }

    pub fn insert_table(&self, table: Arc<TableEntry>) {
        self.tables.write().insert(table.id, table);
    }

    pub fn remove_table(&self, id: TableId) {
        self.tables.write().remove(&id);
    }

    pub fn table(&self, id: TableId) -> Option<Arc<TableEntry>> {
        self.tables.read().get(&id).cloned()
    }

    pub fn tables_vec(&self) -> Vec<Arc<TableEntry>> {
        self.tables.read().values().cloned().collect()
    }

    pub fn visibility(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Visibility {
        self.chain.read().visibility(snapshot, self_txn)
    }
}
