//! Catalog tree
//!
//! In-memory hierarchy Database → Table → Segment → Block. Entries are
//! arena-style: keyed by id, children held in ordered maps, parents known by
//! id only. Every entry carries a commit chain; visibility and write-write
//! checks go through it. Name resolution lives in per-parent name indexes and
//! only ever sees committed state.

pub mod apply;
pub mod block;
pub mod chain;
pub mod database;
pub mod names;
pub mod segment;
pub mod table;

pub use block::BlockEntry;
pub use chain::{CommitChain, CommitInfo, EntryOp, Visibility};
pub use database::DatabaseEntry;
pub use names::{NameIndex, SYSTEM_TENANT};
pub use segment::SegmentEntry;
pub use table::TableEntry;

use crate::error::{EngineError, Result};
use crate::types::{BlockAddr, DatabaseId, TableId, Timestamp, TxnId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reserved system database, visible to every tenant.
pub const SYSTEM_DB_ID: DatabaseId = 1;
pub const SYSTEM_DB_NAME: &str = "mo_catalog";

pub struct Catalog {
    databases: RwLock<BTreeMap<DatabaseId, Arc<DatabaseEntry>>>,
    pub db_names: RwLock<NameIndex>,
}

impl Catalog {
    pub fn new() -> Self {
        let catalog = Self {
            databases: RwLock::new(BTreeMap::new()),
            db_names: RwLock::new(NameIndex::new()),
        };
        // The system database exists from the beginning of time.
        let system = DatabaseEntry::new(SYSTEM_DB_ID, SYSTEM_DB_NAME, SYSTEM_TENANT);
        *system.chain.write() = CommitChain::committed(0, Timestamp::MIN, EntryOp::Create);
        catalog.databases.write().insert(SYSTEM_DB_ID, system);
        catalog.db_names.write().insert(SYSTEM_TENANT, SYSTEM_DB_NAME, SYSTEM_DB_ID, Timestamp::MIN);
        catalog
    }

    pub fn insert_database(&self, db: Arc<DatabaseEntry>) {
        self.databases.write().insert(db.id, db);
    }

    pub fn remove_database(&self, id: DatabaseId) {
        self.databases.write().remove(&id);
    }

    pub fn database(&self, id: DatabaseId) -> Option<Arc<DatabaseEntry>> {
        self.databases.read().get(&id).cloned()
    }

    pub fn databases_vec(&self) -> Vec<Arc<DatabaseEntry>> {
        self.databases.read().values().cloned().collect()
    }

    /// Id lookup: soft-deleted entries remain reachable.
    pub fn get_database_by_id(
        &self,
        id: DatabaseId,
        snapshot: Timestamp,
        self_txn: Option<TxnId>,
    ) -> Result<Arc<DatabaseEntry>> {
        let db = self
            .database(id)
            .ok_or_else(|| EngineError::NotFound(format!("database {}", id)))?;
        match db.visibility(snapshot, self_txn) {
            Visibility::Absent => Err(EngineError::NotFound(format!("database {}", id))),
            _ => Ok(db),
        }
    }

    /// Name lookup: hides soft-deleted entries.
    pub fn get_database_by_name(
        &self,
        tenant: u32,
        name: &str,
        snapshot: Timestamp,
    ) -> Result<Arc<DatabaseEntry>> {
        let id = self
            .db_names
            .read()
            .resolve(tenant, name, snapshot)
            .ok_or_else(|| EngineError::NotFound(format!("database {}", name)))?;
        let db = self
            .database(id)
            .ok_or_else(|| EngineError::NotFound(format!("database {}", name)))?;
        match db.visibility(snapshot, None) {
            Visibility::Visible => Ok(db),
            _ => Err(EngineError::NotFound(format!("database {}", name))),
        }
    }

    pub fn get_table_by_id(
        &self,
        db_id: DatabaseId,
        table_id: TableId,
        snapshot: Timestamp,
        self_txn: Option<TxnId>,
    ) -> Result<Arc<TableEntry>> {
        let db = self.get_database_by_id(db_id, snapshot, self_txn)?;
        let table = db
            .table(table_id)
            .ok_or_else(|| EngineError::NotFound(format!("table {}", table_id)))?;
        match table.visibility(snapshot, self_txn) {
            Visibility::Absent => Err(EngineError::NotFound(format!("table {}", table_id))),
            _ => Ok(table),
        }
    }

    pub fn get_table_by_name(
        &self,
        tenant: u32,
        db_id: DatabaseId,
        name: &str,
        snapshot: Timestamp,
    ) -> Result<Arc<TableEntry>> {
        let db = self.get_database_by_id(db_id, snapshot, None)?;
        let id = db
            .table_names
            .read()
            .resolve(tenant, name, snapshot)
            .ok_or_else(|| EngineError::NotFound(format!("table {}", name)))?;
        let table =
            db.table(id).ok_or_else(|| EngineError::NotFound(format!("table {}", name)))?;
        match table.visibility(snapshot, None) {
            Visibility::Visible => Ok(table),
            _ => Err(EngineError::NotFound(format!("table {}", name))),
        }
    }

    /// Raw block lookup by address, no visibility filter; callers that need
    /// one check the entry's chain.
    pub fn get_block(&self, addr: BlockAddr) -> Result<Arc<BlockEntry>> {
        let db = self
            .database(addr.db)
            .ok_or_else(|| EngineError::NotFound(format!("database {}", addr.db)))?;
        let table = db
            .table(addr.table)
            .ok_or_else(|| EngineError::NotFound(format!("table {}", addr.table)))?;
        let (_, block) = table
            .find_block(addr.block)
            .ok_or_else(|| EngineError::NotFound(format!("block {}", addr)))?;
        Ok(block)
    }

    /// Every object name referenced by a persisted block, dropped or not.
    /// The object GC unlinks whatever the file service holds beyond this set.
    pub fn live_object_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for db in self.databases_vec() {
            for table in db.tables_vec() {
                for segment in table.segments_vec() {
                    for block in segment.blocks_vec() {
                        let data = block.data.read();
                        if let Some(p) = data.as_persisted() {
                            names.push(p.meta_loc.object.clone());
                            if let Some(delta) = &p.delta_loc {
                                names.push(delta.object.clone());
                            }
                        }
                    }
                }
            }
        }
        names
    }

    /// Remove entries deleted at or before `limit` (no live snapshot can
    /// still see them) and prune surviving chains. Returns the object names
    /// freed by removed persisted blocks.
    pub fn sweep_deleted(&self, limit: Timestamp) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut dead_dbs = Vec::new();
        for db in self.databases_vec() {
            if db.id != SYSTEM_DB_ID && deleted_before(&db.chain, limit) {
                for table in db.tables_vec() {
                    collect_table_objects(&table, &mut stats);
                }
                dead_dbs.push((db.id, db.name.clone(), db.tenant));
                stats.removed_entries += 1;
                continue;
            }
            db.chain.write().prune_before(limit);

            let mut dead_tables = Vec::new();
            for table in db.tables_vec() {
                if deleted_before(&table.chain, limit) {
                    collect_table_objects(&table, &mut stats);
                    dead_tables.push((table.id, table.name(), table.tenant));
                    stats.removed_entries += 1;
                    continue;
                }
                table.chain.write().prune_before(limit);
                self.sweep_table(&table, limit, &mut stats);
            }
            for (id, name, tenant) in dead_tables {
                db.remove_table(id);
                db.table_names.write().remove_id(tenant, &name, id);
            }
        }
        for (id, name, tenant) in dead_dbs {
            self.remove_database(id);
            self.db_names.write().remove_id(tenant, &name, id);
        }
        stats
    }

    fn sweep_table(&self, table: &Arc<TableEntry>, limit: Timestamp, stats: &mut SweepStats) {
        for segment in table.segments_vec() {
            if deleted_before(&segment.chain, limit) {
                for block in segment.blocks_vec() {
                    collect_block_objects(&block, stats);
                    stats.removed_entries += 1;
                }
                table.remove_segment(segment.id);
                stats.removed_entries += 1;
                continue;
            }
            segment.chain.write().prune_before(limit);

            let mut dead_blocks = Vec::new();
            for block in segment.blocks_vec() {
                if deleted_before(&block.chain, limit) {
                    collect_block_objects(&block, stats);
                    dead_blocks.push(block.addr.block.offset);
                    stats.removed_entries += 1;
                } else {
                    block.chain.write().prune_before(limit);
                }
            }
            for offset in dead_blocks {
                segment.remove_block(offset);
            }
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn deleted_before(chain: &RwLock<CommitChain>, limit: Timestamp) -> bool {
    chain.read().deleted_at().map(|ts| ts <= limit).unwrap_or(false)
}

fn collect_table_objects(table: &Arc<TableEntry>, stats: &mut SweepStats) {
    for segment in table.segments_vec() {
        for block in segment.blocks_vec() {
            collect_block_objects(&block, stats);
        }
    }
}

fn collect_block_objects(block: &Arc<BlockEntry>, stats: &mut SweepStats) {
    let data = block.data.read();
    if let Some(p) = data.as_persisted() {
        stats.freed_objects.push(p.meta_loc.object.clone());
        if let Some(delta) = &p.delta_loc {
            stats.freed_objects.push(delta.object.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepStats {
    pub removed_entries: usize,
    pub freed_objects: Vec<String>,
}
