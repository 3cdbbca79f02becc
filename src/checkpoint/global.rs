//! Global checkpoint snapshot
//!
//! A self-contained image of the catalog and block state as of a timestamp,
//! folded from a run of incremental checkpoints. Restart loads the newest
//! global snapshot first, then replays later incrementals and the WAL tail.

use crate::catalog::{
    BlockEntry, Catalog, CommitChain, DatabaseEntry, SegmentEntry, TableEntry, SYSTEM_DB_ID,
};
use crate::data::{AppendNode, AppendableData, Batch, BlockData, DeleteChain, PersistedData};
use crate::error::{EngineError, Result};
use crate::fs::Location;
use crate::schema::Schema;
use crate::types::{BlockAddr, BlockId, DatabaseId, SegmentId, Sequence, TableId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    pub end: Timestamp,
    pub databases: Vec<DbSnap>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DbSnap {
    pub id: DatabaseId,
    pub name: String,
    pub tenant: u32,
    pub chain: CommitChain,
    pub tables: Vec<TableSnap>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableSnap {
    pub id: TableId,
    pub tenant: u32,
    pub schemas: Vec<Schema>,
    pub chain: CommitChain,
    pub segments: Vec<SegSnap>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SegSnap {
    pub id: SegmentId,
    pub appendable: bool,
    pub sorted: bool,
    pub chain: CommitChain,
    pub blocks: Vec<BlockSnap>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockSnap {
    pub offset: u16,
    pub schema_version: u32,
    pub chain: CommitChain,
    pub state: BlockSnapState,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum BlockSnapState {
    Appendable { batch: Batch, appends: Vec<AppendNode>, deletes: DeleteChain },
    Persisted {
        meta_loc: Location,
        delta_loc: Option<Location>,
        row_count: u32,
        deletes: DeleteChain,
    },
}

/// Serialize the whole catalog (system database excluded; it is rebuilt by
/// bootstrap) into a snapshot stamped `end`.
pub fn snapshot_catalog(catalog: &Catalog, end: Timestamp) -> GlobalSnapshot {
    let mut databases = Vec::new();
    for db in catalog.databases_vec() {
        if db.id == SYSTEM_DB_ID {
            continue;
        }
        let mut tables = Vec::new();
        for table in db.tables_vec() {
            let mut segments = Vec::new();
            for segment in table.segments_vec() {
                let mut blocks = Vec::new();
                for block in segment.blocks_vec() {
                    let state = {
                        let data = block.data.read();
                        match &*data {
                            BlockData::Appendable(a) => BlockSnapState::Appendable {
                                batch: a.batch().clone(),
                                appends: a.append_nodes().to_vec(),
                                deletes: a.deletes.clone(),
                            },
                            BlockData::Persisted(p) => BlockSnapState::Persisted {
                                meta_loc: p.meta_loc.clone(),
                                delta_loc: p.delta_loc.clone(),
                                row_count: p.row_count,
                                deletes: p.deletes.clone(),
                            },
                        }
                    };
                    blocks.push(BlockSnap {
                        offset: block.addr.block.offset,
                        schema_version: block.schema_version,
                        chain: block.chain.read().clone(),
                        state,
                    });
                }
                segments.push(SegSnap {
                    id: segment.id,
                    appendable: segment.appendable,
                    sorted: segment.sorted,
                    chain: segment.chain.read().clone(),
                    blocks,
                });
            }
            let schemas = {
                let mut all = Vec::new();
                let mut version = 0;
                while let Some(schema) = table.schema_at(version) {
                    all.push(schema.as_ref().clone());
                    version += 1;
                }
                all
            };
            tables.push(TableSnap {
                id: table.id,
                tenant: table.tenant,
                schemas,
                chain: table.chain.read().clone(),
                segments,
            });
        }
        databases.push(DbSnap {
            id: db.id,
            name: db.name.clone(),
            tenant: db.tenant,
            chain: db.chain.read().clone(),
            tables,
        });
    }
    GlobalSnapshot { end, databases }
}

/// Rebuild a catalog from a snapshot. The catalog must be freshly
/// bootstrapped; ids and name slots are re-derived from the entry chains.
pub fn restore_catalog(catalog: &Catalog, seq: &Sequence, snap: &GlobalSnapshot) -> Result<()> {
    for db_snap in &snap.databases {
        seq.observe_database_id(db_snap.id);
        let db = DatabaseEntry::new(db_snap.id, db_snap.name.clone(), db_snap.tenant);
        *db.chain.write() = db_snap.chain.clone();
        if let Some(created) = db_snap.chain.created_at() {
            catalog.db_names.write().insert(db_snap.tenant, &db_snap.name, db_snap.id, created);
            if let Some(dropped) = db_snap.chain.deleted_at() {
                catalog.db_names.write().mark_dropped(db_snap.tenant, &db_snap.name, db_snap.id, dropped);
            }
        }

        for table_snap in &db_snap.tables {
            seq.observe_table_id(table_snap.id);
            let first = table_snap
                .schemas
                .first()
                .ok_or_else(|| EngineError::Corruption("table snapshot without schema".into()))?;
            let table =
                TableEntry::new(table_snap.id, db_snap.id, table_snap.tenant, Arc::new(first.clone()));
            for schema in &table_snap.schemas[1..] {
                table.push_schema(Arc::new(schema.clone()))?;
            }
            *table.chain.write() = table_snap.chain.clone();

            // Rebuild name history: creation under the original name, then
            // renames in version order, then the drop.
            if let Some(created) = table_snap.chain.created_at() {
                let mut names = db.table_names.write();
                names.insert(table_snap.tenant, &first.name, table_snap.id, created);
                let mut prev = first.name.clone();
                for schema in &table_snap.schemas[1..] {
                    if schema.name != prev {
                        names.mark_dropped(table_snap.tenant, &prev, table_snap.id, created);
                        names.insert(table_snap.tenant, &schema.name, table_snap.id, created);
                        prev = schema.name.clone();
                    }
                }
                if let Some(dropped) = table_snap.chain.deleted_at() {
                    names.mark_dropped(table_snap.tenant, &prev, table_snap.id, dropped);
                }
            }

            for seg_snap in &table_snap.segments {
                let segment = SegmentEntry::new(
                    seg_snap.id,
                    table_snap.id,
                    db_snap.id,
                    seg_snap.appendable,
                    seg_snap.sorted,
                );
                *segment.chain.write() = seg_snap.chain.clone();
                for block_snap in &seg_snap.blocks {
                    let addr = BlockAddr::new(
                        db_snap.id,
                        table_snap.id,
                        BlockId::new(seg_snap.id, block_snap.offset),
                    );
                    let block = match &block_snap.state {
                        BlockSnapState::Appendable { batch, appends, deletes } => {
                            let schema = table
                                .schema_at(block_snap.schema_version)
                                .ok_or_else(|| {
                                    EngineError::Corruption("block references unknown schema".into())
                                })?;
                            let data = AppendableData::from_parts(
                                schema.clone(),
                                batch.clone(),
                                appends.clone(),
                                deletes.clone(),
                            );
                            let entry = BlockEntry::new_appendable(addr, schema);
                            *entry.data.write() = BlockData::Appendable(data);
                            entry
                        }
                        BlockSnapState::Persisted { meta_loc, delta_loc, row_count, deletes } => {
                            let mut data =
                                PersistedData::new(meta_loc.clone(), *row_count, block_snap.schema_version);
                            data.delta_loc = delta_loc.clone();
                            data.deletes = deletes.clone();
                            BlockEntry::new_persisted(addr, block_snap.schema_version, data)
                        }
                    };
                    *block.chain.write() = block_snap.chain.clone();
                    segment.insert_block(block);
                }
                table.insert_segment(segment);
            }
            db.insert_table(table);
        }
        catalog.insert_database(db);
    }
    Ok(())
}
