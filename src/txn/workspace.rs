//! Transaction workspace
//!
//! Everything a transaction has written but not committed: DDL intents in
//! order, and per-table data writes (appended rows, deletes against
//! committed blocks, deletes of its own appended rows). Nothing here is
//! visible to other transactions; commit turns the workspace into a prepared
//! record and applies it.

use crate::schema::{AlterRequest, Schema};
use crate::types::{BlockId, DatabaseId, TableId, Value};
use ahash::AHashMap;
use roaring::RoaringBitmap;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data::Batch;

#[derive(Debug, Clone)]
pub enum WsCatalogOp {
    CreateDatabase { id: DatabaseId, name: String },
    DropDatabase { id: DatabaseId, name: String },
    CreateTable { db: DatabaseId, id: TableId, schema: Arc<Schema> },
    DropTable { db: DatabaseId, id: TableId, name: String },
    Alter { db: DatabaseId, table: TableId, req: AlterRequest, new_schema: Arc<Schema> },
}

/// Per-table data writes.
#[derive(Debug)]
pub struct TableWrites {
    /// Schema the appended batch is shaped by.
    pub schema: Arc<Schema>,

    pub appends: Batch,

    /// Workspace rows deleted again before commit. They are still applied at
    /// commit, immediately followed by their delete, leaving phantoms.
    pub append_dead: RoaringBitmap,

    /// Deletes against committed blocks.
    pub deletes: AHashMap<BlockId, RoaringBitmap>,
}

impl TableWrites {
    fn new(schema: Arc<Schema>) -> Self {
        let appends = Batch::empty_like(&schema);
        Self { schema, appends, append_dead: RoaringBitmap::new(), deletes: AHashMap::new() }
    }

    pub fn has_appends(&self) -> bool {
        self.appends.row_count() > 0
    }

    /// Newest live workspace row holding `key`.
    pub fn find_live(&self, key: &Value) -> Option<u32> {
        let pk_pos = self.schema.pk_pos()?;
        let col = self.appends.column(pk_pos)?;
        (0..col.len() as u32)
            .rev()
            .find(|row| !self.append_dead.contains(*row) && col.values[*row as usize] == *key)
    }

    pub fn live_row_count(&self) -> u32 {
        self.appends.row_count() - self.append_dead.len() as u32
    }

    /// Live workspace rows, ascending.
    pub fn live_rows(&self) -> Vec<u32> {
        (0..self.appends.row_count()).filter(|r| !self.append_dead.contains(*r)).collect()
    }
}

#[derive(Debug, Default)]
pub struct Workspace {
    pub ddl: Vec<WsCatalogOp>,

    /// Ordered for deterministic record layout.
    pub writes: BTreeMap<(DatabaseId, TableId), TableWrites>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ddl.is_empty() && self.writes.values().all(|w| !w.has_appends() && w.deletes.is_empty() && w.append_dead.is_empty())
    }

    /// Resolve a database name against this workspace's DDL, last op wins.
    /// `Some(Some(id))`: created here. `Some(None)`: dropped here. `None`:
    /// the workspace says nothing.
    pub fn resolve_db_name(&self, name: &str) -> Option<Option<DatabaseId>> {
        for op in self.ddl.iter().rev() {
            match op {
                WsCatalogOp::CreateDatabase { id, name: n } if n == name => {
                    return Some(Some(*id))
                }
                WsCatalogOp::DropDatabase { name: n, .. } if n == name => return Some(None),
                _ => {}
            }
        }
        None
    }

    pub fn resolve_table_name(&self, db: DatabaseId, name: &str) -> Option<Option<TableId>> {
        for op in self.ddl.iter().rev() {
            match op {
                WsCatalogOp::CreateTable { db: d, id, schema } if *d == db && schema.name == name => {
                    return Some(Some(*id))
                }
                WsCatalogOp::DropTable { db: d, name: n, .. } if *d == db && n == name => {
                    return Some(None)
                }
                WsCatalogOp::Alter { db: d, new_schema, table, .. }
                    if *d == db && new_schema.name == name =>
                {
                    return Some(Some(*table))
                }
                _ => {}
            }
        }
        None
    }

    /// Latest schema this workspace has produced for a table, through
    /// creation and alters.
    pub fn pending_schema(&self, db: DatabaseId, table: TableId) -> Option<Arc<Schema>> {
        for op in self.ddl.iter().rev() {
            match op {
                WsCatalogOp::CreateTable { db: d, id, schema } if *d == db && *id == table => {
                    return Some(schema.clone())
                }
                WsCatalogOp::Alter { db: d, table: t, new_schema, .. }
                    if *d == db && *t == table =>
                {
                    return Some(new_schema.clone())
                }
                _ => {}
            }
        }
        None
    }

    pub fn is_table_created_here(&self, db: DatabaseId, table: TableId) -> bool {
        self.ddl
            .iter()
            .any(|op| matches!(op, WsCatalogOp::CreateTable { db: d, id, .. } if *d == db && *id == table))
    }

    pub fn is_table_dropped_here(&self, db: DatabaseId, table: TableId) -> bool {
        self.ddl
            .iter()
            .rev()
            .find_map(|op| match op {
                WsCatalogOp::DropTable { db: d, id, .. } if *d == db && *id == table => Some(true),
                WsCatalogOp::CreateTable { db: d, id, .. } if *d == db && *id == table => {
                    Some(false)
                }
                _ => None,
            })
            .unwrap_or(false)
    }

    pub fn writes_mut(&mut self, db: DatabaseId, table: TableId, schema: Arc<Schema>) -> &mut TableWrites {
        self.writes.entry((db, table)).or_insert_with(|| TableWrites::new(schema))
    }

    pub fn writes_of(&self, db: DatabaseId, table: TableId) -> Option<&TableWrites> {
        self.writes.get(&(db, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnVector, LogicalType};

    fn schema(name: &str) -> Arc<Schema> {
        Arc::new(Schema::new(name, vec![("pk", LogicalType::Int32)], "pk", 10, 2).unwrap())
    }

    #[test]
    fn test_name_resolution_last_op_wins() {
        let mut ws = Workspace::new();
        ws.ddl.push(WsCatalogOp::CreateTable { db: 1, id: 10, schema: schema("t1") });
        assert_eq!(ws.resolve_table_name(1, "t1"), Some(Some(10)));

        ws.ddl.push(WsCatalogOp::DropTable { db: 1, id: 10, name: "t1".into() });
        assert_eq!(ws.resolve_table_name(1, "t1"), Some(None));
        assert!(ws.is_table_dropped_here(1, 10));

        ws.ddl.push(WsCatalogOp::CreateTable { db: 1, id: 11, schema: schema("t1") });
        assert_eq!(ws.resolve_table_name(1, "t1"), Some(Some(11)));
    }

    #[test]
    fn test_pending_schema_follows_alters() {
        let mut ws = Workspace::new();
        ws.ddl.push(WsCatalogOp::CreateTable { db: 1, id: 10, schema: schema("t1") });
        let altered = Arc::new(
            schema("t1")
                .apply_alter(&AlterRequest::UpdateComment("c".into()))
                .unwrap(),
        );
        ws.ddl.push(WsCatalogOp::Alter {
            db: 1,
            table: 10,
            req: AlterRequest::UpdateComment("c".into()),
            new_schema: altered.clone(),
        });
        assert_eq!(ws.pending_schema(1, 10).unwrap().version, 1);
    }

    #[test]
    fn test_find_live_skips_dead_rows() {
        let mut ws = Workspace::new();
        let writes = ws.writes_mut(1, 10, schema("t1"));
        writes
            .appends
            .extend_from(
                &Batch::new(vec![ColumnVector::from_values(
                    LogicalType::Int32,
                    vec![Value::Int32(7), Value::Int32(8), Value::Int32(7)],
                )])
                .unwrap(),
            )
            .unwrap();
        // Newest wins.
        assert_eq!(writes.find_live(&Value::Int32(7)), Some(2));
        writes.append_dead.insert(2);
        assert_eq!(writes.find_live(&Value::Int32(7)), Some(0));
        assert_eq!(writes.live_row_count(), 2);
    }
}
