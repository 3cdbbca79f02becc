//! Versioned table schema
//!
//! Column identity is the sequence number (`seq_num`), stable across rename,
//! drop and logical reorder; logtail and replay address columns by it, never
//! by position. Every alter bumps `version`; schema versions are immutable
//! once a block has been written under them, so tables keep the whole version
//! history alive and blocks record the version they were written with.

use crate::error::{EngineError, Result};
use crate::types::{ColSeqNum, LogicalType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub typ: LogicalType,
    pub seq_num: ColSeqNum,
    pub nullable: bool,
    pub primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub name: String,

    /// Live columns in logical order.
    pub columns: Vec<ColumnDef>,

    /// Sequence numbers of dropped columns, kept for replay.
    pub dropped_attrs: Vec<ColSeqNum>,

    /// Bumped by every alter.
    pub version: u32,

    /// Consumed by `AddColumn`.
    pub next_col_seqnum: ColSeqNum,

    /// Rows per appendable block of this table.
    pub block_max_rows: u32,

    /// Blocks per segment of this table.
    pub segment_max_blocks: u16,

    /// Whether persisted blocks keep rows sorted on the primary key.
    pub sorted: bool,

    /// Opaque constraint payload, managed by `UpdateConstraint`.
    pub constraint: Vec<u8>,

    pub comment: String,
}

/// Recognized alter-table requests. Each carries the table's current schema
/// version; a stale version fails `WWConflict` at the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AlterRequest {
    RenameTable { old: String, new: String },
    AddColumn { name: String, typ: LogicalType, logical_pos: usize },
    RemoveColumn { logical_pos: usize, seq_num: ColSeqNum },
    UpdateConstraint(Vec<u8>),
    UpdateComment(String),
}

impl Schema {
    /// Schema with the given columns, primary key by name. Capacities default
    /// from the engine config and can be overridden per table.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<(&str, LogicalType)>,
        primary: &str,
        block_max_rows: u32,
        segment_max_blocks: u16,
    ) -> Result<Self> {
        let mut defs = Vec::with_capacity(columns.len());
        let mut pk_seen = false;
        for (seq, (col_name, typ)) in columns.into_iter().enumerate() {
            let is_pk = col_name == primary;
            pk_seen |= is_pk;
            defs.push(ColumnDef {
                name: col_name.to_string(),
                typ,
                seq_num: seq as ColSeqNum,
                nullable: !is_pk,
                primary: is_pk,
            });
        }
        if !pk_seen {
            return Err(EngineError::Internal(format!("primary key column {} missing", primary)));
        }
        let next = defs.len() as ColSeqNum;
        Ok(Self {
            name: name.into(),
            columns: defs,
            dropped_attrs: Vec::new(),
            version: 0,
            next_col_seqnum: next,
            block_max_rows,
            segment_max_blocks,
            sorted: true,
            constraint: Vec::new(),
            comment: String::new(),
        })
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Logical position of the primary key column.
    pub fn pk_pos(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.primary)
    }

    pub fn pk_seqnum(&self) -> Option<ColSeqNum> {
        self.columns.iter().find(|c| c.primary).map(|c| c.seq_num)
    }

    pub fn column_by_seqnum(&self, seq: ColSeqNum) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.seq_num == seq)
    }

    pub fn logical_pos_of(&self, seq: ColSeqNum) -> Option<usize> {
        self.columns.iter().position(|c| c.seq_num == seq)
    }

    /// Sequence numbers in logical order; the physical layout of batches
    /// written under this version.
    pub fn seqnums(&self) -> Vec<ColSeqNum> {
        self.columns.iter().map(|c| c.seq_num).collect()
    }

    /// Apply an alter, producing the next schema version.
    pub fn apply_alter(&self, req: &AlterRequest) -> Result<Schema> {
        let mut next = self.clone();
        next.version += 1;
        match req {
            AlterRequest::RenameTable { old, new } => {
                if *old != self.name {
                    return Err(EngineError::NotFound(format!("table name {}", old)));
                }
                next.name = new.clone();
            }
            AlterRequest::AddColumn { name, typ, logical_pos } => {
                if self.columns.iter().any(|c| c.name == *name) {
                    return Err(EngineError::DuplicateEntry(format!("column {}", name)));
                }
                let pos = (*logical_pos).min(next.columns.len());
                next.columns.insert(
                    pos,
                    ColumnDef {
                        name: name.clone(),
                        typ: *typ,
                        seq_num: next.next_col_seqnum,
                        nullable: true,
                        primary: false,
                    },
                );
                next.next_col_seqnum += 1;
            }
            AlterRequest::RemoveColumn { logical_pos, seq_num } => {
                let def = next
                    .columns
                    .get(*logical_pos)
                    .ok_or_else(|| EngineError::NotFound(format!("column at {}", logical_pos)))?;
                if def.seq_num != *seq_num {
                    return Err(EngineError::WWConflict(format!(
                        "column at {} has seqnum {}, expected {}",
                        logical_pos, def.seq_num, seq_num
                    )));
                }
                if def.primary {
                    return Err(EngineError::Internal("cannot drop primary key column".into()));
                }
                next.columns.remove(*logical_pos);
                next.dropped_attrs.push(*seq_num);
            }
            AlterRequest::UpdateConstraint(bytes) => {
                next.constraint = bytes.clone();
            }
            AlterRequest::UpdateComment(comment) => {
                next.comment = comment.clone();
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::new(
            "t1",
            vec![("pk", LogicalType::Int32), ("v", LogicalType::Int64)],
            "pk",
            10,
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_new_assigns_seqnums() {
        let schema = sample();
        assert_eq!(schema.pk_pos(), Some(0));
        assert_eq!(schema.seqnums(), vec![0, 1]);
        assert_eq!(schema.next_col_seqnum, 2);
        assert!(!schema.columns[0].nullable);
    }

    #[test]
    fn test_add_column_consumes_seqnum() {
        let schema = sample();
        let altered = schema
            .apply_alter(&AlterRequest::AddColumn {
                name: "extra".into(),
                typ: LogicalType::Varchar,
                logical_pos: 1,
            })
            .unwrap();
        assert_eq!(altered.version, 1);
        assert_eq!(altered.columns[1].name, "extra");
        assert_eq!(altered.columns[1].seq_num, 2);
        assert_eq!(altered.next_col_seqnum, 3);
        // Logical position decoupled from seqnum: column at pos 1 has seq 2.
        assert_eq!(altered.logical_pos_of(1), Some(2));
    }

    #[test]
    fn test_remove_column_records_dropped_attr() {
        let schema = sample();
        let altered = schema
            .apply_alter(&AlterRequest::RemoveColumn { logical_pos: 1, seq_num: 1 })
            .unwrap();
        assert_eq!(altered.columns.len(), 1);
        assert_eq!(altered.dropped_attrs, vec![1]);
        assert_eq!(altered.version, 1);
    }

    #[test]
    fn test_remove_column_seqnum_mismatch() {
        let schema = sample();
        let err = schema
            .apply_alter(&AlterRequest::RemoveColumn { logical_pos: 1, seq_num: 9 })
            .unwrap_err();
        assert!(matches!(err, EngineError::WWConflict(_)));
    }

    #[test]
    fn test_rename_table() {
        let schema = sample();
        let renamed = schema
            .apply_alter(&AlterRequest::RenameTable { old: "t1".into(), new: "t2".into() })
            .unwrap();
        assert_eq!(renamed.name, "t2");
        assert_eq!(renamed.version, 1);
    }

    #[test]
    fn test_drop_pk_rejected() {
        let schema = sample();
        let err = schema
            .apply_alter(&AlterRequest::RemoveColumn { logical_pos: 0, seq_num: 0 })
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
