//! Per-entry commit chain
//!
//! Every catalog entry (database, table, segment, block) carries an ordered
//! list of commit records. The list is owned by the entry and ordered oldest
//! to newest; visibility scans iterate in reverse. A node is pending until
//! its transaction commits and fills `commit_ts`; pending nodes are visible
//! only to their own transaction.

use crate::error::{EngineError, Result};
use crate::types::{Timestamp, TxnId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryOp {
    Create,
    UpgradeFull,
    UpgradeClose,
    UpgradeSorted,
    SoftDelete,
    HardDelete,
}

impl EntryOp {
    pub fn is_delete(&self) -> bool {
        matches!(self, EntryOp::SoftDelete | EntryOp::HardDelete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitInfo {
    pub tran_id: TxnId,

    /// `None` while the owning transaction is still in flight.
    pub commit_ts: Option<Timestamp>,

    pub op: EntryOp,

    /// WAL index of the record that produced this node, when known.
    pub prev_index: Option<u64>,
}

/// What a snapshot sees of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Alive: name and id lookups both find it.
    Visible,
    /// Soft-deleted: hidden from name lookups, still reachable by id.
    Dropped,
    /// Never created at this snapshot, or hard-deleted.
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CommitChain {
    nodes: Vec<CommitInfo>,
}

impl CommitChain {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Chain with a single already-committed node; used by replay and the
    /// system catalog bootstrap.
    pub fn committed(tran_id: TxnId, ts: Timestamp, op: EntryOp) -> Self {
        Self {
            nodes: vec![CommitInfo { tran_id, commit_ts: Some(ts), op, prev_index: None }],
        }
    }

    pub fn push_pending(&mut self, tran_id: TxnId, op: EntryOp) {
        self.nodes.push(CommitInfo { tran_id, commit_ts: None, op, prev_index: None });
    }

    pub fn push_committed(&mut self, tran_id: TxnId, ts: Timestamp, op: EntryOp, lsn: Option<u64>) {
        self.nodes.push(CommitInfo { tran_id, commit_ts: Some(ts), op, prev_index: lsn });
    }

    /// Fill `commit_ts` on every pending node of `tran_id`.
    pub fn commit(&mut self, tran_id: TxnId, ts: Timestamp, lsn: Option<u64>) {
        for node in self.nodes.iter_mut() {
            if node.commit_ts.is_none() && node.tran_id == tran_id {
                node.commit_ts = Some(ts);
                node.prev_index = lsn;
            }
        }
    }

    /// Drop every pending node of `tran_id`. Returns true when the chain is
    /// empty afterwards (the entry itself should be removed).
    pub fn abort(&mut self, tran_id: TxnId) -> bool {
        self.nodes.retain(|n| !(n.commit_ts.is_none() && n.tran_id == tran_id));
        self.nodes.is_empty()
    }

    /// Newest node a snapshot can see: committed at or before `snapshot`, or
    /// pending and owned by `self_txn`.
    pub fn visible_node(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Option<&CommitInfo> {
        self.nodes.iter().rev().find(|n| match n.commit_ts {
            Some(ts) => ts <= snapshot,
            None => Some(n.tran_id) == self_txn,
        })
    }

    pub fn visibility(&self, snapshot: Timestamp, self_txn: Option<TxnId>) -> Visibility {
        match self.visible_node(snapshot, self_txn) {
            None => Visibility::Absent,
            Some(node) => match node.op {
                EntryOp::HardDelete => Visibility::Absent,
                EntryOp::SoftDelete => Visibility::Dropped,
                _ => Visibility::Visible,
            },
        }
    }

    /// Write-write check on prepare: the entry must not have been touched by
    /// anything this transaction cannot see.
    pub fn check_ww(&self, start_ts: Timestamp, tran_id: TxnId) -> Result<()> {
        for node in self.nodes.iter().rev() {
            match node.commit_ts {
                Some(ts) if ts > start_ts => {
                    return Err(EngineError::WWConflict(format!(
                        "entry changed at {} after txn start {}",
                        ts, start_ts
                    )));
                }
                None if node.tran_id != tran_id => {
                    return Err(EngineError::WWConflict(format!(
                        "entry has uncommitted change from txn {}",
                        node.tran_id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Commit timestamp of the oldest committed `Create`.
    pub fn created_at(&self) -> Option<Timestamp> {
        self.nodes
            .iter()
            .find(|n| n.op == EntryOp::Create && n.commit_ts.is_some())
            .and_then(|n| n.commit_ts)
    }

    /// Commit timestamp of the newest committed delete.
    pub fn deleted_at(&self) -> Option<Timestamp> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.op.is_delete() && n.commit_ts.is_some())
            .and_then(|n| n.commit_ts)
    }

    /// True when the newest committed node is a `HardDelete` at or before
    /// `ts`; such entries are candidates for catalog GC.
    pub fn hard_deleted_before(&self, ts: Timestamp) -> bool {
        matches!(
            self.nodes.iter().rev().find(|n| n.commit_ts.is_some()),
            Some(CommitInfo { op: EntryOp::HardDelete, commit_ts: Some(cts), .. }) if *cts <= ts
        )
    }

    pub fn has_commit_after(&self, ts: Timestamp) -> bool {
        self.nodes.iter().any(|n| matches!(n.commit_ts, Some(cts) if cts > ts))
    }

    /// Does this chain already hold a committed node at exactly `ts`?
    /// Replay uses this to stay idempotent.
    pub fn has_commit_at(&self, ts: Timestamp) -> bool {
        self.nodes.iter().any(|n| n.commit_ts == Some(ts))
    }

    /// Finer replay guard: a committed node with this exact op at `ts`.
    pub fn has_op_at(&self, ts: Timestamp, op: EntryOp) -> bool {
        self.nodes.iter().any(|n| n.commit_ts == Some(ts) && n.op == op)
    }

    /// Drop committed nodes older than the newest node at or before `ts`.
    /// Safe once no live snapshot is older than `ts`.
    pub fn prune_before(&mut self, ts: Timestamp) {
        let keep_from = self
            .nodes
            .iter()
            .rposition(|n| matches!(n.commit_ts, Some(cts) if cts <= ts))
            .unwrap_or(0);
        if keep_from > 0 {
            self.nodes.drain(..keep_from);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CommitInfo] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: i64) -> Timestamp {
        Timestamp::new(n, 0)
    }

    #[test]
    fn test_pending_visible_only_to_owner() {
        let mut chain = CommitChain::new();
        chain.push_pending(7, EntryOp::Create);
        assert_eq!(chain.visibility(ts(100), Some(7)), Visibility::Visible);
        assert_eq!(chain.visibility(ts(100), Some(8)), Visibility::Absent);
        assert_eq!(chain.visibility(ts(100), None), Visibility::Absent);
    }

    #[test]
    fn test_commit_makes_visible_at_snapshot() {
        let mut chain = CommitChain::new();
        chain.push_pending(7, EntryOp::Create);
        chain.commit(7, ts(10), Some(1));
        assert_eq!(chain.visibility(ts(9), None), Visibility::Absent);
        assert_eq!(chain.visibility(ts(10), None), Visibility::Visible);
        assert_eq!(chain.created_at(), Some(ts(10)));
    }

    #[test]
    fn test_soft_delete_dropped_vs_hard_delete_absent() {
        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_committed(2, ts(20), EntryOp::SoftDelete, None);
        assert_eq!(chain.visibility(ts(15), None), Visibility::Visible);
        assert_eq!(chain.visibility(ts(20), None), Visibility::Dropped);

        chain.push_committed(3, ts(30), EntryOp::HardDelete, None);
        assert_eq!(chain.visibility(ts(30), None), Visibility::Absent);
        // Older snapshots still see the older states.
        assert_eq!(chain.visibility(ts(15), None), Visibility::Visible);
        assert_eq!(chain.deleted_at(), Some(ts(30)));
    }

    #[test]
    fn test_ww_conflict_on_newer_commit() {
        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_committed(2, ts(20), EntryOp::SoftDelete, None);
        assert!(chain.check_ww(ts(15), 3).is_err());
        assert!(chain.check_ww(ts(20), 3).is_ok());
    }

    #[test]
    fn test_ww_conflict_on_foreign_pending() {
        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_pending(2, EntryOp::SoftDelete);
        assert!(chain.check_ww(ts(50), 3).is_err());
        // The owner itself passes.
        assert!(chain.check_ww(ts(50), 2).is_ok());
    }

    #[test]
    fn test_abort_removes_pending() {
        let mut chain = CommitChain::new();
        chain.push_pending(5, EntryOp::Create);
        assert!(chain.abort(5));
        assert!(chain.is_empty());

        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_pending(5, EntryOp::SoftDelete);
        assert!(!chain.abort(5));
        assert_eq!(chain.visibility(ts(10), None), Visibility::Visible);
    }

    #[test]
    fn test_prune_keeps_visible_state() {
        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_committed(2, ts(20), EntryOp::UpgradeFull, None);
        chain.push_committed(3, ts(30), EntryOp::SoftDelete, None);
        chain.prune_before(ts(25));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.visibility(ts(25), None), Visibility::Visible);
        assert_eq!(chain.visibility(ts(30), None), Visibility::Dropped);
    }

    #[test]
    fn test_hard_deleted_before() {
        let mut chain = CommitChain::committed(1, ts(10), EntryOp::Create);
        chain.push_committed(2, ts(20), EntryOp::HardDelete, None);
        assert!(chain.hard_deleted_before(ts(20)));
        assert!(!chain.hard_deleted_before(ts(19)));
    }
}
