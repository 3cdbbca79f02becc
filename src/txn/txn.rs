//! Transaction record and state machine

use super::workspace::Workspace;
use crate::types::{Timestamp, TxnId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Active = 0,
    Preparing = 1,
    Prepared = 2,
    Committed = 3,
    Aborted = 4,
}

impl TxnState {
    fn from_u8(v: u8) -> TxnState {
        match v {
            0 => TxnState::Active,
            1 => TxnState::Preparing,
            2 => TxnState::Prepared,
            3 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

/// How prepare dedups appended keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupType {
    /// Full dedup: committed blocks plus this workspace.
    #[default]
    Normal,
    /// Skip this transaction's own workspace; bulk ingest of pre-deduped
    /// blocks.
    FullSkipWorkspace,
    /// Only probe rows written after the snapshot; snapshot replication with
    /// an explicit start.
    Incremental,
}

/// Session identity attached to every transaction. Tenant 0 is the system
/// tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessInfo {
    pub tenant_id: u32,
    pub user_id: u32,
    pub role_id: u32,
}

impl AccessInfo {
    pub fn for_tenant(tenant_id: u32) -> Self {
        Self { tenant_id, ..Default::default() }
    }
}

pub struct Txn {
    pub id: TxnId,
    pub start_ts: Timestamp,
    pub access: AccessInfo,
    pub dedup: DedupType,

    state: AtomicU8,
    prepare_ts: Mutex<Option<Timestamp>>,
    commit_ts: Mutex<Option<Timestamp>>,

    pub workspace: Mutex<Workspace>,
}

impl Txn {
    pub fn new(id: TxnId, start_ts: Timestamp, access: AccessInfo, dedup: DedupType) -> Self {
        Self {
            id,
            start_ts,
            access,
            dedup,
            state: AtomicU8::new(TxnState::Active as u8),
            prepare_ts: Mutex::new(None),
            commit_ts: Mutex::new(None),
            workspace: Mutex::new(Workspace::new()),
        }
    }

    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// `Active → Preparing`; fails when the txn already left `Active`.
    pub fn begin_prepare(&self) -> bool {
        self.state
            .compare_exchange(
                TxnState::Active as u8,
                TxnState::Preparing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_prepare_ts(&self, ts: Timestamp) {
        *self.prepare_ts.lock() = Some(ts);
    }

    pub fn prepare_ts(&self) -> Option<Timestamp> {
        *self.prepare_ts.lock()
    }

    pub fn set_commit_ts(&self, ts: Timestamp) {
        *self.commit_ts.lock() = Some(ts);
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        *self.commit_ts.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let txn = Txn::new(1, Timestamp::new(10, 0), AccessInfo::default(), DedupType::Normal);
        assert_eq!(txn.state(), TxnState::Active);
        assert!(txn.begin_prepare());
        assert_eq!(txn.state(), TxnState::Preparing);
        // A second prepare attempt fails.
        assert!(!txn.begin_prepare());

        txn.set_state(TxnState::Committed);
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn test_timestamps_ordered() {
        let txn = Txn::new(1, Timestamp::new(10, 0), AccessInfo::default(), DedupType::Normal);
        txn.set_prepare_ts(Timestamp::new(20, 0));
        txn.set_commit_ts(Timestamp::new(21, 0));
        assert!(txn.start_ts < txn.prepare_ts().unwrap());
        assert!(txn.prepare_ts().unwrap() <= txn.commit_ts().unwrap());
    }
}
