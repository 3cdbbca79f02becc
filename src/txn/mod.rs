//! MVCC transactions: snapshot isolation over the catalog and block data

pub mod manager;
pub mod txn;
pub mod workspace;

pub use manager::{RowRef, TxnMgr, TxnStats};
pub use txn::{AccessInfo, DedupType, Txn, TxnState};
pub use workspace::{TableWrites, Workspace, WsCatalogOp};
