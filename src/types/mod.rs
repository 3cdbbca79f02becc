//! Core identifier, timestamp and value types

pub mod id;
pub mod sequence;
pub mod timestamp;
pub mod value;

pub use id::{
    pack_rowid, unpack_rowid, BlockAddr, BlockId, ColSeqNum, DatabaseId, SegmentId, TableId, TxnId,
};
pub use sequence::Sequence;
pub use timestamp::{Timestamp, TsAllocator};
pub use value::{ColumnVector, LogicalType, Value};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation handle. Long operations (flush, merge,
/// checkpoint) check it between blocks.
#[derive(Clone, Default)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}
