//! Background tasks: flush, merge, transfer table, worker loop

pub mod flush;
pub mod merge;
pub mod transfer;
pub mod worker;

pub use flush::Flusher;
pub use merge::Merger;
pub use transfer::{Remap, TransferTable};
pub use worker::Worker;
