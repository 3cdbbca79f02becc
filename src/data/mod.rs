//! Block data: column batches, delete chains, appendable and persisted state

pub mod appendable;
pub mod batch;
pub mod deletes;
pub mod persisted;
pub mod view;

pub use appendable::{AppendNode, AppendableData};
pub use batch::Batch;
pub use deletes::{DeleteChain, DeleteNode};
pub use persisted::{
    write_block_object, write_delta_object, BlockReader, DecodedBlock, DeltaDeletes, DeltaEntry,
    PersistedData,
};
pub use view::ColumnView;

/// The two states of a block's data. An appendable block becomes persisted
/// through a flush task; the variant is swapped atomically under the block
/// write lock.
#[derive(Debug)]
pub enum BlockData {
    Appendable(AppendableData),
    Persisted(PersistedData),
}

impl BlockData {
    pub fn is_appendable(&self) -> bool {
        matches!(self, BlockData::Appendable(_))
    }

    pub fn as_appendable(&self) -> Option<&AppendableData> {
        match self {
            BlockData::Appendable(data) => Some(data),
            BlockData::Persisted(_) => None,
        }
    }

    pub fn as_appendable_mut(&mut self) -> Option<&mut AppendableData> {
        match self {
            BlockData::Appendable(data) => Some(data),
            BlockData::Persisted(_) => None,
        }
    }

    pub fn as_persisted(&self) -> Option<&PersistedData> {
        match self {
            BlockData::Persisted(data) => Some(data),
            BlockData::Appendable(_) => None,
        }
    }

    pub fn as_persisted_mut(&mut self) -> Option<&mut PersistedData> {
        match self {
            BlockData::Persisted(data) => Some(data),
            BlockData::Appendable(_) => None,
        }
    }

    pub fn deletes(&self) -> &DeleteChain {
        match self {
            BlockData::Appendable(data) => &data.deletes,
            BlockData::Persisted(data) => &data.deletes,
        }
    }

    pub fn deletes_mut(&mut self) -> &mut DeleteChain {
        match self {
            BlockData::Appendable(data) => &mut data.deletes,
            BlockData::Persisted(data) => &mut data.deletes,
        }
    }
}
