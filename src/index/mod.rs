//! Block index summaries: zonemap, bloom filter, primary-key index

pub mod bloom;
pub mod pk_index;
pub mod zonemap;

pub use bloom::BloomFilter;
pub use pk_index::PkIndex;
pub use zonemap::ZoneMap;
