//! Persisted (non-appendable) block data
//!
//! Column bytes live in an immutable object behind the file service:
//!
//! ```text
//! [col 0 extent][col 1 extent]…[zonemap][bloom][footer][footer_len u32][crc u32]
//! ```
//!
//! Extents are Snappy-compressed bincode column vectors; the footer records
//! every extent plus row count, schema version and the physical seqnum
//! layout. Later deletes never touch the object: they land in the block's
//! in-memory delete chain and are flushed to a delta-delete object
//! (`{rowid, commit_ts, aborted, pk}`), merged again at read time.

use super::batch::Batch;
use super::deletes::DeleteChain;
use super::view::ColumnView;
use crate::config::BloomConfig;
use crate::error::{EngineError, Result};
use crate::fs::{Extent, FileService, Location};
use crate::index::{BloomFilter, PkIndex, ZoneMap};
use crate::schema::Schema;
use crate::types::{pack_rowid, BlockId, ColSeqNum, ColumnVector, LogicalType, Timestamp, Value};
use lru::LruCache;
use parking_lot::Mutex;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;

const FOOTER_MAGIC: u32 = 0x42534C54; // "BSLT"
const BLOCK_CACHE_CAP: usize = 256;
const DELTA_CACHE_CAP: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct Footer {
    magic: u32,
    col_extents: Vec<Extent>,
    zonemap_extent: Extent,
    bloom_extent: Extent,
    row_count: u32,
    schema_version: u32,
    /// Physical column layout: seqnum per stored column.
    seqnums: Vec<ColSeqNum>,
    pk_pos: u16,
}

/// Catalog-resident state of a persisted block.
#[derive(Debug, Clone)]
pub struct PersistedData {
    pub meta_loc: Location,
    pub delta_loc: Option<Location>,
    pub row_count: u32,
    pub schema_version: u32,

    /// Deletes committed since the last delta flush.
    pub deletes: DeleteChain,
}

impl PersistedData {
    pub fn new(meta_loc: Location, row_count: u32, schema_version: u32) -> Self {
        Self { meta_loc, delta_loc: None, row_count, schema_version, deletes: DeleteChain::new() }
    }

    pub fn delete_mask_at(&self, delta: Option<&DeltaDeletes>, snapshot: Timestamp) -> RoaringBitmap {
        let mut mask = self.deletes.mask_at(snapshot);
        if let Some(delta) = delta {
            mask |= delta.mask_at(snapshot);
        }
        mask
    }

    pub fn live_count(&self, delta: Option<&DeltaDeletes>, snapshot: Timestamp) -> u32 {
        self.row_count - self.delete_mask_at(delta, snapshot).len() as u32
    }
}

/// Fully decoded block object, shared through the read cache.
#[derive(Debug)]
pub struct DecodedBlock {
    pub columns: Vec<ColumnVector>,
    pub zonemap: ZoneMap,
    pub bloom: BloomFilter,
    pub row_count: u32,
    pub schema_version: u32,
    pub seqnums: Vec<ColSeqNum>,
    pub pk_pos: usize,
    pub pk: PkIndex,
}

impl DecodedBlock {
    pub fn column_by_seqnum(&self, seq: ColSeqNum) -> Option<&ColumnVector> {
        self.seqnums.iter().position(|s| *s == seq).and_then(|pos| self.columns.get(pos))
    }

    pub fn pk_column(&self) -> &ColumnVector {
        &self.columns[self.pk_pos]
    }
}

/// Decoded delta-delete payload.
#[derive(Debug, Clone, Default)]
pub struct DeltaDeletes {
    pub entries: Vec<DeltaEntry>,
}

#[derive(Debug, Clone)]
pub struct DeltaEntry {
    pub row: u32,
    pub commit_ts: Timestamp,
    pub aborted: bool,
    pub pk: Value,
}

impl DeltaDeletes {
    pub fn mask_at(&self, snapshot: Timestamp) -> RoaringBitmap {
        self.entries
            .iter()
            .filter(|e| !e.aborted && e.commit_ts <= snapshot)
            .map(|e| e.row)
            .collect()
    }

    pub fn max_ts(&self) -> Option<Timestamp> {
        self.entries.iter().filter(|e| !e.aborted).map(|e| e.commit_ts).max()
    }
}

/// Write one block object. The batch must be laid out per `schema`.
pub fn write_block_object(
    fs: &dyn FileService,
    name: &str,
    batch: &Batch,
    schema: &Schema,
    bloom_config: BloomConfig,
) -> Result<Location> {
    let pk_pos = schema
        .pk_pos()
        .ok_or_else(|| EngineError::Internal("persisted block requires a primary key".into()))?;

    let compressed: Vec<Vec<u8>> = batch
        .columns
        .par_iter()
        .map(|col| -> Result<Vec<u8>> {
            let raw = bincode::serialize(col)?;
            Ok(snap::raw::Encoder::new().compress_vec(&raw)?)
        })
        .collect::<Result<Vec<_>>>()?;

    let pk_col = batch
        .column(pk_pos)
        .ok_or_else(|| EngineError::Internal("pk column missing from batch".into()))?;
    let zonemap = ZoneMap::from_keys(pk_col.values.iter());
    let key_bytes: Vec<Vec<u8>> = pk_col.values.iter().map(Value::key_bytes).collect();
    let bloom = BloomFilter::from_keys(
        key_bytes.iter().map(|k| k.as_slice()),
        key_bytes.len(),
        bloom_config.bits_per_key,
    );

    let mut body = Vec::new();
    let mut col_extents = Vec::with_capacity(compressed.len());
    for bytes in &compressed {
        col_extents.push(Extent::new(body.len() as u64, bytes.len() as u64));
        body.extend_from_slice(bytes);
    }
    let zonemap_bytes = bincode::serialize(&zonemap)?;
    let zonemap_extent = Extent::new(body.len() as u64, zonemap_bytes.len() as u64);
    body.extend_from_slice(&zonemap_bytes);
    let bloom_bytes = bincode::serialize(&bloom)?;
    let bloom_extent = Extent::new(body.len() as u64, bloom_bytes.len() as u64);
    body.extend_from_slice(&bloom_bytes);

    let footer = Footer {
        magic: FOOTER_MAGIC,
        col_extents,
        zonemap_extent,
        bloom_extent,
        row_count: batch.row_count(),
        schema_version: schema.version,
        seqnums: schema.seqnums(),
        pk_pos: pk_pos as u16,
    };
    let footer_bytes = bincode::serialize(&footer)?;
    body.extend_from_slice(&footer_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();
    body.extend_from_slice(&(footer_bytes.len() as u32).to_be_bytes());
    body.extend_from_slice(&crc.to_be_bytes());

    let mut location = fs.write(name, &body)?;
    location.row_count = batch.row_count();
    Ok(location)
}

/// Write a delta-delete object for `block`.
pub fn write_delta_object(
    fs: &dyn FileService,
    name: &str,
    block: BlockId,
    entries: &[DeltaEntry],
) -> Result<Location> {
    let mut rowid = ColumnVector::new(LogicalType::Varchar);
    let mut commit_ts = ColumnVector::new(LogicalType::Varchar);
    let mut aborted = ColumnVector::new(LogicalType::Bool);
    let mut pk = ColumnVector::new(
        entries.first().and_then(|e| e.pk.logical_type()).unwrap_or(LogicalType::Varchar),
    );
    for entry in entries {
        rowid.push(Value::Varchar(pack_rowid(block, entry.row)));
        commit_ts.push(Value::Varchar(entry.commit_ts.to_bytes().to_vec()));
        aborted.push(Value::Bool(entry.aborted));
        pk.push(entry.pk.clone());
    }
    let batch = Batch::new(vec![rowid, commit_ts, aborted, pk])?;
    let payload = bincode::serialize(&batch)?;
    let mut location = fs.write(name, &payload)?;
    location.row_count = entries.len() as u32;
    Ok(location)
}

/// Cached reader over persisted block and delta objects.
pub struct BlockReader {
    fs: Arc<dyn FileService>,
    blocks: Mutex<LruCache<Vec<u8>, Arc<DecodedBlock>>>,
    deltas: Mutex<LruCache<Vec<u8>, Arc<DeltaDeletes>>>,
}

impl BlockReader {
    pub fn new(fs: Arc<dyn FileService>) -> Self {
        Self {
            fs,
            blocks: Mutex::new(LruCache::new(NonZeroUsize::new(BLOCK_CACHE_CAP).unwrap())),
            deltas: Mutex::new(LruCache::new(NonZeroUsize::new(DELTA_CACHE_CAP).unwrap())),
        }
    }

    pub fn load_block(&self, meta_loc: &Location) -> Result<Arc<DecodedBlock>> {
        let key = meta_loc.pack();
        if let Some(hit) = self.blocks.lock().get(&key) {
            return Ok(hit.clone());
        }
        let decoded = Arc::new(self.decode_block(meta_loc)?);
        self.blocks.lock().put(key, decoded.clone());
        Ok(decoded)
    }

    fn decode_block(&self, meta_loc: &Location) -> Result<DecodedBlock> {
        let body = self.fs.read(meta_loc, None)?;
        if body.len() < 8 {
            return Err(EngineError::Corruption(format!("object {} too short", meta_loc)));
        }
        let (payload, trailer) = body.split_at(body.len() - 8);
        let footer_len = u32::from_be_bytes(trailer[..4].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(trailer[4..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(EngineError::Corruption(format!("crc mismatch in {}", meta_loc)));
        }
        if footer_len > payload.len() {
            return Err(EngineError::Corruption(format!("bad footer length in {}", meta_loc)));
        }
        let footer: Footer = bincode::deserialize(&payload[payload.len() - footer_len..])?;
        if footer.magic != FOOTER_MAGIC {
            return Err(EngineError::Corruption(format!("bad magic in {}", meta_loc)));
        }

        let columns: Vec<ColumnVector> = footer
            .col_extents
            .par_iter()
            .map(|extent| -> Result<ColumnVector> {
                let bytes = slice_extent(payload, extent)?;
                let raw = snap::raw::Decoder::new().decompress_vec(bytes)?;
                Ok(bincode::deserialize(&raw)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let zonemap: ZoneMap = bincode::deserialize(slice_extent(payload, &footer.zonemap_extent)?)?;
        let bloom: BloomFilter = bincode::deserialize(slice_extent(payload, &footer.bloom_extent)?)?;

        let pk_pos = footer.pk_pos as usize;
        let mut pk = PkIndex::new(true);
        if let Some(keys) = columns.get(pk_pos) {
            for (row, key) in keys.values.iter().enumerate() {
                pk.insert(key.clone(), row as u32);
            }
        }

        Ok(DecodedBlock {
            columns,
            zonemap,
            bloom,
            row_count: footer.row_count,
            schema_version: footer.schema_version,
            seqnums: footer.seqnums,
            pk_pos,
            pk,
        })
    }

    pub fn load_delta(&self, delta_loc: &Location) -> Result<Arc<DeltaDeletes>> {
        let key = delta_loc.pack();
        if let Some(hit) = self.deltas.lock().get(&key) {
            return Ok(hit.clone());
        }
        let payload = self.fs.read(delta_loc, None)?;
        let batch: Batch = bincode::deserialize(&payload)?;
        let mut entries = Vec::with_capacity(batch.row_count() as usize);
        for i in 0..batch.row_count() {
            let row = match batch.columns[0].get(i as usize) {
                Some(Value::Varchar(bytes)) => crate::types::unpack_rowid(bytes)
                    .map(|(_, row)| row)
                    .ok_or_else(|| EngineError::Corruption("bad rowid in delta".into()))?,
                _ => return Err(EngineError::Corruption("bad rowid column in delta".into())),
            };
            let commit_ts = match batch.columns[1].get(i as usize) {
                Some(Value::Varchar(bytes)) => Timestamp::from_bytes(bytes)
                    .ok_or_else(|| EngineError::Corruption("bad commit_ts in delta".into()))?,
                _ => return Err(EngineError::Corruption("bad commit_ts column in delta".into())),
            };
            let aborted = matches!(batch.columns[2].get(i as usize), Some(Value::Bool(true)));
            let pk = batch.columns[3].get(i as usize).cloned().unwrap_or(Value::Null);
            entries.push(DeltaEntry { row, commit_ts, aborted, pk });
        }
        let delta = Arc::new(DeltaDeletes { entries });
        self.deltas.lock().put(key, delta.clone());
        Ok(delta)
    }

    /// Column views for the requested `(seqnum, type)` pairs at a snapshot.
    /// Columns unknown to the block's schema version read as all-null.
    pub fn column_views(
        &self,
        data: &PersistedData,
        wanted: &[(ColSeqNum, LogicalType)],
        snapshot: Timestamp,
    ) -> Result<Vec<ColumnView>> {
        let decoded = self.load_block(&data.meta_loc)?;
        let delta = match &data.delta_loc {
            Some(loc) => Some(self.load_delta(loc)?),
            None => None,
        };
        let mask = data.delete_mask_at(delta.as_deref(), snapshot);
        wanted
            .iter()
            .map(|(seq, typ)| {
                let col = match decoded.column_by_seqnum(*seq) {
                    Some(col) => col.clone(),
                    None => ColumnVector::all_null(*typ, decoded.row_count as usize),
                };
                Ok(ColumnView::new(col, mask.clone()))
            })
            .collect()
    }

    /// Live count at a snapshot, merging resident and persisted deletes.
    pub fn live_count(&self, data: &PersistedData, snapshot: Timestamp) -> Result<u32> {
        let delta = match &data.delta_loc {
            Some(loc) => Some(self.load_delta(loc)?),
            None => None,
        };
        Ok(data.live_count(delta.as_deref(), snapshot))
    }

    /// Newest live row holding `key`, at a snapshot.
    pub fn get_by_filter(
        &self,
        data: &PersistedData,
        key: &Value,
        snapshot: Timestamp,
    ) -> Result<Option<u32>> {
        let decoded = self.load_block(&data.meta_loc)?;
        if !decoded.zonemap.may_contain(key) {
            return Ok(None);
        }
        let delta = match &data.delta_loc {
            Some(loc) => Some(self.load_delta(loc)?),
            None => None,
        };
        let mask = data.delete_mask_at(delta.as_deref(), snapshot);
        Ok(decoded.pk.get(key).iter().rev().copied().find(|row| !mask.contains(*row)))
    }

    /// Fast duplicate probe: zonemap, then bloom. `Ok` means definitely
    /// absent; `ExpectedPossibleDup` sends the caller to the exact probe.
    pub fn quick_probe(&self, data: &PersistedData, keys: &[Value]) -> Result<()> {
        let decoded = self.load_block(&data.meta_loc)?;
        if !decoded.zonemap.fast_intersect(keys) {
            return Ok(());
        }
        let key_bytes: Vec<Vec<u8>> = keys.iter().map(Value::key_bytes).collect();
        if !decoded.bloom.may_contain_any(key_bytes.iter().map(|k| k.as_slice())) {
            return Ok(());
        }
        Err(EngineError::ExpectedPossibleDup)
    }

    /// Full dedup ladder: zonemap → bloom → exact probe against live rows.
    pub fn batch_dedup(&self, data: &PersistedData, keys: &[Value]) -> Result<()> {
        match self.quick_probe(data, keys) {
            Ok(()) => return Ok(()),
            Err(EngineError::ExpectedPossibleDup) => {}
            Err(e) => return Err(e),
        }
        let decoded = self.load_block(&data.meta_loc)?;
        let delta = match &data.delta_loc {
            Some(loc) => Some(self.load_delta(loc)?),
            None => None,
        };
        let mask = data.delete_mask_at(delta.as_deref(), Timestamp::MAX);
        for key in keys {
            if decoded.pk.get(key).iter().any(|row| !mask.contains(*row)) {
                return Err(EngineError::DuplicateEntry(format!("key {:?}", key)));
            }
        }
        Ok(())
    }
}

fn slice_extent<'a>(payload: &'a [u8], extent: &Extent) -> Result<&'a [u8]> {
    let start = extent.offset as usize;
    let end = extent.end() as usize;
    payload
        .get(start..end)
        .ok_or_else(|| EngineError::Corruption("extent outside object".into()))
}
