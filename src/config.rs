//! Engine configuration
//!
//! Knobs for block/segment sizing, background task cadence and the persisted
//! index parameters. Defaults are tuned for test-sized workloads; production
//! deployments raise the capacities and intervals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default rows per appendable block when a schema does not override it.
    pub block_max_rows: u32,

    /// Default blocks per segment when a schema does not override it.
    pub segment_max_blocks: u16,

    /// Budget for a bounded-wait flush before it returns `FlushTimeout`.
    pub flush_timeout: Duration,

    /// Background flusher tick.
    pub flush_interval: Duration,

    /// How many times flush/checkpoint retry a transient I/O failure before
    /// promoting it to `Internal`.
    pub io_retries: u32,

    /// Checkpointing cadence and thresholds.
    pub checkpoint: CheckpointConfig,

    /// Persisted bloom filter parameters.
    pub bloom: BloomConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_max_rows: 8192,
            segment_max_blocks: 16,
            flush_timeout: Duration::from_secs(10),
            flush_interval: Duration::from_millis(500),
            io_retries: 3,
            checkpoint: CheckpointConfig::default(),
            bloom: BloomConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Small capacities so unit tests exercise block and segment rollover.
    /// Background cadences are effectively disabled; tests drive flush and
    /// checkpoint explicitly.
    pub fn for_tests() -> Self {
        Self {
            block_max_rows: 10,
            segment_max_blocks: 2,
            flush_timeout: Duration::from_secs(5),
            flush_interval: Duration::from_secs(3600),
            checkpoint: CheckpointConfig {
                interval: Duration::from_secs(3600),
                ..CheckpointConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Incremental / global checkpoint cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Background tick between incremental checkpoint attempts.
    pub interval: Duration,

    /// Minimum number of committed transactions in the window before an
    /// incremental checkpoint is cut on a tick.
    pub dirty_threshold: usize,

    /// Number of incremental entries that triggers a global fold.
    pub global_threshold: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            dirty_threshold: 16,
            global_threshold: 10,
        }
    }
}

/// Bloom filter sizing for persisted blocks.
///
/// The false-positive rate is a function of `bits_per_key`; 10 bits ≈ 1%.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BloomConfig {
    /// Bits allocated per primary key.
    pub bits_per_key: usize,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self { bits_per_key: 10 }
    }
}
