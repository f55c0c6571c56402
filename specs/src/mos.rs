use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The specification for the cache eviction policy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionSpec {
    /// Least recently used among clean rows first, then least recently used overall.
    #[default]
    LruCleanFirst,
    Lru,
}

/// The specification for the model oversubscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosSpec {
    pub train_from_scratch: bool,
    /// Previously persisted sparse models merged into the working store on startup.
    #[serde(default)]
    pub trained_sparse_models: Vec<PathBuf>,
    /// The working store of this session.
    pub sparse_model: PathBuf,
    /// Where to export a compacted copy of the sparse model once training ends.
    #[serde(default)]
    pub dest_sparse_model: Option<PathBuf>,
    #[serde(default)]
    pub eviction: EvictionSpec,
    /// Reads the next shard's rows while the current one is being computed.
    #[serde(default)]
    pub prefetch_ahead: bool,
    /// Flushes periodic snapshots on a separate thread.
    #[serde(default)]
    pub background_snapshot: bool,
}
