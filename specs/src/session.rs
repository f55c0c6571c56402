use std::{num::NonZeroUsize, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{InitializerSpec, MosSpec, OptimizerSpec, SolverSpec};

/// The specification for the data reader, one keyset file per training shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderSpec {
    pub keysets: Vec<PathBuf>,
}

/// The specification for the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    pub num_epochs: NonZeroUsize,
    /// Log progress every `display` iterations.
    #[serde(default)]
    pub display: Option<NonZeroUsize>,
    /// Snapshot the sparse model every `snapshot` iterations.
    #[serde(default)]
    pub snapshot: Option<NonZeroUsize>,
}

/// The specification for a whole oversubscribed training session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub solver: SolverSpec,
    pub reader: ReaderSpec,
    pub optimizer: OptimizerSpec,
    #[serde(default)]
    pub initializer: InitializerSpec,
    pub mos: MosSpec,
    pub fit: FitSpec,
}
