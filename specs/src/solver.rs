use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// The specification for the solver, the execution bounds of the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSpec {
    pub batch_size: NonZeroUsize,
    pub embedding_dim: NonZeroUsize,
    /// The amount of rows the device cache can hold.
    pub cache_capacity: NonZeroUsize,
    /// Whether keyset files hold 64 bit keys instead of 32 bit ones.
    #[serde(default)]
    pub i64_input_key: bool,
    #[serde(default)]
    pub max_vocabulary_size: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}
