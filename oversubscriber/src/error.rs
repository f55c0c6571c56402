use std::{error::Error, fmt, io, path::PathBuf};

use sparse_store::{Key, StoreErr};

use crate::initialization::RandErr;

/// The oversubscriber's result type.
pub type Result<T> = std::result::Result<T, MosErr>;

/// Oversubscription failures, every variant but `FlushInProgress` is fatal for the run.
#[derive(Debug)]
pub enum MosErr {
    /// The backing store failed while moving rows in or out of the cache.
    Store {
        shard: Option<usize>,
        source: StoreErr,
    },
    /// A single residency request is larger than the whole cache.
    RequestExceedsCapacity {
        shard: Option<usize>,
        requested: usize,
        capacity: usize,
    },
    /// Only rows pinned by an in flight snapshot could have been evicted.
    FlushInProgress { pinned: usize },
    /// The compute step touched a key that isn't resident.
    NotResident { key: Key },
    /// A gradient doesn't match the embedding dimension.
    GradientMismatch {
        key: Key,
        expected: usize,
        got: usize,
    },
    InvalidConfig(String),
    Keyset {
        path: PathBuf,
        source: io::Error,
    },
    MalformedKeyset {
        path: PathBuf,
        len: u64,
        key_width: usize,
    },
    /// The external compute step failed.
    Compute {
        shard: usize,
        source: Box<dyn Error + Send + Sync>,
    },
    /// The background snapshot thread panicked.
    SnapshotPanicked,
}

impl MosErr {
    /// Attaches the index of the shard being processed.
    pub fn at_shard(self, shard: usize) -> Self {
        match self {
            Self::Store { source, .. } => Self::Store {
                shard: Some(shard),
                source,
            },
            Self::RequestExceedsCapacity {
                requested,
                capacity,
                ..
            } => Self::RequestExceedsCapacity {
                shard: Some(shard),
                requested,
                capacity,
            },
            other => other,
        }
    }

    /// The shard being processed when the error happened, if known.
    pub fn shard(&self) -> Option<usize> {
        match self {
            Self::Store { shard, .. } | Self::RequestExceedsCapacity { shard, .. } => *shard,
            Self::Compute { shard, .. } => Some(*shard),
            _ => None,
        }
    }

    /// The key involved in the failure, if any.
    pub fn key(&self) -> Option<Key> {
        match self {
            Self::Store { source, .. } => source.key(),
            Self::NotResident { key } | Self::GradientMismatch { key, .. } => Some(*key),
            _ => None,
        }
    }
}

impl fmt::Display for MosErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store {
                shard: Some(shard),
                source,
            } => write!(f, "shard {shard}: {source}"),
            Self::Store { shard: None, source } => write!(f, "{source}"),
            Self::RequestExceedsCapacity {
                shard,
                requested,
                capacity,
            } => {
                if let Some(shard) = shard {
                    write!(f, "shard {shard}: ")?;
                }
                write!(
                    f,
                    "{requested} keys requested but the cache only holds {capacity} rows"
                )
            }
            Self::FlushInProgress { pinned } => {
                write!(f, "{pinned} rows are pinned by a snapshot in progress")
            }
            Self::NotResident { key } => write!(f, "key {key} is not resident"),
            Self::GradientMismatch { key, expected, got } => write!(
                f,
                "gradient for key {key} has {got} values, expected {expected}"
            ),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Keyset { path, source } => {
                write!(f, "can't read keyset {}: {source}", path.display())
            }
            Self::MalformedKeyset {
                path,
                len,
                key_width,
            } => write!(
                f,
                "keyset {} is {len} bytes long, not a multiple of the {key_width} byte key width",
                path.display()
            ),
            Self::Compute { shard, source } => write!(f, "shard {shard}: compute failed: {source}"),
            Self::SnapshotPanicked => f.write_str("the snapshot thread panicked"),
        }
    }
}

impl Error for MosErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store { source, .. } => Some(source),
            Self::Keyset { source, .. } => Some(source),
            Self::Compute { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreErr> for MosErr {
    fn from(value: StoreErr) -> Self {
        Self::Store {
            shard: None,
            source: value,
        }
    }
}

impl From<RandErr> for MosErr {
    fn from(value: RandErr) -> Self {
        Self::InvalidConfig(value.to_string())
    }
}

/// Boundary conversion for binaries.
impl From<MosErr> for io::Error {
    fn from(value: MosErr) -> Self {
        match value {
            MosErr::InvalidConfig(_) => io::Error::new(io::ErrorKind::InvalidInput, value),
            MosErr::Keyset { .. }
            | MosErr::Store {
                source: StoreErr::StorageUnavailable { .. },
                ..
            } => io::Error::other(value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
