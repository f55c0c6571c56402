use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use crate::Key;

/// The specific result type for every fallible operation on a sparse model store.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Failures of the sparse model storage layer.
#[derive(Debug)]
pub enum StoreErr {
    /// The key was never stored, callers usually react by inserting it as new.
    NotFound(Key),
    /// The underlying medium could not be reached.
    StorageUnavailable {
        path: PathBuf,
        key: Option<Key>,
        source: io::Error,
    },
    /// A persisted entry (or the file header) failed validation.
    CorruptEntry {
        path: PathBuf,
        key: Option<Key>,
        detail: String,
    },
    /// The key index reached its configured maximum vocabulary size.
    VocabularyExhausted { key: Key, limit: usize },
    /// A row buffer doesn't match the store's row layout.
    SizeMismatch {
        key: Key,
        expected: usize,
        got: usize,
    },
}

impl StoreErr {
    /// Whether the run can carry on after this error.
    ///
    /// # Returns
    /// `true` only for `NotFound`, every other kind is fatal for the shard being processed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The key this error refers to, if any.
    pub fn key(&self) -> Option<Key> {
        match self {
            Self::NotFound(key)
            | Self::VocabularyExhausted { key, .. }
            | Self::SizeMismatch { key, .. } => Some(*key),
            Self::StorageUnavailable { key, .. } | Self::CorruptEntry { key, .. } => *key,
        }
    }

    pub(crate) fn unavailable(path: impl Into<PathBuf>, key: Option<Key>, source: io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            key,
            source,
        }
    }

    pub(crate) fn corrupt(
        path: impl Into<PathBuf>,
        key: Option<Key>,
        detail: impl Into<String>,
    ) -> Self {
        Self::CorruptEntry {
            path: path.into(),
            key,
            detail: detail.into(),
        }
    }
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(key) => write!(f, "key {key} not found"),
            Self::StorageUnavailable { path, key, source } => match key {
                Some(key) => write!(
                    f,
                    "storage unavailable at {} (key {key}): {source}",
                    path.display()
                ),
                None => write!(f, "storage unavailable at {}: {source}", path.display()),
            },
            Self::CorruptEntry { path, key, detail } => match key {
                Some(key) => write!(
                    f,
                    "corrupt entry in {} (key {key}): {detail}",
                    path.display()
                ),
                None => write!(f, "corrupt entry in {}: {detail}", path.display()),
            },
            Self::VocabularyExhausted { key, limit } => {
                write!(f, "cannot insert key {key}: vocabulary limit of {limit} reached")
            }
            Self::SizeMismatch { key, expected, got } => write!(
                f,
                "row for key {key} has {got} values, the store layout expects {expected}"
            ),
        }
    }
}

impl Error for StoreErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StorageUnavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}
