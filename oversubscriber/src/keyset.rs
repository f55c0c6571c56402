use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use sparse_store::Key;

use crate::{MosErr, Result};

/// The width of the keys stored in keyset files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    U32,
    I64,
}

impl KeyType {
    /// The size in bytes of a single key.
    pub fn width(self) -> usize {
        match self {
            Self::U32 => size_of::<u32>(),
            Self::I64 => size_of::<i64>(),
        }
    }

    /// Decodes a buffer of little endian keys, widening them to `Key`.
    ///
    /// Signed keys keep their two's complement bits.
    ///
    /// # Arguments
    /// * `buf` - A buffer whose length is a multiple of `self.width()`.
    ///
    /// # Returns
    /// The keys in file order, or `None` if the buffer has a trailing partial key.
    pub fn decode(self, buf: &[u8]) -> Option<Vec<Key>> {
        if buf.len() % self.width() != 0 {
            return None;
        }

        let keys = match self {
            Self::U32 => buf
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as Key)
                .collect(),
            Self::I64 => buf
                .chunks_exact(8)
                .map(|b| {
                    let mut bytes = [0; 8];
                    bytes.copy_from_slice(b);
                    i64::from_le_bytes(bytes) as Key
                })
                .collect(),
        };

        Some(keys)
    }
}

impl From<bool> for KeyType {
    fn from(i64_input_key: bool) -> Self {
        if i64_input_key { Self::I64 } else { Self::U32 }
    }
}

/// The set of embedding keys touched by one data shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetShard {
    index: usize,
    keys: Vec<Key>,
}

impl KeysetShard {
    /// Creates a new `KeysetShard`.
    ///
    /// # Arguments
    /// * `index` - The position of the shard in the run.
    /// * `keys` - The keys of the shard, duplicates are dropped keeping the first occurrence.
    ///
    /// # Returns
    /// A new `KeysetShard` instance.
    pub fn new(index: usize, keys: impl IntoIterator<Item = Key>) -> Self {
        let mut seen = HashSet::new();
        let keys = keys.into_iter().filter(|k| seen.insert(*k)).collect();
        Self { index, keys }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A source of keyset shards, read once per epoch in order.
pub trait ShardSource: Send {
    /// The amount of shards in one epoch.
    fn shards(&self) -> usize;

    /// Loads the shard at `pos`.
    ///
    /// # Arguments
    /// * `pos` - The position of the shard, smaller than `self.shards()`.
    ///
    /// # Returns
    /// The shard or an error if it couldn't be read.
    fn load(&mut self, pos: usize) -> Result<KeysetShard>;
}

/// Binary keyset files, one per training shard.
#[derive(Debug, Clone)]
pub struct KeysetFiles {
    paths: Vec<PathBuf>,
    key_type: KeyType,
}

impl KeysetFiles {
    /// Creates a new `KeysetFiles` source.
    ///
    /// # Arguments
    /// * `paths` - The keyset file of every shard, in training order.
    /// * `key_type` - The width of the keys in the files.
    ///
    /// # Returns
    /// A new `KeysetFiles` instance.
    pub fn new(paths: Vec<PathBuf>, key_type: KeyType) -> Self {
        Self { paths, key_type }
    }

    fn read(&self, pos: usize, path: &Path) -> Result<KeysetShard> {
        let buf = fs::read(path).map_err(|source| MosErr::Keyset {
            path: path.to_path_buf(),
            source,
        })?;

        let keys = self
            .key_type
            .decode(&buf)
            .ok_or_else(|| MosErr::MalformedKeyset {
                path: path.to_path_buf(),
                len: buf.len() as u64,
                key_width: self.key_type.width(),
            })?;

        let shard = KeysetShard::new(pos, keys);
        debug!(shard = pos, keys = shard.len(); "keyset loaded");
        Ok(shard)
    }
}

impl ShardSource for KeysetFiles {
    fn shards(&self) -> usize {
        self.paths.len()
    }

    fn load(&mut self, pos: usize) -> Result<KeysetShard> {
        let path = self.paths.get(pos).ok_or_else(|| {
            MosErr::InvalidConfig(format!("shard {pos} out of {} keysets", self.paths.len()))
        })?;

        self.read(pos, path)
    }
}

/// In memory keysets, mostly handy for tests and synthetic runs.
impl ShardSource for Vec<Vec<Key>> {
    fn shards(&self) -> usize {
        self.len()
    }

    fn load(&mut self, pos: usize) -> Result<KeysetShard> {
        let keys = self.get(pos).ok_or_else(|| {
            MosErr::InvalidConfig(format!("shard {pos} out of {} keysets", self.len()))
        })?;

        Ok(KeysetShard::new(pos, keys.iter().copied()))
    }
}
