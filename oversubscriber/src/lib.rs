//! Trains an embedding table larger than the accelerator's memory.
//!
//! Every row of the table lives in a [`sparse_store`] backing store. Before each data shard
//! is trained on, the [`Coordinator`] makes the rows of the shard's keyset resident in a
//! fixed size [`DeviceCache`], evicting and writing back what the shard doesn't need. The
//! [`Session`] drives this over every shard and epoch, with periodic snapshots of the dirty
//! rows on the way.

pub mod builder;
pub mod cache;
pub mod coordinator;
mod error;
pub mod initialization;
pub mod keyset;
pub mod optimization;
pub mod session;
pub mod snapshot;

#[cfg(test)]
mod test_store;

pub use builder::SessionBuilder;
pub use cache::{DeviceCache, EvictionPolicy, Residency};
pub use coordinator::{Coordinator, Phase, ReadyShard};
pub use error::{MosErr, Result};
pub use keyset::{KeyType, KeysetFiles, KeysetShard, ShardSource};
pub use session::{ComputeStep, FitReport, Session};
pub use snapshot::SnapshotWriter;
