//! Durable storage for the sparse half of a model: embedding rows addressed by key.
//!
//! A [`FileStore`] keeps every row of an embedding table, together with its optimizer
//! state, in a single file of checksummed slots. It's the authoritative copy of any row
//! that isn't currently modified inside a cache, and the [`RowStore`] trait is the seam
//! the caching layer talks to.

mod checkpoint;
mod codec;
mod error;
mod index;
mod row;
mod store;

pub use checkpoint::Checkpoint;
pub use error::{Result, StoreErr};
pub use index::{KeyIndex, Slot};
pub use row::{EmbeddingRow, RowLayout};
pub use store::{FileStore, RowStore};

/// An embedding key, 32 bit keys are widened on ingestion.
pub type Key = u64;
