use std::collections::HashMap;

use sparse_store::{EmbeddingRow, Key};

/// Rows read ahead of time for the next residency request.
#[derive(Debug, Default)]
pub struct StagedRows {
    rows: HashMap<Key, EmbeddingRow>,
}

impl StagedRows {
    pub fn new(rows: HashMap<Key, EmbeddingRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(super) fn take(&mut self, key: Key) -> Option<EmbeddingRow> {
        self.rows.remove(&key)
    }
}
