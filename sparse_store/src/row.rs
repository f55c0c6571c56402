use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::{Key, Result, StoreErr};

/// The shape of every row held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLayout {
    dim: NonZeroUsize,
    state_width: usize,
}

impl RowLayout {
    /// Creates a new `RowLayout`.
    ///
    /// # Arguments
    /// * `dim` - The embedding dimension of the table.
    /// * `state_width` - The amount of optimizer state values carried by each row.
    ///
    /// # Returns
    /// A new `RowLayout` instance.
    pub fn new(dim: NonZeroUsize, state_width: usize) -> Self {
        Self { dim, state_width }
    }

    pub fn dim(&self) -> usize {
        self.dim.get()
    }

    pub fn state_width(&self) -> usize {
        self.state_width
    }

    /// The amount of `f32` values of a whole row, weights and state.
    pub fn width(&self) -> usize {
        self.dim.get() + self.state_width
    }
}

/// An embedding vector together with its optimizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    weights: Box<[f32]>,
    state: Box<[f32]>,
}

impl EmbeddingRow {
    /// Creates a new `EmbeddingRow`.
    ///
    /// # Arguments
    /// * `weights` - The embedding vector.
    /// * `state` - The optimizer state for this row.
    ///
    /// # Returns
    /// A new `EmbeddingRow` instance.
    pub fn new(weights: Vec<f32>, state: Vec<f32>) -> Self {
        Self {
            weights: weights.into_boxed_slice(),
            state: state.into_boxed_slice(),
        }
    }

    /// Creates a row with every weight and state value set to zero.
    ///
    /// # Arguments
    /// * `layout` - The shape of the row.
    ///
    /// # Returns
    /// A new zeroed `EmbeddingRow`.
    pub fn zeroed(layout: RowLayout) -> Self {
        Self::with_weights(layout, vec![0.; layout.dim()])
    }

    /// Creates a row from its weights and a zeroed optimizer state.
    ///
    /// # Arguments
    /// * `layout` - The shape of the row.
    /// * `weights` - The initial weights, it should have `layout.dim()` values.
    ///
    /// # Returns
    /// A new `EmbeddingRow` instance.
    pub fn with_weights(layout: RowLayout, weights: Vec<f32>) -> Self {
        Self::new(weights, vec![0.; layout.state_width()])
    }

    /// Splits a flat buffer into a row following `layout`.
    ///
    /// # Arguments
    /// * `layout` - The shape of the row.
    /// * `values` - A buffer of exactly `layout.width()` values.
    ///
    /// # Returns
    /// The row, or `None` if the buffer doesn't match the layout.
    pub fn from_flat(layout: RowLayout, values: &[f32]) -> Option<Self> {
        if values.len() != layout.width() {
            return None;
        }

        let (weights, state) = values.split_at(layout.dim());
        Some(Self::new(weights.to_vec(), state.to_vec()))
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    pub fn state(&self) -> &[f32] {
        &self.state
    }

    /// Borrows the weights and the optimizer state mutably at the same time.
    pub fn split_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.weights, &mut self.state)
    }

    /// Checks this row against a layout.
    ///
    /// # Arguments
    /// * `key` - The key of the row, used for error reporting.
    /// * `layout` - The layout to validate against.
    ///
    /// # Returns
    /// A `SizeMismatch` error if either the weights or the state have the wrong width.
    pub fn check(&self, key: Key, layout: RowLayout) -> Result<()> {
        if self.weights.len() != layout.dim() || self.state.len() != layout.state_width() {
            return Err(StoreErr::SizeMismatch {
                key,
                expected: layout.width(),
                got: self.weights.len() + self.state.len(),
            });
        }

        Ok(())
    }
}
