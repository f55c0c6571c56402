use std::{
    error::Error,
    fmt::{self, Display},
};

use sparse_store::EmbeddingRow;

/// Returned when a gradient or a row's state doesn't have the width the optimizer expects.
#[derive(Debug, PartialEq, Eq)]
pub struct SizeMismatchErr;

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the gradient length doesn't match the row layout")
    }
}

impl Error for SizeMismatchErr {}

/// Defines the strategy for updating embedding rows based on their gradients.
///
/// Optimizers don't hold any per parameter state themselves, every row carries its own in
/// `EmbeddingRow::state` so it can be evicted to the store and loaded back without losing
/// progress.
pub trait Optimizer: Send + Sync {
    /// The amount of state values this optimizer keeps for a row of `dim` weights.
    fn state_width(&self, dim: usize) -> usize;

    /// Updates a single row in place.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the row's weights.
    /// * `row` - The row to update, weights and state.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad`, the weights or the state.
    fn update_row(&self, grad: &[f32], row: &mut EmbeddingRow) -> Result<(), SizeMismatchErr>;
}

/// Checks `grad` and `row` against each other and against the state width of `optimizer`.
pub(super) fn check_sizes<O: Optimizer + ?Sized>(
    optimizer: &O,
    grad: &[f32],
    row: &EmbeddingRow,
) -> Result<(), SizeMismatchErr> {
    let dim = row.weights().len();

    if grad.len() != dim || row.state().len() != optimizer.state_width(dim) {
        return Err(SizeMismatchErr);
    }

    Ok(())
}
