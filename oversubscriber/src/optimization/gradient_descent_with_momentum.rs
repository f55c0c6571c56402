use sparse_store::EmbeddingRow;

use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

/// Gradient descent with a per row velocity stored in the row's state.
#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn state_width(&self, dim: usize) -> usize {
        dim
    }

    fn update_row(&self, grad: &[f32], row: &mut EmbeddingRow) -> Result<(), SizeMismatchErr> {
        check_sizes(self, grad, row)?;

        let lr = self.learning_rate;
        let mu = self.momentum;
        let (weights, velocity) = row.split_mut();

        weights
            .iter_mut()
            .zip(grad)
            .zip(velocity.iter_mut())
            .for_each(|((w, g), v)| {
                *v = (mu * *v) + g;
                *w -= lr * *v;
            });

        Ok(())
    }
}
