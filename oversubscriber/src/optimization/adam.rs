use sparse_store::EmbeddingRow;

use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

/// Adam with per row moments.
///
/// A row of `dim` weights keeps `2 * dim + 1` state values: the first moments, the second
/// moments and the amount of updates the row has seen. Rows only get updated when their key
/// shows up in a batch, so the bias correction follows the row's own step count instead of a
/// global one.
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        }
    }
}

impl Optimizer for Adam {
    fn state_width(&self, dim: usize) -> usize {
        2 * dim + 1
    }

    fn update_row(&self, grad: &[f32], row: &mut EmbeddingRow) -> Result<(), SizeMismatchErr> {
        check_sizes(self, grad, row)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
        } = *self;

        let (weights, state) = row.split_mut();
        let (moments, step) = state.split_at_mut(2 * weights.len());
        let (v, s) = moments.split_at_mut(weights.len());

        step[0] += 1.;
        let t = step[0] as i32;

        let bc1 = 1. - b1.powi(t);
        let bc2 = 1. - b2.powi(t);
        let step_size = lr * (bc2.sqrt() / bc1);

        weights
            .iter_mut()
            .zip(grad)
            .zip(v.iter_mut())
            .zip(s.iter_mut())
            .for_each(|(((w, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *w -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }
}
