use sparse_store::EmbeddingRow;

use super::{Optimizer, SizeMismatchErr, optimizer::check_sizes};

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn state_width(&self, _dim: usize) -> usize {
        0
    }

    fn update_row(&self, grad: &[f32], row: &mut EmbeddingRow) -> Result<(), SizeMismatchErr> {
        check_sizes(self, grad, row)?;

        let lr = self.learning_rate;

        for (w, g) in row.weights_mut().iter_mut().zip(grad) {
            *w -= lr * g;
        }

        Ok(())
    }
}
