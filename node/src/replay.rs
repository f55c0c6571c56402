use std::{error::Error, num::NonZeroUsize};

use log::trace;
use oversubscriber::{ComputeStep, ReadyShard};

/// Replays a shard's keys in batches, pulling every row towards zero.
///
/// It stands in for the dense model: each batch gathers its rows, takes the gradient of
/// `0.5 * |w|^2` and applies it through the session's optimizer.
pub struct ReplayStep {
    batch_size: NonZeroUsize,
    weights: Vec<f32>,
}

impl ReplayStep {
    /// Creates a new `ReplayStep`.
    ///
    /// # Arguments
    /// * `batch_size` - The amount of keys per iteration.
    ///
    /// # Returns
    /// A new `ReplayStep` instance.
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            weights: Vec::new(),
        }
    }
}

impl ComputeStep for ReplayStep {
    fn step(
        &mut self,
        shard: &mut ReadyShard<'_>,
    ) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let keys = shard.keys().to_vec();
        let mut iterations = 0;

        for batch in keys.chunks(self.batch_size.get()) {
            self.weights.clear();
            shard.gather(batch, &mut self.weights)?;

            let dim = self.weights.len() / batch.len();
            for (key, grad) in batch.iter().zip(self.weights.chunks(dim)) {
                shard.apply_gradient(*key, grad)?;
            }

            iterations += 1;
        }

        trace!(shard = shard.index(), iterations = iterations; "replayed shard");
        Ok(iterations)
    }
}
