use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::{ParamGen, RandErr, Result};

/// A parameter generator that follows a certain probabilistic distribution.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: R,
    distribution: D,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen` parameter generator.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample the random numbers from.
    pub fn new(rng: R, distribution: D) -> Self {
        Self { rng, distribution }
    }
}

impl<R: Rng> RandParamGen<R, Uniform<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a uniform distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(rng: R, low: f32, high: f32) -> Result<Self> {
        let distribution = Uniform::new(low, high).map_err(|source| RandErr::Uniform {
            low,
            high,
            inclusive: false,
            source,
        })?;

        Ok(Self::new(rng, distribution))
    }

    /// Creates a new `RandParamGen` parameter generator with an inclusive uniform distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The inclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low > high).
    pub fn uniform_inclusive(rng: R, low: f32, high: f32) -> Result<Self> {
        let distribution =
            Uniform::new_inclusive(low, high).map_err(|source| RandErr::Uniform {
                low,
                high,
                inclusive: true,
                source,
            })?;

        Ok(Self::new(rng, distribution))
    }
}

impl<R: Rng> RandParamGen<R, Normal<f32>> {
    /// Creates a new `RandParamGen` parameter generator with a normal distribution.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(rng: R, mean: f32, std_dev: f32) -> Result<Self> {
        let distribution = Normal::new(mean, std_dev).map_err(|source| RandErr::Normal {
            mean,
            std_dev,
            source,
        })?;

        Ok(Self::new(rng, distribution))
    }
}

impl<R, D> ParamGen for RandParamGen<R, D>
where
    R: Rng + Send,
    D: Distribution<f32> + Send,
{
    fn sample(&mut self, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| self.distribution.sample(&mut self.rng))
            .collect()
    }
}
