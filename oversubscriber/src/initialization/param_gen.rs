/// A `ParamGen` generates the initial weights of rows for keys seen for the first time.
pub trait ParamGen: Send {
    /// Samples `n` parameters.
    ///
    /// # Arguments
    /// * `n` - The amount of samples to generate.
    ///
    /// # Returns
    /// A vec of exactly `n` values.
    fn sample(&mut self, n: usize) -> Vec<f32>;
}
