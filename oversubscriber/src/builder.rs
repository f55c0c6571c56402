use std::sync::Arc;

use log::info;
use rand::{SeedableRng, rngs::StdRng};
use sparse_store::{FileStore, RowLayout};
use specs::{DistributionSpec, InitializerSpec, MosSpec, OptimizerSpec, SessionSpec};

use crate::{
    MosErr, Result,
    cache::DeviceCache,
    coordinator::Coordinator,
    initialization::{ConstParamGen, ParamGen, RandParamGen},
    keyset::{KeysetFiles, ShardSource},
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, Optimizer},
    session::Session,
    snapshot::SnapshotWriter,
};

/// Builds `Session`s given a specification.
///
/// The spec is validated once here, the session never looks at it again.
#[derive(Debug, Default)]
pub struct SessionBuilder;

impl SessionBuilder {
    /// Creates a new `SessionBuilder`.
    ///
    /// # Returns
    /// A new `SessionBuilder` instance.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Session` following a spec, reading keysets from the spec's files.
    ///
    /// # Arguments
    /// * `spec` - The specification of the session.
    ///
    /// # Returns
    /// A new session, `InvalidConfig` if the spec is inconsistent, `RequestExceedsCapacity`
    /// if a shard can't fit in the cache, or the store's error while opening it.
    pub fn build(&self, spec: SessionSpec) -> Result<Session<FileStore>> {
        let source = KeysetFiles::new(
            spec.reader.keysets.clone(),
            spec.solver.i64_input_key.into(),
        );

        self.build_with_source(spec, Box::new(source))
    }

    /// Builds a new `Session` following a spec, reading keysets from `source`.
    ///
    /// # Arguments
    /// * `spec` - The specification of the session.
    /// * `source` - Where the keysets of each shard come from.
    ///
    /// # Returns
    /// Same as `build`.
    pub fn build_with_source(
        &self,
        spec: SessionSpec,
        source: Box<dyn ShardSource>,
    ) -> Result<Session<FileStore>> {
        self.validate(&spec)?;

        let optimizer = self.resolve_optimizer(spec.optimizer);
        let dim = spec.solver.embedding_dim;
        let layout = RowLayout::new(dim, optimizer.state_width(dim.get()));

        let initializer = self.resolve_initializer(spec.initializer, spec.solver.seed)?;
        let store = self.open_store(&spec.mos, layout, spec.solver.max_vocabulary_size)?;

        let cache = DeviceCache::new(spec.solver.cache_capacity, layout, spec.mos.eviction.into());
        let snapshots = SnapshotWriter::new(spec.fit.snapshot, spec.mos.background_snapshot);
        let coordinator =
            Coordinator::new(Arc::new(store), cache, optimizer, initializer, snapshots)?;

        let mut session = Session::new(coordinator, source, spec.fit, spec.mos.prefetch_ahead);
        let largest = session.validate()?;

        info!(
            capacity = spec.solver.cache_capacity.get(),
            largest_shard = largest,
            state_width = layout.state_width();
            "session built"
        );
        Ok(session)
    }

    /// Checks the parts of the spec the types can't.
    fn validate(&self, spec: &SessionSpec) -> Result<()> {
        let mos = &spec.mos;

        if mos.train_from_scratch && !mos.trained_sparse_models.is_empty() {
            return Err(MosErr::InvalidConfig(
                "trained sparse models can't be loaded when training from scratch".into(),
            ));
        }

        if mos.trained_sparse_models.contains(&mos.sparse_model) {
            return Err(MosErr::InvalidConfig(format!(
                "the working sparse model {} is also a trained one",
                mos.sparse_model.display()
            )));
        }

        if spec.solver.max_vocabulary_size == Some(0) {
            return Err(MosErr::InvalidConfig("max_vocabulary_size must be positive".into()));
        }

        self.validate_optimizer(spec.optimizer)
    }

    fn validate_optimizer(&self, spec: OptimizerSpec) -> Result<()> {
        let invalid = |what: &str| Err(MosErr::InvalidConfig(format!("invalid optimizer {what}")));

        let learning_rate = match spec {
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => {
                if !(0. ..1.).contains(&beta1) || !(0. ..1.).contains(&beta2) {
                    return invalid("betas, they must be in [0, 1)");
                }

                if !(epsilon.is_finite() && epsilon > 0.) {
                    return invalid("epsilon, it must be positive");
                }

                learning_rate
            }
            OptimizerSpec::GradientDescent { learning_rate } => learning_rate,
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => {
                if !(0. ..1.).contains(&momentum) {
                    return invalid("momentum, it must be in [0, 1)");
                }

                learning_rate
            }
        };

        if !(learning_rate.is_finite() && learning_rate > 0.) {
            return invalid("learning rate, it must be positive");
        }

        Ok(())
    }

    /// Resolves the `Optimizer` for this session.
    fn resolve_optimizer(&self, spec: OptimizerSpec) -> Box<dyn Optimizer> {
        match spec {
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
            OptimizerSpec::GradientDescent { learning_rate } => {
                Box::new(GradientDescent::new(learning_rate))
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(learning_rate, momentum)),
        }
    }

    /// Generates a random number generator given (or not) a seed.
    fn generate_rng(&self, seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    /// Resolves the `ParamGen` for rows of new keys.
    ///
    /// # Arguments
    /// * `spec` - The specification of the initializer.
    /// * `seed` - An optional seed for random initializers.
    ///
    /// # Returns
    /// The parameter generator, or `InvalidConfig` if the distribution's parameters are invalid.
    fn resolve_initializer(
        &self,
        spec: InitializerSpec,
        seed: Option<u64>,
    ) -> Result<Box<dyn ParamGen>> {
        let distribution = match spec {
            InitializerSpec::Const { value } => return Ok(Box::new(ConstParamGen::new(value))),
            InitializerSpec::Rand { distribution } => distribution,
        };

        let rng = self.generate_rng(seed);

        let param_gen: Box<dyn ParamGen> = match distribution {
            DistributionSpec::Uniform { low, high } => {
                Box::new(RandParamGen::uniform(rng, low, high)?)
            }
            DistributionSpec::UniformInclusive { low, high } => {
                Box::new(RandParamGen::uniform_inclusive(rng, low, high)?)
            }
            DistributionSpec::Normal { mean, std_dev } => {
                Box::new(RandParamGen::normal(rng, mean, std_dev)?)
            }
        };

        Ok(param_gen)
    }

    /// Opens the working store of the session.
    ///
    /// Training from scratch starts from an empty store. Otherwise the store is rebuilt from the
    /// trained sparse models when there are any, or reopened as it was left.
    fn open_store(
        &self,
        mos: &MosSpec,
        layout: RowLayout,
        limit: Option<usize>,
    ) -> Result<FileStore> {
        let path = &mos.sparse_model;

        if mos.train_from_scratch {
            return Ok(FileStore::create(path, layout, limit)?);
        }

        if mos.trained_sparse_models.is_empty() {
            return Ok(FileStore::open_or_create(path, layout, limit)?);
        }

        let store = FileStore::create(path, layout, limit)?;
        store.load_initial(mos.trained_sparse_models.as_slice())?;
        Ok(store)
    }
}
