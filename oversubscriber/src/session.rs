use std::{
    error::Error,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};
use sparse_store::{Checkpoint, RowStore};
use specs::FitSpec;

use crate::{
    MosErr, Result,
    cache::StagedRows,
    coordinator::{Coordinator, ReadyShard},
    keyset::{KeysetShard, ShardSource},
};

/// The training step that runs on a resident shard, the dense forward and backward passes
/// live behind it.
pub trait ComputeStep: Send {
    /// Trains on every batch of a shard.
    ///
    /// # Arguments
    /// * `shard` - The resident shard, rows are read and updated through it.
    ///
    /// # Returns
    /// The amount of iterations it ran, or the error that stopped it.
    fn step(
        &mut self,
        shard: &mut ReadyShard<'_>,
    ) -> std::result::Result<usize, Box<dyn Error + Send + Sync>>;
}

/// How a `fit` went.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FitReport {
    /// Epochs fully completed.
    pub epochs: usize,
    /// Shards trained on, over every epoch.
    pub shards: usize,
    pub iterations: usize,
    /// Snapshots taken, the final one included.
    pub snapshots: usize,
    /// Whether the run stopped early because a stop was requested.
    pub stopped: bool,
    /// The checkpoint of the final snapshot.
    pub checkpoint: Option<Checkpoint>,
}

/// An oversubscribed training session, ready to `fit`.
pub struct Session<S: RowStore> {
    coordinator: Coordinator<S>,
    source: Box<dyn ShardSource>,
    fit: FitSpec,
    prefetch_ahead: bool,
    stop: Arc<AtomicBool>,
}

impl<S: RowStore + 'static> Session<S> {
    /// Creates a new `Session`.
    ///
    /// # Arguments
    /// * `coordinator` - Moves rows in and out of the cache.
    /// * `source` - The keysets of every shard.
    /// * `fit` - The length and cadences of the training loop.
    /// * `prefetch_ahead` - Whether to stage the next shard's rows during compute.
    ///
    /// # Returns
    /// A new `Session` instance.
    pub fn new(
        coordinator: Coordinator<S>,
        source: Box<dyn ShardSource>,
        fit: FitSpec,
        prefetch_ahead: bool,
    ) -> Self {
        Self {
            coordinator,
            source,
            fit,
            prefetch_ahead,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A flag that stops `fit` before its next shard once set, a final snapshot is still taken.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn coordinator(&self) -> &Coordinator<S> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<S> {
        self.coordinator.store()
    }

    /// Checks every shard's key set against the cache capacity before training.
    ///
    /// # Returns
    /// The size of the largest shard, `InvalidConfig` if there are no shards, or
    /// `RequestExceedsCapacity` for the first shard that can't be resident at once.
    pub fn validate(&mut self) -> Result<usize> {
        let shards = self.source.shards();
        if shards == 0 {
            return Err(MosErr::InvalidConfig("there are no keysets to train on".into()));
        }

        let capacity = self.coordinator.cache().capacity();
        let mut largest = 0;

        for pos in 0..shards {
            let shard = self.source.load(pos)?;

            if shard.len() > capacity {
                return Err(MosErr::RequestExceedsCapacity {
                    shard: Some(shard.index()),
                    requested: shard.len(),
                    capacity,
                });
            }

            largest = largest.max(shard.len());
        }

        debug!(shards = shards, largest = largest, capacity = capacity; "validated keysets");
        Ok(largest)
    }

    /// Trains over every shard for the configured amount of epochs.
    ///
    /// Shards are transitioned one at a time, the compute step only runs once every row of its
    /// shard is resident. Periodic snapshots follow the configured cadence and a final one is
    /// always taken, also when the run is stopped early.
    ///
    /// # Arguments
    /// * `step` - The compute step to run on every shard.
    ///
    /// # Returns
    /// A report of the run or the first fatal error.
    pub fn fit(&mut self, step: &mut dyn ComputeStep) -> Result<FitReport> {
        let shards = self.source.shards();
        let mut report = FitReport::default();

        info!(
            epochs = self.fit.num_epochs.get(),
            shards = shards,
            capacity = self.coordinator.cache().capacity();
            "starting fit"
        );

        'epochs: for epoch in 0..self.fit.num_epochs.get() {
            let mut staged = None;
            let mut upcoming = (shards > 0).then(|| self.source.load(0)).transpose()?;

            for pos in 0..shards {
                let Some(shard) = upcoming.take() else {
                    break;
                };

                if self.stop.load(Ordering::Relaxed) {
                    info!(epoch = epoch, shard = shard.index(); "stop requested");
                    report.stopped = true;
                    break 'epochs;
                }

                upcoming = (pos + 1 < shards)
                    .then(|| self.source.load(pos + 1))
                    .transpose()?;

                let ran = self.run_shard(&shard, upcoming.as_ref(), &mut staged, step)?;
                let before = report.iterations;
                report.iterations += ran;
                report.shards += 1;

                self.after_iterations(before, report.iterations)?;
            }

            report.epochs += 1;
            debug!(epoch = epoch, iterations = report.iterations; "epoch done");
        }

        report.checkpoint = Some(self.coordinator.snapshot()?);
        report.snapshots = self.coordinator.snapshots().taken();

        info!(
            epochs = report.epochs,
            shards = report.shards,
            iterations = report.iterations,
            snapshots = report.snapshots;
            "fit done"
        );
        Ok(report)
    }

    /// Prepares a shard and computes on it, staging the next one alongside if enabled.
    fn run_shard(
        &mut self,
        shard: &KeysetShard,
        next: Option<&KeysetShard>,
        staged: &mut Option<StagedRows>,
        step: &mut dyn ComputeStep,
    ) -> Result<usize> {
        let stager = self.coordinator.stager();
        let next = next.filter(|_| self.prefetch_ahead);
        let mut ready = self.coordinator.prepare_staged(shard, staged.take())?;

        let ran = match next {
            Some(next) => {
                let ahead = ready.prefetch_keys(next.keys());
                let (ran, rows) =
                    rayon::join(|| step.step(&mut ready), || stager.stage(&ahead));

                match rows {
                    Ok(rows) => *staged = Some(rows),
                    Err(e) => {
                        warn!(shard = next.index(), error:% = e; "couldn't stage the next shard")
                    }
                }

                ran
            }
            None => step.step(&mut ready),
        };

        drop(ready);
        ran.map_err(|source| MosErr::Compute {
            shard: shard.index(),
            source,
        })
    }

    /// Logs progress and takes the periodic snapshot once the iteration count crosses them.
    fn after_iterations(&mut self, before: usize, now: usize) -> Result<()> {
        if self
            .fit
            .display
            .is_some_and(|every| now / every.get() > before / every.get())
        {
            info!(
                iterations = now,
                resident = self.coordinator.cache().len(),
                dirty = self.coordinator.cache().dirty_len();
                "training"
            );
        }

        if self.coordinator.snapshot_due(now) {
            self.coordinator.periodic_snapshot(now)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use sparse_store::{Key, RowLayout};

    use super::*;
    use crate::{
        cache::{DeviceCache, EvictionPolicy},
        initialization::ConstParamGen,
        optimization::GradientDescent,
        snapshot::SnapshotWriter,
        test_store::MemStore,
    };

    /// Pushes every key of the shard one unit down, one iteration per key.
    struct Descend;

    impl ComputeStep for Descend {
        fn step(
            &mut self,
            shard: &mut ReadyShard<'_>,
        ) -> std::result::Result<usize, Box<dyn Error + Send + Sync>> {
            let keys = shard.keys().to_vec();
            for key in &keys {
                shard.apply_gradient(*key, &[1.])?;
            }

            Ok(keys.len())
        }
    }

    fn session(
        keysets: Vec<Vec<Key>>,
        capacity: usize,
        fit: FitSpec,
        ahead: bool,
    ) -> Session<MemStore> {
        let layout = RowLayout::new(NonZeroUsize::new(1).unwrap(), 0);
        let capacity = NonZeroUsize::new(capacity).unwrap();
        let cache = DeviceCache::new(capacity, layout, EvictionPolicy::default());

        let coordinator = Coordinator::new(
            Arc::new(MemStore::new(layout)),
            cache,
            Box::new(GradientDescent::new(1.)),
            Box::new(ConstParamGen::default()),
            SnapshotWriter::new(fit.snapshot, false),
        )
        .unwrap();

        Session::new(coordinator, Box::new(keysets), fit, ahead)
    }

    fn fit_spec(epochs: usize, snapshot: Option<usize>) -> FitSpec {
        FitSpec {
            num_epochs: NonZeroUsize::new(epochs).unwrap(),
            display: NonZeroUsize::new(2),
            snapshot: snapshot.and_then(NonZeroUsize::new),
        }
    }

    #[test]
    fn trains_every_shard_and_persists() {
        let keysets = vec![vec![1, 2], vec![2, 3], vec![4, 1]];
        let mut session = session(keysets, 2, fit_spec(2, Some(4)), false);

        let report = session.fit(&mut Descend).unwrap();

        assert_eq!(report.epochs, 2);
        assert_eq!(report.shards, 6);
        assert_eq!(report.iterations, 12);
        // Every 4 iterations out of 12, plus the final one.
        assert_eq!(report.snapshots, 4);
        assert!(!report.stopped);

        let store = session.store();
        assert_eq!(store.stored(1).unwrap().weights(), [-4.]);
        assert_eq!(store.stored(2).unwrap().weights(), [-4.]);
        assert_eq!(store.stored(3).unwrap().weights(), [-2.]);
        assert_eq!(session.coordinator().cache().dirty_len(), 0);
    }

    #[test]
    fn pipelined_fit_matches_sequential() {
        // On the second epoch each shard's rows were evicted by the one before, so they
        // get staged while the previous shard computes.
        let keysets = vec![vec![1, 2], vec![3, 4], vec![5, 6]];

        let mut sequential = session(keysets.clone(), 4, fit_spec(2, None), false);
        let mut pipelined = session(keysets, 4, fit_spec(2, None), true);

        sequential.fit(&mut Descend).unwrap();
        pipelined.fit(&mut Descend).unwrap();

        for key in 1..=6 {
            assert_eq!(pipelined.store().stored(key).unwrap().weights(), [-2.], "key {key}");
            assert_eq!(sequential.store().stored(key), pipelined.store().stored(key));
        }
    }

    #[test]
    fn oversized_shard_fails_validation() {
        let mut session = session(vec![vec![1, 2], vec![1, 2, 3]], 2, fit_spec(1, None), false);

        let err = session.validate().unwrap_err();
        assert!(matches!(
            err,
            MosErr::RequestExceedsCapacity { shard: Some(1), requested: 3, capacity: 2 }
        ));
    }

    #[test]
    fn no_shards_is_invalid() {
        let mut session = session(vec![], 2, fit_spec(1, None), false);
        assert!(matches!(session.validate(), Err(MosErr::InvalidConfig(_))));
    }

    #[test]
    fn stop_still_snapshots() {
        let mut session = session(vec![vec![1], vec![2]], 2, fit_spec(3, None), false);
        session.stop_handle().store(true, Ordering::Relaxed);

        let report = session.fit(&mut Descend).unwrap();

        assert!(report.stopped);
        assert_eq!(report.shards, 0);
        assert_eq!(report.snapshots, 1);
        assert!(report.checkpoint.is_some());
    }

    #[test]
    fn compute_failure_reports_the_shard() {
        struct Failing;

        impl ComputeStep for Failing {
            fn step(
                &mut self,
                shard: &mut ReadyShard<'_>,
            ) -> std::result::Result<usize, Box<dyn Error + Send + Sync>> {
                if shard.index() == 1 {
                    return Err("diverged".into());
                }

                Ok(1)
            }
        }

        let mut session = session(vec![vec![1], vec![2]], 2, fit_spec(1, None), false);
        let err = session.fit(&mut Failing).unwrap_err();

        assert!(matches!(err, MosErr::Compute { shard: 1, .. }));
        assert_eq!(err.shard(), Some(1));
    }
}
