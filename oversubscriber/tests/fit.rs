use std::{error::Error, fs, num::NonZeroUsize, path::Path};

use oversubscriber::{ComputeStep, ReadyShard, SessionBuilder};
use sparse_store::{EmbeddingRow, FileStore, Key, RowLayout, RowStore};
use specs::{
    EvictionSpec, FitSpec, InitializerSpec, MosSpec, OptimizerSpec, ReaderSpec, SessionSpec,
    SolverSpec,
};

/// One iteration per key, each pushing its row one unit down.
struct Descend;

impl ComputeStep for Descend {
    fn step(&mut self, shard: &mut ReadyShard<'_>) -> Result<usize, Box<dyn Error + Send + Sync>> {
        let keys = shard.keys().to_vec();
        let grad = vec![1.; 2];

        for key in &keys {
            shard.apply_gradient(*key, &grad)?;
        }

        Ok(keys.len())
    }
}

fn layout() -> RowLayout {
    RowLayout::new(NonZeroUsize::new(2).unwrap(), 0)
}

fn write_u32_keyset(path: &Path, keys: &[u32]) {
    let buf: Vec<u8> = keys.iter().flat_map(|k| k.to_le_bytes()).collect();
    fs::write(path, buf).unwrap();
}

fn write_i64_keyset(path: &Path, keys: &[i64]) {
    let buf: Vec<u8> = keys.iter().flat_map(|k| k.to_le_bytes()).collect();
    fs::write(path, buf).unwrap();
}

fn spec(dir: &Path, keysets: usize) -> SessionSpec {
    SessionSpec {
        solver: SolverSpec {
            batch_size: NonZeroUsize::new(1).unwrap(),
            embedding_dim: NonZeroUsize::new(2).unwrap(),
            cache_capacity: NonZeroUsize::new(4).unwrap(),
            i64_input_key: false,
            max_vocabulary_size: None,
            seed: None,
        },
        reader: ReaderSpec {
            keysets: (0..keysets)
                .map(|i| dir.join(format!("file_list.{i}.keyset")))
                .collect(),
        },
        optimizer: OptimizerSpec::GradientDescent { learning_rate: 1. },
        initializer: InitializerSpec::default(),
        mos: MosSpec {
            train_from_scratch: true,
            trained_sparse_models: vec![],
            sparse_model: dir.join("working_sparse_model"),
            dest_sparse_model: None,
            eviction: EvictionSpec::LruCleanFirst,
            prefetch_ahead: false,
            background_snapshot: false,
        },
        fit: FitSpec {
            num_epochs: NonZeroUsize::new(2).unwrap(),
            display: NonZeroUsize::new(3),
            snapshot: NonZeroUsize::new(4),
        },
    }
}

fn reopen(dir: &Path) -> FileStore {
    FileStore::open(dir.join("working_sparse_model"), layout(), None).unwrap()
}

fn weights(store: &FileStore, key: Key) -> Vec<f32> {
    store.read_rows(&[key]).unwrap()[&key].weights().to_vec()
}

#[test]
fn fit_from_scratch_over_keyset_files() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec(dir.path(), 3);
    write_u32_keyset(&spec.reader.keysets[0], &[1, 2, 3, 1]);
    write_u32_keyset(&spec.reader.keysets[1], &[4, 5]);
    write_u32_keyset(&spec.reader.keysets[2], &[2, 6, 7, 8]);

    let mut session = SessionBuilder::new().build(spec).unwrap();
    let report = session.fit(&mut Descend).unwrap();

    assert_eq!(report.epochs, 2);
    assert_eq!(report.shards, 6);
    assert_eq!(report.iterations, 18);
    // At 5, 9, 14 and 18 iterations, then the final one.
    assert_eq!(report.snapshots, 5);
    assert_eq!(report.checkpoint.as_ref().unwrap().rows, 8);
    drop(session);

    let store = reopen(dir.path());
    assert_eq!(store.len(), 8);
    assert_eq!(weights(&store, 2), [-4., -4.]);
    assert_eq!(weights(&store, 5), [-2., -2.]);
    assert_eq!(store.last_checkpoint().unwrap().unwrap().rows, 8);
}

#[test]
fn fit_from_trained_sparse_models() {
    let dir = tempfile::tempdir().unwrap();

    for (name, keys) in [("wdl_0_sparse_model", [1, 2]), ("wdl_1_sparse_model", [10, 11])] {
        let store = FileStore::create(dir.path().join(name), layout(), None).unwrap();
        let rows: Vec<_> = keys
            .iter()
            .map(|k| (*k, EmbeddingRow::new(vec![*k as f32; 2], vec![])))
            .collect();
        let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
        store.write_rows(&batch).unwrap();
        store.checkpoint().unwrap();
    }

    let mut spec = spec(dir.path(), 2);
    spec.fit.num_epochs = NonZeroUsize::new(1).unwrap();
    spec.mos.train_from_scratch = false;
    spec.mos.trained_sparse_models = vec![
        dir.path().join("wdl_0_sparse_model"),
        dir.path().join("wdl_1_sparse_model"),
    ];
    write_u32_keyset(&spec.reader.keysets[0], &[1, 10]);
    write_u32_keyset(&spec.reader.keysets[1], &[2, 99]);

    let mut session = SessionBuilder::new().build(spec).unwrap();
    assert_eq!(session.store().len(), 4);

    session.fit(&mut Descend).unwrap();
    drop(session);

    let store = reopen(dir.path());
    assert_eq!(store.len(), 5);
    assert_eq!(weights(&store, 1), [0., 0.]);
    assert_eq!(weights(&store, 10), [9., 9.]);
    assert_eq!(weights(&store, 11), [11., 11.]);
    assert_eq!(weights(&store, 99), [-1., -1.]);
}

#[test]
fn resumed_session_continues_where_it_left() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec(dir.path(), 1);
    spec.fit.num_epochs = NonZeroUsize::new(1).unwrap();
    write_u32_keyset(&spec.reader.keysets[0], &[7, 8]);

    SessionBuilder::new()
        .build(spec.clone())
        .unwrap()
        .fit(&mut Descend)
        .unwrap();

    spec.mos.train_from_scratch = false;
    SessionBuilder::new()
        .build(spec)
        .unwrap()
        .fit(&mut Descend)
        .unwrap();

    assert_eq!(weights(&reopen(dir.path()), 8), [-2., -2.]);
}

#[test]
fn pipelined_background_fit_with_i64_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec(dir.path(), 3);
    spec.solver.i64_input_key = true;
    spec.mos.prefetch_ahead = true;
    spec.mos.background_snapshot = true;
    spec.mos.eviction = EvictionSpec::Lru;
    spec.fit.snapshot = NonZeroUsize::new(1);

    write_i64_keyset(&spec.reader.keysets[0], &[-1, 2]);
    write_i64_keyset(&spec.reader.keysets[1], &[3, 4]);
    write_i64_keyset(&spec.reader.keysets[2], &[5, -1]);

    let mut session = SessionBuilder::new().build(spec).unwrap();
    let report = session.fit(&mut Descend).unwrap();
    assert_eq!(report.iterations, 12);
    drop(session);

    let store = reopen(dir.path());
    assert_eq!(store.len(), 5);
    assert_eq!(weights(&store, Key::MAX), [-4., -4.]);
    assert_eq!(weights(&store, 4), [-2., -2.]);
}

#[test]
fn malformed_keyset_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec(dir.path(), 1);
    fs::write(&spec.reader.keysets[0], [0u8; 7]).unwrap();

    let err = SessionBuilder::new().build(spec).err().unwrap();
    assert!(matches!(err, oversubscriber::MosErr::MalformedKeyset { len: 7, .. }));
}
