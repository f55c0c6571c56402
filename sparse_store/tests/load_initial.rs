use std::{num::NonZeroUsize, path::Path};

use sparse_store::{EmbeddingRow, FileStore, Key, RowLayout, RowStore, StoreErr};

fn layout() -> RowLayout {
    RowLayout::new(NonZeroUsize::new(4).unwrap(), 9)
}

fn row(seed: f32) -> EmbeddingRow {
    EmbeddingRow::new(vec![seed; 4], (0..9).map(|i| seed + i as f32).collect())
}

fn trained_model(path: &Path, keys: &[Key]) {
    let store = FileStore::create(path, layout(), None).unwrap();
    let rows: Vec<_> = keys.iter().map(|k| (*k, row(*k as f32))).collect();
    let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
    store.write_rows(&batch).unwrap();
    store.checkpoint().unwrap();
}

#[test]
fn merges_disjoint_sparse_models() {
    let dir = tempfile::tempdir().unwrap();
    let wdl_0 = dir.path().join("wdl_0_sparse_model");
    let wdl_1 = dir.path().join("wdl_1_sparse_model");
    trained_model(&wdl_0, &[1, 2, 3]);
    trained_model(&wdl_1, &[100, 200]);

    let store = FileStore::create(dir.path().join("working"), layout(), None).unwrap();
    let loaded = store.load_initial(&[&wdl_0, &wdl_1]).unwrap();

    assert_eq!(loaded, 5);
    assert_eq!(store.len(), 5);

    let rows = store.read_rows(&[1, 3, 200]).unwrap();
    assert_eq!(rows[&1], row(1.));
    assert_eq!(rows[&3], row(3.));
    assert_eq!(rows[&200], row(200.));

    // Optimizer state survives the merge untouched.
    assert_eq!(rows[&200].state()[8], 208.);
    assert_eq!(store.last_checkpoint().unwrap().unwrap().rows, 5);
}

#[test]
fn colliding_sparse_models_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let wdl_0 = dir.path().join("wdl_0_sparse_model");
    let wdl_1 = dir.path().join("wdl_1_sparse_model");
    trained_model(&wdl_0, &[1, 2, 3]);
    trained_model(&wdl_1, &[3, 4]);

    let store = FileStore::create(dir.path().join("working"), layout(), None).unwrap();
    let err = store.load_initial(&[&wdl_0, &wdl_1]).unwrap_err();

    assert!(matches!(err, StoreErr::CorruptEntry { key: Some(3), .. }));
    assert!(!err.is_recoverable());

    // Nothing is copied when validation fails.
    assert!(store.is_empty());
}

#[test]
fn missing_sparse_model_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::create(dir.path().join("working"), layout(), None).unwrap();

    let err = store
        .load_initial(&[dir.path().join("wdl_9_sparse_model")])
        .unwrap_err();
    assert!(matches!(err, StoreErr::StorageUnavailable { .. }));
}

#[test]
fn concurrent_writers_on_distinct_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("working");
    let store = FileStore::create(&path, layout(), None).unwrap();

    std::thread::scope(|s| {
        for t in 0..4u64 {
            let store = &store;
            s.spawn(move || {
                for k in 0..50 {
                    let key = t * 1000 + k;
                    store.write_rows(&[(key, &row(key as f32))]).unwrap();
                }
            });
        }
    });

    drop(store);
    let store = FileStore::open(&path, layout(), None).unwrap();
    assert_eq!(store.len(), 200);
    assert_eq!(store.read_rows(&[3049]).unwrap()[&3049], row(3049.));
}
