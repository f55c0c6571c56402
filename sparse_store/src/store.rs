use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::{
    Checkpoint, EmbeddingRow, Key, KeyIndex, Result, RowLayout, Slot, StoreErr, checkpoint,
    codec::{self, Decoded, FileHeader, HEADER_SIZE},
};

/// Amount of striped locks serializing writes to the same key.
const LOCK_STRIPES: usize = 64;

/// Amount of slots read per request while recovering the index.
const RECOVERY_BATCH: u64 = 1024;

/// Amount of rows moved per batch when copying between stores.
const COPY_BATCH: usize = 4096;

/// The durable home of every embedding row of a sparse model.
///
/// Implementors are the single source of truth for any key that isn't dirty in a cache.
pub trait RowStore: Send + Sync {
    /// The shape of every row in this store.
    fn layout(&self) -> RowLayout;

    /// The key to slot mapping of this store.
    fn index(&self) -> &KeyIndex;

    /// Reads a batch of rows.
    ///
    /// # Arguments
    /// * `keys` - The keys to read, duplicates are allowed.
    ///
    /// # Returns
    /// The rows by key, or the first failure among `NotFound`, `StorageUnavailable`
    /// and `CorruptEntry`.
    fn read_rows(&self, keys: &[Key]) -> Result<HashMap<Key, EmbeddingRow>>;

    /// Durably upserts a batch of rows, unknown keys are indexed first.
    ///
    /// # Arguments
    /// * `rows` - The rows to write along their keys.
    ///
    /// # Returns
    /// An error if any of the rows couldn't be written, rows written before the
    /// failure stay written.
    fn write_rows(&self, rows: &[(Key, &EmbeddingRow)]) -> Result<()>;

    /// Syncs every write so far and publishes a consistent checkpoint marker.
    fn checkpoint(&self) -> Result<Checkpoint>;
}

/// A `RowStore` backed by a single file of fixed size slots.
///
/// Each slot keeps two checksummed copies of its row. A write always overwrites the
/// stale copy, so a crash in the middle of a write leaves the previous copy readable.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: File,
    layout: RowLayout,
    index: KeyIndex,
    next_seq: AtomicU64,
    generation: AtomicU64,
    locks: Box<[Mutex<()>]>,
    /// Held shared by every write and exclusively by a checkpoint.
    writes: RwLock<()>,
}

impl FileStore {
    /// Creates a new empty store, truncating anything found at `path`.
    ///
    /// # Arguments
    /// * `path` - Where the store file lives.
    /// * `layout` - The shape of every row.
    /// * `limit` - An optional maximum amount of keys.
    ///
    /// # Returns
    /// A new `FileStore` or `StorageUnavailable` if the file can't be created.
    pub fn create(path: impl AsRef<Path>, layout: RowLayout, limit: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |e| StoreErr::unavailable(path, None, e);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(unavailable)?;

        write_all_at(&file, &FileHeader::new(layout).encode(), 0).map_err(unavailable)?;
        file.sync_all().map_err(unavailable)?;
        checkpoint::discard(path).map_err(unavailable)?;

        debug!(path:? = path; "created sparse model store");
        Ok(Self::with_file(path, file, layout, limit))
    }

    /// Opens an existing store and rebuilds its key index.
    ///
    /// # Arguments
    /// * `path` - Where the store file lives.
    /// * `layout` - The expected shape of every row.
    /// * `limit` - An optional maximum amount of keys.
    ///
    /// # Returns
    /// The store, `StorageUnavailable` if it can't be opened, or `CorruptEntry` if its
    /// header or any of its slots fail validation.
    pub fn open(path: impl AsRef<Path>, layout: RowLayout, limit: Option<usize>) -> Result<Self> {
        Self::open_with(path.as_ref(), layout, limit, true)
    }

    /// Opens an existing store, or creates it if there's no file at `path`.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        layout: RowLayout,
        limit: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::open(path, layout, limit)
        } else {
            Self::create(path, layout, limit)
        }
    }

    fn open_with(path: &Path, layout: RowLayout, limit: Option<usize>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| StoreErr::unavailable(path, None, e))?;

        let store = Self::with_file(path, file, layout, limit);
        store.recover(writable)?;
        Ok(store)
    }

    fn with_file(path: &Path, file: File, layout: RowLayout, limit: Option<usize>) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            layout,
            index: KeyIndex::new(limit),
            next_seq: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            writes: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The amount of keys held by this store.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Reads the last published checkpoint of this store.
    pub fn last_checkpoint(&self) -> Result<Option<Checkpoint>> {
        checkpoint::read(&self.path).map_err(|e| self.unavailable(None, e))
    }

    /// Bootstraps this store with the rows of previously persisted sparse models.
    ///
    /// Every source is validated before anything is copied. A key found in more than one
    /// source, or already present in this store, is reported as a `CorruptEntry`.
    ///
    /// # Arguments
    /// * `sources` - The paths of the sparse models to merge in.
    ///
    /// # Returns
    /// The amount of rows loaded.
    pub fn load_initial<P: AsRef<Path>>(&self, sources: &[P]) -> Result<usize> {
        let mut stores = Vec::with_capacity(sources.len());
        let mut seen: HashSet<Key> = self.index.keys().into_iter().collect();

        for source in sources {
            let source = source.as_ref();
            let store = Self::open_with(source, self.layout, None, false)?;

            for key in store.index.keys() {
                if !seen.insert(key) {
                    return Err(StoreErr::corrupt(
                        source,
                        Some(key),
                        "key collides with a row loaded from another sparse model",
                    ));
                }
            }

            info!(source:? = source, rows = store.len(); "validated trained sparse model");
            stores.push(store);
        }

        let mut loaded = 0;
        for store in &stores {
            loaded += store.copy_into(self)?;
        }

        self.checkpoint()?;
        info!(rows = loaded, sources = stores.len(); "loaded trained sparse models");
        Ok(loaded)
    }

    /// Writes a compacted copy of this store, without empty slots, to a new file.
    ///
    /// # Arguments
    /// * `dest` - The path of the new store, anything found there is truncated.
    ///
    /// # Returns
    /// The newly written store, already checkpointed.
    pub fn export(&self, dest: impl AsRef<Path>) -> Result<FileStore> {
        let out = Self::create(dest, self.layout, None)?;
        let rows = self.copy_into(&out)?;
        out.checkpoint()?;

        info!(dest:? = out.path(), rows = rows; "exported sparse model");
        Ok(out)
    }

    /// Copies every row of this store into `dest` in batches.
    fn copy_into(&self, dest: &impl RowStore) -> Result<usize> {
        let keys = self.index.keys();

        for chunk in keys.chunks(COPY_BATCH) {
            let rows = self.read_rows(chunk)?;
            let batch: Vec<_> = chunk.iter().map(|k| (*k, &rows[k])).collect();
            dest.write_rows(&batch)?;
        }

        Ok(keys.len())
    }

    fn unavailable(&self, key: Option<Key>, e: io::Error) -> StoreErr {
        StoreErr::unavailable(&self.path, key, e)
    }

    fn record_size(&self) -> usize {
        codec::record_size(self.layout)
    }

    fn slot_offset(&self, slot: Slot) -> u64 {
        HEADER_SIZE + slot.0 * codec::slot_size(self.layout)
    }

    fn lock_for(&self, key: Key) -> &Mutex<()> {
        &self.locks[(key % LOCK_STRIPES as u64) as usize]
    }

    /// Scans every slot of the file and rebuilds the index and the write sequence.
    ///
    /// A damaged slot is only taken as a torn first write if it was handed out after the
    /// last checkpoint, older slots were synced and must hold a valid copy. A writable store
    /// whose last slot is short is padded, so updates of that slot never land on its only
    /// committed copy.
    fn recover(&self, writable: bool) -> Result<()> {
        let len = self.file.metadata().map_err(|e| self.unavailable(None, e))?.len();

        let mut header = vec![0; HEADER_SIZE.min(len) as usize];
        read_exact_at(&self.file, &mut header, 0).map_err(|e| self.unavailable(None, e))?;
        FileHeader::validate(&header, self.layout)
            .map_err(|detail| StoreErr::corrupt(&self.path, None, detail))?;

        let checkpoint = self.last_checkpoint()?;
        let synced = checkpoint.as_ref().map_or(0, |c| c.slots);

        let slot_size = codec::slot_size(self.layout);
        let data = len.saturating_sub(HEADER_SIZE);
        let nslots = data.div_ceil(slot_size);

        let mut max_seq = 0;
        let mut torn = Vec::new();
        let mut buf = Vec::new();
        let mut first = 0;

        while first < nslots {
            let count = RECOVERY_BATCH.min(nslots - first);
            let offset = self.slot_offset(Slot(first));
            let available = (len - offset).min(count * slot_size) as usize;

            // A crash while extending the file may leave the last slot short, the
            // missing bytes decode as an empty copy.
            buf.clear();
            buf.resize((count * slot_size) as usize, 0);
            read_exact_at(&self.file, &mut buf[..available], offset)
                .map_err(|e| self.unavailable(None, e))?;

            for (i, slot_buf) in buf.chunks_exact(slot_size as usize).enumerate() {
                let slot = Slot(first + i as u64);

                match self.newest_copy(slot_buf) {
                    Newest::Committed { seq, key, .. } => {
                        max_seq = max_seq.max(seq);
                        if self.index.restore(key, slot).is_some() {
                            return Err(StoreErr::corrupt(
                                &self.path,
                                Some(key),
                                "key is stored in more than one slot",
                            ));
                        }
                    }
                    Newest::Uncommitted if slot.0 < synced => {
                        return Err(StoreErr::corrupt(
                            &self.path,
                            None,
                            format!("slot {} was checkpointed but has no valid copy", slot.0),
                        ));
                    }
                    Newest::Uncommitted => {
                        warn!(slot = slot.0; "skipping a slot whose first write never completed");
                        torn.push(slot);
                    }
                    Newest::Empty => {}
                    Newest::Corrupt => {
                        return Err(StoreErr::corrupt(
                            &self.path,
                            None,
                            format!("slot {} has no valid copy", slot.0),
                        ));
                    }
                }
            }

            first += count;
        }

        if writable {
            self.repair(&torn, len, nslots)?;
        }

        self.index.reserve_slots(nslots);
        self.next_seq.store(max_seq + 1, Ordering::Release);

        if let Some(checkpoint) = checkpoint {
            self.generation.store(checkpoint.generation, Ordering::Release);
        }

        debug!(
            path:? = self.path,
            rows = self.index.len(),
            torn = torn.len();
            "recovered sparse model store"
        );
        Ok(())
    }

    /// Empties the torn slots and pads a short last slot with empty copies.
    ///
    /// Both are needed before the next checkpoint counts these slots as written.
    fn repair(&self, torn: &[Slot], len: u64, nslots: u64) -> Result<()> {
        let slot_size = codec::slot_size(self.layout);
        let padded = HEADER_SIZE + nslots * slot_size;

        if torn.is_empty() && len == padded {
            return Ok(());
        }

        let empty = vec![0; slot_size as usize];
        for slot in torn {
            write_all_at(&self.file, &empty, self.slot_offset(*slot))
                .map_err(|e| self.unavailable(None, e))?;
        }

        if len < padded {
            self.file.set_len(padded).map_err(|e| self.unavailable(None, e))?;
            warn!(path:? = self.path, missing = padded - len; "padded a short last slot");
        }

        self.file.sync_all().map_err(|e| self.unavailable(None, e))
    }

    /// Decodes both copies of a slot and picks the one to trust.
    fn newest_copy(&self, slot_buf: &[u8]) -> Newest {
        let (a, b) = slot_buf.split_at(self.record_size());

        match (codec::decode(a, self.layout), codec::decode(b, self.layout)) {
            (
                Decoded::Valid {
                    seq: seq_a,
                    key: key_a,
                    row: row_a,
                },
                Decoded::Valid {
                    seq: seq_b,
                    key: key_b,
                    row: row_b,
                },
            ) => {
                if seq_a >= seq_b {
                    Newest::committed(0, seq_a, key_a, row_a)
                } else {
                    Newest::committed(1, seq_b, key_b, row_b)
                }
            }
            (Decoded::Valid { seq, key, row }, _) => Newest::committed(0, seq, key, row),
            (_, Decoded::Valid { seq, key, row }) => Newest::committed(1, seq, key, row),
            (Decoded::Empty, Decoded::Empty) => Newest::Empty,
            (Decoded::Invalid, Decoded::Invalid) => Newest::Corrupt,
            _ => Newest::Uncommitted,
        }
    }

    /// Reads the whole slot of `key`.
    fn read_slot(&self, key: Key, slot: Slot, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        buf.resize(codec::slot_size(self.layout) as usize, 0);

        match read_exact_at(&self.file, buf, self.slot_offset(slot)) {
            // The slot was handed out but its first write didn't reach the file yet.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(StoreErr::NotFound(key)),
            Err(e) => Err(self.unavailable(Some(key), e)),
            Ok(()) => Ok(()),
        }
    }

    fn read_row(&self, key: Key, buf: &mut Vec<u8>) -> Result<EmbeddingRow> {
        let slot = self.index.resolve(key).ok_or(StoreErr::NotFound(key))?;
        self.read_slot(key, slot, buf)?;

        match self.newest_copy(buf) {
            Newest::Committed {
                key: stored, row, ..
            } if stored == key => Ok(row),
            Newest::Committed { key: stored, .. } => Err(StoreErr::corrupt(
                &self.path,
                Some(key),
                format!("slot {} holds key {stored}", slot.0),
            )),
            Newest::Empty => Err(StoreErr::NotFound(key)),
            Newest::Uncommitted | Newest::Corrupt => Err(StoreErr::corrupt(
                &self.path,
                Some(key),
                format!("slot {} has no valid copy", slot.0),
            )),
        }
    }

    fn write_row(&self, key: Key, row: &EmbeddingRow, buf: &mut Vec<u8>) -> Result<()> {
        row.check(key, self.layout)?;

        let _writing = self.writes.read();
        let _guard = self.lock_for(key).lock();
        let slot = self.index.insert(key)?;

        // The first write of a slot at the end of the file writes the whole slot, so the
        // file never ends in the middle of one.
        let (target, extend) = match self.read_slot(key, slot, buf) {
            Ok(()) => match self.newest_copy(buf) {
                Newest::Committed { copy, .. } => (1 - copy, false),
                _ => (0, false),
            },
            Err(StoreErr::NotFound(_)) => (0, true),
            Err(e) => return Err(e),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        codec::encode(seq, key, row, buf);

        if extend {
            buf.resize(codec::slot_size(self.layout) as usize, 0);
        }

        let offset = self.slot_offset(slot) + (target * self.record_size()) as u64;
        write_all_at(&self.file, buf, offset).map_err(|e| self.unavailable(Some(key), e))
    }
}

impl RowStore for FileStore {
    fn layout(&self) -> RowLayout {
        self.layout
    }

    fn index(&self) -> &KeyIndex {
        &self.index
    }

    fn read_rows(&self, keys: &[Key]) -> Result<HashMap<Key, EmbeddingRow>> {
        keys.par_iter()
            .map_init(Vec::new, |buf, key| {
                self.read_row(*key, buf).map(|row| (*key, row))
            })
            .collect()
    }

    fn write_rows(&self, rows: &[(Key, &EmbeddingRow)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        rows.par_iter()
            .try_for_each_init(Vec::new, |buf, (key, row)| self.write_row(*key, row, buf))?;

        self.file.sync_data().map_err(|e| self.unavailable(None, e))
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        let quiesced = self.writes.write();
        self.file.sync_all().map_err(|e| self.unavailable(None, e))?;

        let checkpoint = Checkpoint {
            generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            seq: self.next_seq.load(Ordering::Acquire) - 1,
            rows: self.index.len(),
            slots: self.index.allocated(),
            layout: self.layout,
        };
        drop(quiesced);

        checkpoint::publish(&self.path, &checkpoint).map_err(|e| self.unavailable(None, e))?;
        debug!(generation = checkpoint.generation, seq = checkpoint.seq; "published checkpoint");
        Ok(checkpoint)
    }
}

/// The copy of a slot to trust.
enum Newest {
    Committed {
        copy: usize,
        seq: u64,
        key: Key,
        row: EmbeddingRow,
    },
    /// Both copies were never written.
    Empty,
    /// One copy is empty and the other is damaged, the first write of the slot was torn
    /// unless a checkpoint already covered it.
    Uncommitted,
    /// Neither copy passes validation.
    Corrupt,
}

impl Newest {
    fn committed(copy: usize, seq: u64, key: Key, row: EmbeddingRow) -> Self {
        Self::Committed {
            copy,
            seq,
            key,
            row,
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    fn layout() -> RowLayout {
        RowLayout::new(NonZeroUsize::new(2).unwrap(), 1)
    }

    fn row(a: f32, b: f32) -> EmbeddingRow {
        EmbeddingRow::new(vec![a, b], vec![a * b])
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("store"), layout(), None).unwrap();

        let r = row(1.5, -2.);
        store.write_rows(&[(9, &r)]).unwrap();

        let rows = store.read_rows(&[9]).unwrap();
        assert_eq!(rows[&9], r);
    }

    #[test]
    fn upsert_alternates_copies() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("store"), layout(), None).unwrap();

        for i in 0..5 {
            let r = row(i as f32, 1.);
            store.write_rows(&[(3, &r)]).unwrap();
            assert_eq!(store.read_rows(&[3]).unwrap()[&3], r);
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.index().allocated(), 1);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("store"), layout(), None).unwrap();

        let err = store.read_rows(&[1]).unwrap_err();
        assert!(matches!(err, StoreErr::NotFound(1)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn wrong_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("store"), layout(), None).unwrap();

        let bad = EmbeddingRow::new(vec![1.], vec![]);
        let err = store.write_rows(&[(1, &bad)]).unwrap_err();
        assert!(matches!(err, StoreErr::SizeMismatch { key: 1, .. }));
        assert!(!store.index().contains(1));
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            let rows: Vec<_> = (0..10).map(|k| (k, row(k as f32, 0.5))).collect();
            let batch: Vec<_> = rows.iter().map(|(k, r)| (*k, r)).collect();
            store.write_rows(&batch).unwrap();
            store.write_rows(&[(4, &row(40., 4.))]).unwrap();
        }

        let store = FileStore::open(&path, layout(), None).unwrap();
        assert_eq!(store.len(), 10);
        assert_eq!(store.read_rows(&[4]).unwrap()[&4], row(40., 4.));
        assert_eq!(store.read_rows(&[7]).unwrap()[&7], row(7., 0.5));

        // New writes keep winning over the recovered ones.
        store.write_rows(&[(4, &row(41., 4.))]).unwrap();
        assert_eq!(store.read_rows(&[4]).unwrap()[&4], row(41., 4.));
    }

    #[test]
    fn open_rejects_other_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        FileStore::create(&path, layout(), None).unwrap();

        let other = RowLayout::new(NonZeroUsize::new(8).unwrap(), 0);
        let err = FileStore::open(&path, other, None).unwrap_err();
        assert!(matches!(err, StoreErr::CorruptEntry { .. }));
    }

    #[test]
    fn open_missing_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStore::open(dir.path().join("nope"), layout(), None).unwrap_err();
        assert!(matches!(err, StoreErr::StorageUnavailable { .. }));
    }

    #[test]
    fn torn_write_keeps_previous_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let store = FileStore::create(&path, layout(), None).unwrap();

        store.write_rows(&[(5, &row(1., 1.))]).unwrap();
        store.write_rows(&[(5, &row(2., 2.))]).unwrap();

        // The second write went to the second copy, damage its payload.
        let offset = store.slot_offset(Slot(0)) + store.record_size() as u64 + 20;
        write_all_at(&store.file, &[0xFF, 0xFF], offset).unwrap();

        assert_eq!(store.read_rows(&[5]).unwrap()[&5], row(1., 1.));
    }

    #[test]
    fn damaged_slot_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            store.write_rows(&[(5, &row(1., 1.))]).unwrap();
            store.write_rows(&[(5, &row(2., 2.))]).unwrap();

            let first = store.slot_offset(Slot(0)) + 20;
            let second = first + store.record_size() as u64;
            write_all_at(&store.file, &[0xFF], first).unwrap();
            write_all_at(&store.file, &[0xFF], second).unwrap();

            let err = store.read_rows(&[5]).unwrap_err();
            assert!(matches!(err, StoreErr::CorruptEntry { key: Some(5), .. }));
        }

        let err = FileStore::open(&path, layout(), None).unwrap_err();
        assert!(matches!(err, StoreErr::CorruptEntry { .. }));
    }

    #[test]
    fn damaged_checkpointed_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wdl_0_sparse_model");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            store.write_rows(&[(1, &row(1., 1.))]).unwrap();
            store.write_rows(&[(2, &row(2., 2.))]).unwrap();
            store.checkpoint().unwrap();

            // Key 1 only has its first copy, damage it.
            write_all_at(&store.file, &[0xFF], store.slot_offset(Slot(0)) + 20).unwrap();
        }

        let err = FileStore::open(&path, layout(), None).unwrap_err();
        assert!(matches!(err, StoreErr::CorruptEntry { .. }));

        let working = FileStore::create(dir.path().join("working"), layout(), None).unwrap();
        let err = working.load_initial(&[&path]).unwrap_err();
        assert!(matches!(err, StoreErr::CorruptEntry { .. }));
        assert!(!working.index().contains(1));
    }

    #[test]
    fn torn_first_write_after_checkpoint_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            store.write_rows(&[(1, &row(1., 1.))]).unwrap();
            store.checkpoint().unwrap();
            store.write_rows(&[(2, &row(2., 2.))]).unwrap();

            write_all_at(&store.file, &[0xFF], store.slot_offset(Slot(1)) + 20).unwrap();
        }

        {
            let store = FileStore::open(&path, layout(), None).unwrap();
            assert_eq!(store.len(), 1);
            assert!(!store.index().contains(2));

            store.write_rows(&[(3, &row(3., 3.))]).unwrap();
            assert_eq!(store.checkpoint().unwrap().slots, 3);
        }

        // The skipped slot was emptied, the newer checkpoint covering it is still readable.
        let store = FileStore::open(&path, layout(), None).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read_rows(&[3]).unwrap()[&3], row(3., 3.));
    }

    #[test]
    fn short_last_slot_keeps_its_committed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            store.write_rows(&[(1, &row(1., 1.))]).unwrap();

            let short = store.slot_offset(Slot(0)) + store.record_size() as u64;
            store.file.set_len(short).unwrap();
        }

        let store = FileStore::open(&path, layout(), None).unwrap();
        let slot_end = store.slot_offset(Slot(1));
        assert_eq!(store.file.metadata().unwrap().len(), slot_end);

        store.write_rows(&[(1, &row(2., 2.))]).unwrap();
        assert_eq!(store.read_rows(&[1]).unwrap()[&1], row(2., 2.));

        // The update went to the second copy, tearing it leaves the first one.
        let second = store.slot_offset(Slot(0)) + store.record_size() as u64 + 20;
        write_all_at(&store.file, &[0xFF, 0xFF], second).unwrap();

        assert_eq!(store.read_rows(&[1]).unwrap()[&1], row(1., 1.));
        assert_eq!(store.file.metadata().unwrap().len(), slot_end);
    }

    #[test]
    fn checkpoint_generations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::create(&path, layout(), None).unwrap();
            store.write_rows(&[(1, &row(1., 1.)), (2, &row(2., 2.))]).unwrap();

            let checkpoint = store.checkpoint().unwrap();
            assert_eq!(checkpoint.generation, 1);
            assert_eq!(checkpoint.seq, 2);
            assert_eq!(checkpoint.rows, 2);
        }

        let store = FileStore::open(&path, layout(), None).unwrap();
        assert_eq!(store.last_checkpoint().unwrap().unwrap().generation, 1);
        assert_eq!(store.checkpoint().unwrap().generation, 2);
    }

    #[test]
    fn export_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::create(dir.path().join("store"), layout(), None).unwrap();
        store.write_rows(&[(10, &row(1., 0.)), (20, &row(2., 0.))]).unwrap();

        let out = store.export(dir.path().join("exported")).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.read_rows(&[20]).unwrap()[&20], row(2., 0.));
        assert_eq!(out.last_checkpoint().unwrap().unwrap().rows, 2);
    }
}
