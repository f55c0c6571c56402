use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::RowLayout;

/// A consistent point of a store, published next to the store file after a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic counter of checkpoints taken on this store.
    pub generation: u64,
    /// The last write sequence covered by this checkpoint.
    pub seq: u64,
    /// The amount of keys indexed at checkpoint time.
    pub rows: usize,
    /// The amount of slots handed out at checkpoint time, every one of them was written.
    #[serde(default)]
    pub slots: u64,
    pub layout: RowLayout,
}

/// The manifest path for the store at `store`.
pub(crate) fn manifest_path(store: &Path) -> PathBuf {
    with_suffix(store, ".checkpoint")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Reads the manifest of the store at `store`.
///
/// # Returns
/// `None` if no checkpoint was ever published for that store.
pub(crate) fn read(store: &Path) -> io::Result<Option<Checkpoint>> {
    let file = match File::open(manifest_path(store)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let checkpoint = serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(checkpoint))
}

/// Atomically replaces the manifest of the store at `store`.
///
/// The manifest is written to a temporary file which is synced and then renamed over the old one,
/// readers either see the previous checkpoint or the new one.
pub(crate) fn publish(store: &Path, checkpoint: &Checkpoint) -> io::Result<()> {
    let manifest = manifest_path(store);
    let tmp = with_suffix(&manifest, ".tmp");

    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, checkpoint)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&tmp, &manifest)?;
    sync_parent(&manifest)
}

/// Removes a stale manifest, used when a store is recreated from scratch.
pub(crate) fn discard(store: &Path) -> io::Result<()> {
    match fs::remove_file(manifest_path(store)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
