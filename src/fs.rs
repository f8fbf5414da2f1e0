//! Storage adapter trait and built-in backends.
//!
//! The engine only ever persists two opaque blobs:
//! - the addressing blob (fixed 2 MB, rewritten whole)
//! - the data blob (append-only, read and wiped by range)
//!
//! Backends:
//! - `InMemoryStorage`: for tests, clones share the same blobs
//! - `FileStorage`: two files in a directory owned by a single process
//! - JS imports (WASM builds, see `wasm.rs`)
//!
//! # Security Notes
//!
//! - Adapters hold ciphertext and noise only; all encryption happens above
//! - `secure_wipe` overwrites before removing where the backend allows it

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

/// The two blobs an adapter stores
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Addressing,
    Data,
}

fn not_found(kind: BlobKind) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{:?} blob does not exist", kind))
}

fn out_of_range(offset: u64, len: u64, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {}+{} exceeds data blob size {}", offset, len, size),
    )
}

/// Bounds-checked `offset..offset + len` inside a blob of `size` bytes
fn checked_range(offset: u64, len: u64, size: u64) -> io::Result<(usize, usize)> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok((offset as usize, end as usize)),
        _ => Err(out_of_range(offset, len, size)),
    }
}

/// Persistence backend for the two blobs
///
/// Missing blobs are reported as `io::ErrorKind::NotFound` by the read
/// methods. The range methods have default implementations on top of the
/// whole-blob calls; backends override them to avoid copying the data blob.
pub trait StorageAdapter {
    /// Prepare the backend (create directories, open handles)
    fn initialize(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn has_addressing_blob(&self) -> io::Result<bool>;

    fn read_addressing_blob(&self) -> io::Result<Vec<u8>>;

    fn write_addressing_blob(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn has_data_blob(&self) -> io::Result<bool>;

    fn read_data_blob(&self) -> io::Result<Vec<u8>>;

    fn write_data_blob(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Current data blob size, 0 if absent
    fn data_blob_size(&self) -> io::Result<u64>;

    /// Destroy both blobs
    fn secure_wipe(&mut self) -> io::Result<()>;

    /// Append to the data blob, returning the offset the bytes landed at
    fn append_data(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let mut blob = self.read_data_blob()?;
        let start = blob.len() as u64;
        blob.extend_from_slice(bytes);
        self.write_data_blob(&blob)?;
        Ok(start)
    }

    fn read_data_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let blob = self.read_data_blob()?;
        let (start, end) = checked_range(offset, len, blob.len() as u64)?;
        Ok(blob[start..end].to_vec())
    }

    /// Overwrite bytes inside the data blob (never extends it)
    fn write_data_range(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut blob = self.read_data_blob()?;
        let (start, end) = checked_range(offset, bytes.len() as u64, blob.len() as u64)?;
        blob[start..end].copy_from_slice(bytes);
        self.write_data_blob(&blob)
    }
}

// ============================================================
// IN-MEMORY
// ============================================================

/// In-memory storage for testing
/// Uses Rc<RefCell<...>> so clones share the same underlying storage
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    blobs: Rc<RefCell<HashMap<BlobKind, Vec<u8>>>>,
    /// Write counters per blob (for testing write optimization)
    write_counts: Rc<RefCell<HashMap<BlobKind, usize>>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of a blob (for testing)
    #[must_use]
    pub fn get_blob(&self, kind: BlobKind) -> Option<Vec<u8>> {
        self.blobs.borrow().get(&kind).cloned()
    }

    /// Number of writes to a blob since creation or the last reset
    #[must_use]
    pub fn write_count(&self, kind: BlobKind) -> usize {
        *self.write_counts.borrow().get(&kind).unwrap_or(&0)
    }

    pub fn reset_write_count(&self, kind: BlobKind) {
        self.write_counts.borrow_mut().insert(kind, 0);
    }

    fn count_write(&self, kind: BlobKind) {
        *self.write_counts.borrow_mut().entry(kind).or_insert(0) += 1;
    }

    fn read(&self, kind: BlobKind) -> io::Result<Vec<u8>> {
        self.get_blob(kind).ok_or_else(|| not_found(kind))
    }

    fn write(&mut self, kind: BlobKind, bytes: &[u8]) {
        self.blobs.borrow_mut().insert(kind, bytes.to_vec());
        self.count_write(kind);
    }
}

impl StorageAdapter for InMemoryStorage {
    fn has_addressing_blob(&self) -> io::Result<bool> {
        Ok(self.blobs.borrow().contains_key(&BlobKind::Addressing))
    }

    fn read_addressing_blob(&self) -> io::Result<Vec<u8>> {
        self.read(BlobKind::Addressing)
    }

    fn write_addressing_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write(BlobKind::Addressing, bytes);
        Ok(())
    }

    fn has_data_blob(&self) -> io::Result<bool> {
        Ok(self.blobs.borrow().contains_key(&BlobKind::Data))
    }

    fn read_data_blob(&self) -> io::Result<Vec<u8>> {
        self.read(BlobKind::Data)
    }

    fn write_data_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write(BlobKind::Data, bytes);
        Ok(())
    }

    fn data_blob_size(&self) -> io::Result<u64> {
        Ok(self
            .blobs
            .borrow()
            .get(&BlobKind::Data)
            .map(|blob| blob.len() as u64)
            .unwrap_or(0))
    }

    fn secure_wipe(&mut self) -> io::Result<()> {
        let mut blobs = self.blobs.borrow_mut();
        for blob in blobs.values_mut() {
            blob.zeroize();
        }
        blobs.clear();
        Ok(())
    }

    fn append_data(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let start = {
            let mut blobs = self.blobs.borrow_mut();
            let blob = blobs.get_mut(&BlobKind::Data).ok_or_else(|| not_found(BlobKind::Data))?;
            let start = blob.len() as u64;
            blob.extend_from_slice(bytes);
            start
        };
        self.count_write(BlobKind::Data);
        Ok(start)
    }

    fn read_data_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let blobs = self.blobs.borrow();
        let blob = blobs.get(&BlobKind::Data).ok_or_else(|| not_found(BlobKind::Data))?;
        let (start, end) = checked_range(offset, len, blob.len() as u64)?;
        Ok(blob[start..end].to_vec())
    }

    fn write_data_range(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        {
            let mut blobs = self.blobs.borrow_mut();
            let blob = blobs.get_mut(&BlobKind::Data).ok_or_else(|| not_found(BlobKind::Data))?;
            let (start, end) = checked_range(offset, bytes.len() as u64, blob.len() as u64)?;
            blob[start..end].copy_from_slice(bytes);
        }
        self.count_write(BlobKind::Data);
        Ok(())
    }
}

// ============================================================
// FILE-BACKED
// ============================================================

/// File name of the addressing blob inside the storage directory
pub const ADDRESSING_FILE: &str = "addressing.bin";

/// File name of the data blob inside the storage directory
pub const DATA_FILE: &str = "data.bin";

const WIPE_CHUNK_SIZE: usize = 64 * 1024;

/// Atomically rename a file, removing the destination first on platforms
/// where rename refuses to replace it.
fn rename_with_fallback(temp_path: &Path, destination: &Path) -> io::Result<()> {
    if let Err(initial_err) = fs::rename(temp_path, destination) {
        let _ = fs::remove_file(destination);
        fs::rename(temp_path, destination).map_err(|retry_err| {
            let _ = fs::remove_file(temp_path);
            io::Error::new(
                retry_err.kind(),
                format!(
                    "Atomic rename failed (initial: {}, retry: {})",
                    initial_err, retry_err
                ),
            )
        })?;
    }
    Ok(())
}

/// Overwrite a file in place with random bytes, then remove it
fn overwrite_and_remove(path: &Path) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut chunk = vec![0u8; WIPE_CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(WIPE_CHUNK_SIZE as u64) as usize;
        OsRng.fill_bytes(&mut chunk[..n]);
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}

/// Directory-backed storage: `addressing.bin` and `data.bin`
///
/// One process must own the directory; concurrent writers from several
/// processes are not coordinated.
#[derive(Clone, Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, kind: BlobKind) -> PathBuf {
        match kind {
            BlobKind::Addressing => self.dir.join(ADDRESSING_FILE),
            BlobKind::Data => self.dir.join(DATA_FILE),
        }
    }

    fn read(&self, kind: BlobKind) -> io::Result<Vec<u8>> {
        fs::read(self.path(kind)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(kind),
            _ => e,
        })
    }

    /// Write to a temp file, sync, then rename over the target
    fn write_atomic(&self, kind: BlobKind, bytes: &[u8]) -> io::Result<()> {
        let target = self.path(kind);
        let temp = target.with_extension("bin.tmp");
        {
            let mut file = File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        rename_with_fallback(&temp, &target)
    }

    fn open_data(&self, write: bool) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.path(BlobKind::Data))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => not_found(BlobKind::Data),
                _ => e,
            })
    }
}

impl StorageAdapter for FileStorage {
    fn initialize(&mut self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    fn has_addressing_blob(&self) -> io::Result<bool> {
        Ok(self.path(BlobKind::Addressing).is_file())
    }

    fn read_addressing_blob(&self) -> io::Result<Vec<u8>> {
        self.read(BlobKind::Addressing)
    }

    fn write_addressing_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_atomic(BlobKind::Addressing, bytes)
    }

    fn has_data_blob(&self) -> io::Result<bool> {
        Ok(self.path(BlobKind::Data).is_file())
    }

    fn read_data_blob(&self) -> io::Result<Vec<u8>> {
        self.read(BlobKind::Data)
    }

    fn write_data_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_atomic(BlobKind::Data, bytes)
    }

    fn data_blob_size(&self) -> io::Result<u64> {
        match fs::metadata(self.path(BlobKind::Data)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn secure_wipe(&mut self) -> io::Result<()> {
        overwrite_and_remove(&self.path(BlobKind::Addressing))?;
        overwrite_and_remove(&self.path(BlobKind::Data))
    }

    fn append_data(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path(BlobKind::Data))
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => not_found(BlobKind::Data),
                _ => e,
            })?;
        let start = file.metadata()?.len();
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(start)
    }

    fn read_data_range(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        let mut file = self.open_data(false)?;
        let size = file.metadata()?.len();
        let (start, end) = checked_range(offset, len, size)?;

        let mut buf = vec![0u8; end - start];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_data_range(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.open_data(true)?;
        let size = file.metadata()?.len();
        checked_range(offset, bytes.len() as u64, size)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_in_memory_missing_blobs() {
        let storage = InMemoryStorage::new();
        assert!(!storage.has_addressing_blob().unwrap());
        assert!(!storage.has_data_blob().unwrap());
        assert_eq!(storage.data_blob_size().unwrap(), 0);
        assert_eq!(
            storage.read_addressing_blob().unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_in_memory_clones_share_state() {
        let mut storage = InMemoryStorage::new();
        let view = storage.clone();

        storage.write_addressing_blob(&[1, 2, 3]).unwrap();
        assert_eq!(view.read_addressing_blob().unwrap(), vec![1, 2, 3]);
        assert_eq!(view.write_count(BlobKind::Addressing), 1);

        view.reset_write_count(BlobKind::Addressing);
        assert_eq!(storage.write_count(BlobKind::Addressing), 0);
    }

    #[test]
    fn test_in_memory_ranges() {
        let mut storage = InMemoryStorage::new();
        storage.write_data_blob(&[0, 1, 2, 3]).unwrap();

        assert_eq!(storage.append_data(&[4, 5]).unwrap(), 4);
        assert_eq!(storage.read_data_range(3, 3).unwrap(), vec![3, 4, 5]);

        storage.write_data_range(1, &[9, 9]).unwrap();
        assert_eq!(storage.read_data_blob().unwrap(), vec![0, 9, 9, 3, 4, 5]);

        assert!(storage.read_data_range(5, 2).is_err());
        assert!(storage.read_data_range(u64::MAX, 2).is_err());
        assert!(storage.write_data_range(5, &[1, 1]).is_err());
        assert_eq!(storage.data_blob_size().unwrap(), 6);
    }

    #[test]
    fn test_in_memory_append_requires_blob() {
        let mut storage = InMemoryStorage::new();
        assert!(storage.append_data(&[1]).is_err());
    }

    #[test]
    fn test_in_memory_secure_wipe() {
        let mut storage = InMemoryStorage::new();
        storage.write_addressing_blob(&[1; 32]).unwrap();
        storage.write_data_blob(&[2; 32]).unwrap();

        storage.secure_wipe().unwrap();
        assert!(!storage.has_addressing_blob().unwrap());
        assert!(!storage.has_data_blob().unwrap());
    }

    /// Adapter that only implements the whole-blob calls
    #[derive(Default)]
    struct WholeBlobOnly {
        data: Option<Vec<u8>>,
    }

    impl StorageAdapter for WholeBlobOnly {
        fn has_addressing_blob(&self) -> io::Result<bool> {
            Ok(false)
        }
        fn read_addressing_blob(&self) -> io::Result<Vec<u8>> {
            Err(not_found(BlobKind::Addressing))
        }
        fn write_addressing_blob(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn has_data_blob(&self) -> io::Result<bool> {
            Ok(self.data.is_some())
        }
        fn read_data_blob(&self) -> io::Result<Vec<u8>> {
            self.data.clone().ok_or_else(|| not_found(BlobKind::Data))
        }
        fn write_data_blob(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.data = Some(bytes.to_vec());
            Ok(())
        }
        fn data_blob_size(&self) -> io::Result<u64> {
            Ok(self.data.as_ref().map(|d| d.len() as u64).unwrap_or(0))
        }
        fn secure_wipe(&mut self) -> io::Result<()> {
            self.data = None;
            Ok(())
        }
    }

    #[test]
    fn test_default_range_methods() {
        let mut storage = WholeBlobOnly::default();
        storage.write_data_blob(&[7; 10]).unwrap();

        assert_eq!(storage.append_data(&[8; 5]).unwrap(), 10);
        storage.write_data_range(9, &[0, 0]).unwrap();
        assert_eq!(storage.read_data_range(8, 4).unwrap(), vec![7, 0, 0, 8]);
        assert!(storage.read_data_range(14, 2).is_err());
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("store"));
        storage.initialize().unwrap();

        assert!(!storage.has_addressing_blob().unwrap());
        assert_eq!(storage.data_blob_size().unwrap(), 0);

        storage.write_addressing_blob(&[1, 2, 3]).unwrap();
        storage.write_data_blob(&[10, 11]).unwrap();
        assert_eq!(storage.read_addressing_blob().unwrap(), vec![1, 2, 3]);

        assert_eq!(storage.append_data(&[12, 13, 14]).unwrap(), 2);
        assert_eq!(storage.read_data_range(1, 3).unwrap(), vec![11, 12, 13]);
        storage.write_data_range(0, &[0]).unwrap();
        assert_eq!(storage.read_data_blob().unwrap(), vec![0, 11, 12, 13, 14]);
        assert!(storage.read_data_range(4, 2).is_err());

        // Rewriting the addressing blob leaves no temp file behind
        storage.write_addressing_blob(&[4, 5, 6]).unwrap();
        assert_eq!(storage.read_addressing_blob().unwrap(), vec![4, 5, 6]);
        assert!(!storage.dir().join("addressing.bin.tmp").exists());
    }

    #[test]
    fn test_file_storage_secure_wipe() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path());
        storage.initialize().unwrap();
        storage.write_addressing_blob(&[1; 100]).unwrap();
        storage.write_data_blob(&[2; WIPE_CHUNK_SIZE + 3]).unwrap();

        storage.secure_wipe().unwrap();
        assert!(!storage.has_addressing_blob().unwrap());
        assert!(!storage.has_data_blob().unwrap());
        assert!(!dir.path().join(DATA_FILE).exists());

        // Wiping again is a no-op
        storage.secure_wipe().unwrap();
    }
}
