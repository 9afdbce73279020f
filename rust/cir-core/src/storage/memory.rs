// rust/cir-core/src/storage/memory.rs

//! In-memory storage backend.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{StorageBackend, StorageReader, StorageWriter};
use crate::error::{Result, RuntimeError};

#[derive(Default)]
struct Inner {
    objects: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

/// Storage backend that keeps every object in memory.
///
/// Clones share the same contents. Writes can be made to fail on demand with
/// [`MemoryStorage::set_fail_writes`], which simulates a full or read-only
/// disk without touching the filesystem.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
    fail_writes: Arc<AtomicBool>,
    completed_writes: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `open_write` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of writers that reached `finish` successfully.
    pub fn completed_writes(&self) -> usize {
        self.completed_writes.load(Ordering::SeqCst)
    }

    /// Returns a copy of the object stored at `path`, if any.
    pub fn get(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().objects.get(path).cloned()
    }

    /// Stores `data` at `path` directly, bypassing writers.
    pub fn put(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.lock().objects.insert(path.into(), data);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic in another test thread must not hide the stored objects.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StorageBackend for MemoryStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        let inner = self.lock();
        Ok(inner.objects.contains_key(path)
            || inner.dirs.contains(path)
            || inner.objects.keys().any(|k| k.starts_with(path)))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let data = self
            .get(path)
            .ok_or_else(|| RuntimeError::storage(path, "object not found"))?;
        Ok(Box::new(MemoryReader {
            size: data.len() as u64,
            cursor: Cursor::new(data),
        }))
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RuntimeError::storage_with_source(
                path,
                "failed to create file",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "writes disabled"),
            ));
        }
        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            path: path.to_path_buf(),
            buf: Vec::new(),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        if inner.objects.remove(path).is_some() || inner.dirs.remove(path) {
            Ok(())
        } else {
            Err(RuntimeError::storage(path, "object not found"))
        }
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let inner = self.lock();
        let mut entries: Vec<String> = inner
            .objects
            .keys()
            .filter(|k| k.parent() == Some(prefix))
            .filter_map(|k| k.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.lock();
        let data = inner
            .objects
            .remove(from)
            .ok_or_else(|| RuntimeError::storage(from, "object not found"))?;
        inner.objects.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                inner.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }
}

struct MemoryReader {
    cursor: Cursor<Vec<u8>>,
    size: u64,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl StorageReader for MemoryReader {
    fn size(&self) -> u64 {
        self.size
    }
}

struct MemoryWriter {
    storage: MemoryStorage,
    path: PathBuf,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageWriter for MemoryWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        let MemoryWriter { storage, path, buf } = *self;
        storage.put(path, buf);
        storage.completed_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let storage = MemoryStorage::new();
        let path = Path::new("checkpoints/checkpoint_0.bin");

        let mut writer = storage.open_write(path).unwrap();
        writer.write_all(b"record").unwrap();
        writer.finish().unwrap();

        let mut reader = storage.open_read(path).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();

        assert_eq!(buf, b"record");
        assert_eq!(reader.size(), 6);
        assert_eq!(storage.completed_writes(), 1);
        assert!(storage.exists(Path::new("checkpoints")).unwrap());
    }

    #[test]
    fn test_unfinished_writer_stores_nothing() {
        let storage = MemoryStorage::new();
        let path = Path::new("a.bin");

        let mut writer = storage.open_write(path).unwrap();
        writer.write_all(b"partial").unwrap();
        drop(writer);

        assert!(storage.get(path).is_none());
        assert_eq!(storage.completed_writes(), 0);
    }

    #[test]
    fn test_fail_writes() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        assert!(storage.open_write(Path::new("a.bin")).is_err());

        storage.set_fail_writes(false);
        assert!(storage.open_write(Path::new("a.bin")).is_ok());
    }

    #[test]
    fn test_rename_and_list() {
        let storage = MemoryStorage::new();
        storage.put("dir/.b.tmp", b"b".to_vec());
        storage.put("dir/a", b"a".to_vec());
        storage.put("other/c", b"c".to_vec());

        storage
            .rename(Path::new("dir/.b.tmp"), Path::new("dir/b"))
            .unwrap();

        assert_eq!(storage.list(Path::new("dir")).unwrap(), vec!["a", "b"]);
        assert!(storage.rename(Path::new("dir/zz"), Path::new("dir/b")).is_err());
    }

    #[test]
    fn test_clones_share_contents() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();
        clone.put("x", vec![1, 2, 3]);
        assert_eq!(storage.get(Path::new("x")), Some(vec![1, 2, 3]));
    }
}
