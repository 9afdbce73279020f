// rust/cir-core/src/storage/traits.rs

//! Storage abstraction traits for the checkpointed iteration runtime.
//!
//! Checkpoint records are written through these traits so the store can run
//! against the local filesystem or an in-memory backend interchangeably.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::Result;

/// A readable stored object.
///
/// The size is known up front so a reader can reject records of the wrong
/// length without pulling them into memory.
pub trait StorageReader: Read + Send {
    fn size(&self) -> u64;
}

/// A handle for writing to storage.
///
/// This trait extends `Write` with a method to finalize the write operation.
pub trait StorageWriter: Write + Send {
    /// Finishes the write operation, ensuring all data is persisted.
    ///
    /// This method must be called to complete the write. After calling
    /// `finish`, the writer should not be used again.
    ///
    /// # Errors
    ///
    /// Returns an error if the finalization fails (e.g. flush or sync fails).
    fn finish(self: Box<Self>) -> Result<()>;
}

/// The core storage backend trait.
///
/// # Object Safety
///
/// This trait is object-safe and can be used with `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing.
    ///
    /// If the object already exists, it will be overwritten.
    /// Parent directories will be created if they don't exist.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes an object.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists object names directly under `prefix`, sorted.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Renames an object, replacing any object already at `to`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;
}
