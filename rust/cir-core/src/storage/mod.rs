// rust/cir-core/src/storage/mod.rs

//! Storage abstraction for the checkpointed iteration runtime.
//!
//! Two backends implement [`StorageBackend`]:
//!
//! - [`LocalStorage`] stores objects as files under a base directory. This is
//!   what workers use, since checkpoints must outlive the process.
//! - [`MemoryStorage`] keeps objects in a map and can be told to fail writes,
//!   which makes the non-fatal checkpoint write path testable.
//!
//! # Example
//!
//! ```no_run
//! use cir_core::config::StorageConfig;
//! use cir_core::storage::{LocalStorage, StorageBackend};
//! use std::io::{Read, Write};
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! let mut writer = storage.open_write(Path::new("example.bin")).unwrap();
//! writer.write_all(b"record").unwrap();
//! writer.finish().unwrap();
//!
//! let mut reader = storage.open_read(Path::new("example.bin")).unwrap();
//! let mut content = Vec::new();
//! reader.read_to_end(&mut content).unwrap();
//! ```

mod local;
mod memory;
mod traits;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{StorageBackend, StorageReader, StorageWriter};
