// rust/cir-core/src/checkpoint/mod.rs

//! Per-rank checkpoint persistence.
//!
//! Every rank owns exactly one record, overwritten at each coordinated
//! checkpoint. Records are never shared between ranks and carry their
//! owner's rank so a misplaced file is detected on load.
//!
//! # Record layout
//!
//! ## Raw (default)
//!
//! ```text
//! +---------------------------+
//! | Iteration (4 bytes)       |  <- i32 little-endian
//! +---------------------------+
//! | Vector (8 * N bytes)      |  <- f64 little-endian, N elements
//! +---------------------------+
//! | Owner rank (4 bytes)      |  <- i32 little-endian
//! +---------------------------+
//! ```
//!
//! ## Tagged (opt-in)
//!
//! ```text
//! +---------------------------+
//! | Magic "CIRS" (4 bytes)    |
//! +---------------------------+
//! | Version (4 bytes)         |
//! +---------------------------+
//! | Vector length (4 bytes)   |
//! +---------------------------+
//! | Reserved (4 bytes)        |
//! +---------------------------+
//! | Checksum (8 bytes)        |  <- XXHash64 of the raw body
//! +---------------------------+
//! | Raw body                  |
//! +---------------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cir_core::checkpoint::CheckpointStore;
//! use cir_core::config::{CheckpointConfig, StorageConfig};
//! use cir_core::storage::LocalStorage;
//! use cir_core::ProcessState;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let store = CheckpointStore::new(storage, CheckpointConfig::default(), 10);
//!
//! store.save(&ProcessState::fresh(0, 10)).unwrap();
//! let recovered = store.load(0);
//! ```

mod format;
mod store;

pub use format::{RecordCodec, RecordHeader, HEADER_SIZE};
pub use store::CheckpointStore;
