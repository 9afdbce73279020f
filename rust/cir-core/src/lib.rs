// rust/cir-core/src/lib.rs

//! Checkpointed Iteration Runtime - Core Library
//!
//! This crate provides the pieces a fixed group of worker processes needs to
//! run synchronized iterations, persist per-rank checkpoints at coordinated
//! barriers, and resume after an abrupt failure: configuration, storage
//! backends, the checkpoint store, rank resolution, process groups, fault
//! injection and the worker loop that drives them.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use storage::{LocalStorage, MemoryStorage, StorageBackend, StorageReader, StorageWriter};

pub mod checkpoint;
pub use checkpoint::{CheckpointStore, RecordCodec};

pub mod state;
pub use state::ProcessState;

pub mod kernel;
pub use kernel::{IncrementKernel, Kernel};

pub mod fault;
pub use fault::{FaultInjector, FaultPlan, FaultTrigger};

pub mod resolver;
pub use resolver::{RankResolver, Resolution, StartKind};

pub mod group;
pub use group::{BarrierWait, GroupServer, LocalGroup, Membership, ProcessGroup, TcpGroup};

pub mod worker;
pub use worker::{CheckpointEvent, WorkerLoop, WorkerPhase, WorkerReport};
