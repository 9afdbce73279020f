// rust/cir-core/src/config.rs

//! Configuration management for the checkpointed iteration runtime.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::fault::FaultTrigger;
use crate::group::BarrierWait;

/// Environment variable carrying the pre-join rank hint.
pub const RANK_HINT_ENV: &str = "CIR_RANK";

/// Rank hint variable exported by MPI process managers; read when
/// `CIR_RANK` is absent.
pub const PMI_RANK_ENV: &str = "PMI_RANK";

// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub job: JobConfig,
    pub group: GroupConfig,
    pub fault: FaultConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
}

/// On-disk layout of a checkpoint record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Fixed-width body only: iteration, vector, owner rank.
    #[default]
    Raw,
    /// Body preceded by a header with magic, version and checksum.
    Tagged,
}

impl FromStr for RecordFormat {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(RecordFormat::Raw),
            "tagged" => Ok(RecordFormat::Tagged),
            other => Err(RuntimeError::config(format!(
                "unknown checkpoint format '{other}' (expected 'raw' or 'tagged')"
            ))),
        }
    }
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for storing checkpoints, relative to the storage base path.
    pub checkpoint_dir: PathBuf,
    // File name template; `{rank}` is replaced by the owning rank.
    pub file_template: String,
    // Record layout.
    pub format: RecordFormat,
    // Whether to use atomic writes (write to temp then rename).
    pub atomic_writes: bool,
}

/// Shape of the iterative computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of elements in every rank's state vector.
    pub vector_len: usize,
    /// Iteration bound; the loop stops once `iteration == max_iterations`.
    pub max_iterations: u32,
    /// Coordinated checkpoints happen when `iteration % checkpoint_interval == 0`.
    pub checkpoint_interval: u32,
    /// Additive increment applied to every element each iteration.
    pub increment: f64,
}

/// Process group membership and barrier behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Pre-join identity hint. `None` resolves to rank 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_hint: Option<u32>,
    /// Number of members in the group.
    pub size: u32,
    /// Address of the group server.
    pub address: String,
    /// Bounded barrier wait in milliseconds. `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier_timeout_ms: Option<u64>,
    /// Timeout for a single connection attempt to the group server.
    pub connect_timeout_ms: u64,
    /// Connection attempts before joining gives up.
    pub connect_attempts: u32,
}

/// Deterministic fault injection plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    pub triggers: Vec<FaultTrigger>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 8 * 1024, // 8 KB
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            file_template: "checkpoint_{rank}.bin".to_string(),
            format: RecordFormat::Raw,
            atomic_writes: true,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            vector_len: 10,
            max_iterations: 100,
            checkpoint_interval: 5,
            increment: 0.1,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            rank_hint: None,
            size: 4,
            address: "127.0.0.1:50061".to_string(),
            barrier_timeout_ms: None,
            connect_timeout_ms: 1_000,
            connect_attempts: 30,
        }
    }
}

impl GroupConfig {
    /// The hint handed to the rank resolver, defaulting to rank 0.
    pub fn resolved_hint(&self) -> u32 {
        self.rank_hint.unwrap_or(0)
    }

    /// Barrier wait policy derived from `barrier_timeout_ms`.
    pub fn barrier_wait(&self) -> BarrierWait {
        match self.barrier_timeout_ms {
            Some(ms) => BarrierWait::Bounded(Duration::from_millis(ms)),
            None => BarrierWait::Unbounded,
        }
    }
}

impl FromStr for RuntimeConfig {
    type Err = RuntimeError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RuntimeError::config_with_source("failed to parse TOML config", e))
    }
}

impl RuntimeConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `CIR_` and use underscores
    // to separate nested fields. For example:
    // - `CIR_STORAGE_BASE_PATH` overrides `storage.base_path`
    // - `CIR_CHECKPOINT_FORMAT` overrides `checkpoint.format` ("raw" or "tagged")
    // - `CIR_JOB_MAX_ITERATIONS` overrides `job.max_iterations`
    // - `CIR_GROUP_ADDRESS` overrides `group.address`
    // - `CIR_FAULT` replaces `fault.triggers` ("15:0,40:2")
    //
    // The rank hint comes from `CIR_RANK`, or `PMI_RANK` when that is unset.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("CIR_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CIR_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }

        // Checkpoint overrides
        if let Ok(val) = std::env::var("CIR_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CIR_CHECKPOINT_FILE_TEMPLATE") {
            self.checkpoint.file_template = val;
        }
        if let Ok(val) = std::env::var("CIR_CHECKPOINT_FORMAT") {
            if let Ok(v) = val.parse() {
                self.checkpoint.format = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_CHECKPOINT_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.checkpoint.atomic_writes = v;
            }
        }

        // Job overrides
        if let Ok(val) = std::env::var("CIR_JOB_VECTOR_LEN") {
            if let Ok(v) = val.parse() {
                self.job.vector_len = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_JOB_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.job.max_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_JOB_CHECKPOINT_INTERVAL") {
            if let Ok(v) = val.parse() {
                self.job.checkpoint_interval = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_JOB_INCREMENT") {
            if let Ok(v) = val.parse() {
                self.job.increment = v;
            }
        }

        // Group overrides
        let hint = std::env::var(RANK_HINT_ENV).or_else(|_| std::env::var(PMI_RANK_ENV));
        if let Ok(val) = hint {
            if let Ok(v) = val.trim().parse() {
                self.group.rank_hint = Some(v);
            }
        }
        if let Ok(val) = std::env::var("CIR_GROUP_SIZE") {
            if let Ok(v) = val.parse() {
                self.group.size = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_GROUP_ADDRESS") {
            self.group.address = val;
        }
        if let Ok(val) = std::env::var("CIR_GROUP_BARRIER_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.group.barrier_timeout_ms = Some(v);
            }
        }
        if let Ok(val) = std::env::var("CIR_GROUP_CONNECT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.group.connect_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("CIR_GROUP_CONNECT_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.group.connect_attempts = v;
            }
        }

        // Fault overrides
        if let Ok(val) = std::env::var("CIR_FAULT") {
            if let Ok(triggers) = FaultTrigger::parse_list(&val) {
                self.fault.triggers = triggers;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(RuntimeError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        // Checkpoint validation
        if !self.checkpoint.file_template.contains("{rank}") {
            return Err(RuntimeError::config(
                "checkpoint.file_template must contain the {rank} placeholder",
            ));
        }
        if self.checkpoint.file_template.contains('/') {
            return Err(RuntimeError::config(
                "checkpoint.file_template must be a file name, not a path",
            ));
        }

        // Job validation
        if self.job.vector_len == 0 {
            return Err(RuntimeError::config(
                "job.vector_len must be greater than 0",
            ));
        }
        if self.job.checkpoint_interval == 0 {
            return Err(RuntimeError::config(
                "job.checkpoint_interval must be greater than 0",
            ));
        }
        // Records store the iteration as a signed 32-bit field.
        if self.job.max_iterations > i32::MAX as u32 {
            return Err(RuntimeError::config(format!(
                "job.max_iterations must be at most {}",
                i32::MAX
            )));
        }
        if !self.job.increment.is_finite() {
            return Err(RuntimeError::config("job.increment must be finite"));
        }

        // Group validation
        if self.group.size == 0 {
            return Err(RuntimeError::config("group.size must be greater than 0"));
        }
        if self.group.size > i32::MAX as u32 {
            return Err(RuntimeError::config(format!(
                "group.size must be at most {}",
                i32::MAX
            )));
        }
        if self.group.barrier_timeout_ms == Some(0) {
            return Err(RuntimeError::config(
                "group.barrier_timeout_ms must be greater than 0 when set",
            ));
        }
        if self.group.connect_timeout_ms == 0 {
            return Err(RuntimeError::config(
                "group.connect_timeout_ms must be greater than 0",
            ));
        }
        if self.group.connect_attempts == 0 {
            return Err(RuntimeError::config(
                "group.connect_attempts must be greater than 0",
            ));
        }

        Ok(())
    }
}
