// rust/cir-core/src/checkpoint/store.rs

//! Per-rank checkpoint store.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::CheckpointConfig;
use crate::error::{Result, RuntimeError};
use crate::state::ProcessState;
use crate::storage::StorageBackend;

use super::format::RecordCodec;

const RANK_PLACEHOLDER: &str = "{rank}";

/// Saves and loads one checkpoint record per rank.
///
/// The `CheckpointStore` handles:
/// - Naming records from the configured template (`checkpoint_{rank}.bin`)
/// - Overwriting a rank's previous record on every save (no history)
/// - Atomic writes (write to temp file then rename) when configured
/// - Rejecting records whose owner differs from the rank asked for
pub struct CheckpointStore {
    storage: Arc<dyn StorageBackend>,
    config: CheckpointConfig,
    codec: RecordCodec,
}

impl CheckpointStore {
    /// Creates a store for records holding `vector_len` elements.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        config: CheckpointConfig,
        vector_len: usize,
    ) -> Self {
        let codec = RecordCodec::new(config.format, vector_len);
        Self {
            storage,
            config,
            codec,
        }
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    /// File name of `rank`'s record.
    pub fn file_name(&self, rank: u32) -> String {
        self.config
            .file_template
            .replace(RANK_PLACEHOLDER, &rank.to_string())
    }

    /// Storage path of `rank`'s record.
    pub fn path_for(&self, rank: u32) -> PathBuf {
        self.config.checkpoint_dir.join(self.file_name(rank))
    }

    /// Persists `state` under its owner's rank, replacing any earlier record.
    ///
    /// Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or the destination
    /// cannot be opened, written or renamed into place.
    pub fn save(&self, state: &ProcessState) -> Result<PathBuf> {
        let record = self.codec.encode(state)?;

        self.storage.create_dir_all(&self.config.checkpoint_dir)?;

        let filename = self.file_name(state.owner_rank);
        let final_path = self.config.checkpoint_dir.join(&filename);

        if self.config.atomic_writes {
            let temp_path = self.config.checkpoint_dir.join(format!(".{filename}.tmp"));
            self.write_to_path(&temp_path, &record)?;
            self.storage.rename(&temp_path, &final_path)?;
        } else {
            self.write_to_path(&final_path, &record)?;
        }

        tracing::debug!(
            "Saved checkpoint for rank {} at iteration {} to {}",
            state.owner_rank,
            state.iteration,
            final_path.display()
        );

        Ok(final_path)
    }

    /// Loads `rank`'s record, treating absence and corruption alike.
    ///
    /// Returns `None` when no record exists, when it cannot be decoded, or
    /// when it belongs to another rank. Corruption is logged, not returned.
    pub fn load(&self, rank: u32) -> Option<ProcessState> {
        match self.try_load(rank) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Ignoring unusable checkpoint for rank {}: {}", rank, e);
                None
            }
        }
    }

    /// Loads `rank`'s record, distinguishing absence from corruption.
    ///
    /// # Errors
    ///
    /// Returns an error if a record exists but cannot be read or decoded, or
    /// if its owner rank differs from `rank`.
    pub fn try_load(&self, rank: u32) -> Result<Option<ProcessState>> {
        let path = self.path_for(rank);
        if !self.storage.exists(&path)? {
            return Ok(None);
        }

        let bytes = self.read_from_path(&path)?;
        let state = self.codec.decode(&bytes)?;

        if state.owner_rank != rank {
            return Err(RuntimeError::checkpoint(format!(
                "record at {} belongs to rank {}, not rank {}",
                path.display(),
                state.owner_rank,
                rank
            )));
        }

        Ok(Some(state))
    }

    /// Deletes `rank`'s record. Returns whether one existed.
    pub fn remove(&self, rank: u32) -> Result<bool> {
        let path = self.path_for(rank);
        if !self.storage.exists(&path)? {
            return Ok(false);
        }
        self.storage.delete(&path)?;
        Ok(true)
    }

    /// Ranks that currently have a record in the checkpoint directory.
    pub fn ranks(&self) -> Result<Vec<u32>> {
        let (prefix, suffix) = self
            .config
            .file_template
            .split_once(RANK_PLACEHOLDER)
            .ok_or_else(|| {
                RuntimeError::config("checkpoint.file_template has no {rank} placeholder")
            })?;

        let mut ranks: Vec<u32> = self
            .storage
            .list(&self.config.checkpoint_dir)?
            .iter()
            .filter(|name| !name.starts_with('.'))
            .filter_map(|name| name.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok())
            .collect();

        ranks.sort_unstable();
        Ok(ranks)
    }

    /// Writes data to a path using the storage backend.
    fn write_to_path(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self.storage.open_write(path)?;
        writer
            .write_all(data)
            .map_err(|e| RuntimeError::storage_with_source(path, "failed to write checkpoint", e))?;
        writer.finish()?;
        Ok(())
    }

    fn read_from_path(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.storage.open_read(path)?;

        let expected = self.codec.record_size();
        if reader.size() != expected as u64 {
            return Err(RuntimeError::checkpoint(format!(
                "record at {} is {} bytes, expected {}",
                path.display(),
                reader.size(),
                expected
            )));
        }

        let mut data = Vec::with_capacity(expected);
        reader
            .read_to_end(&mut data)
            .map_err(|e| RuntimeError::storage_with_source(path, "failed to read checkpoint", e))?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecordFormat, StorageConfig};
    use crate::storage::{LocalStorage, MemoryStorage};
    use tempfile::TempDir;

    fn local_store(format: RecordFormat, atomic_writes: bool) -> (CheckpointStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(&storage_config).unwrap());

        let config = CheckpointConfig {
            format,
            atomic_writes,
            ..Default::default()
        };
        (CheckpointStore::new(storage, config, 10), temp_dir)
    }

    fn memory_store() -> (CheckpointStore, MemoryStorage) {
        let storage = MemoryStorage::new();
        let store = CheckpointStore::new(
            Arc::new(storage.clone()),
            CheckpointConfig::default(),
            10,
        );
        (store, storage)
    }

    fn advanced(rank: u32, iteration: u32) -> ProcessState {
        let mut state = ProcessState::fresh(rank, 10);
        state.iteration = iteration;
        for value in state.vector.iter_mut() {
            *value += 0.25 * iteration as f64;
        }
        state
    }

    #[test]
    fn test_file_naming() {
        let (store, _temp) = local_store(RecordFormat::Raw, true);
        assert_eq!(store.file_name(0), "checkpoint_0.bin");
        assert_eq!(store.file_name(12), "checkpoint_12.bin");
        assert_eq!(
            store.path_for(3),
            PathBuf::from("checkpoints").join("checkpoint_3.bin")
        );
    }

    #[test]
    fn test_save_then_load() {
        for format in [RecordFormat::Raw, RecordFormat::Tagged] {
            for atomic in [true, false] {
                let (store, _temp) = local_store(format, atomic);
                let state = advanced(2, 35);

                store.save(&state).unwrap();

                assert_eq!(store.load(2), Some(state));
            }
        }
    }

    #[test]
    fn test_saved_bytes_are_read_back_unchanged() {
        let (store, storage) = memory_store();
        let state = advanced(1, 10);

        let path = store.save(&state).unwrap();
        let written = storage.get(&path).unwrap();

        let loaded = store.load(1).unwrap();
        assert_eq!(store.codec().encode(&loaded).unwrap(), written);
    }

    #[test]
    fn test_load_missing_is_none() {
        let (store, _temp) = local_store(RecordFormat::Raw, true);
        assert_eq!(store.load(0), None);
        assert!(store.try_load(0).unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_previous_record() {
        let (store, _temp) = local_store(RecordFormat::Raw, true);

        store.save(&advanced(0, 5)).unwrap();
        store.save(&advanced(0, 10)).unwrap();

        assert_eq!(store.load(0).unwrap().iteration, 10);
        assert_eq!(store.ranks().unwrap(), vec![0]);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let (store, temp) = local_store(RecordFormat::Raw, true);
        store.save(&advanced(4, 0)).unwrap();

        let dir = temp.path().join("checkpoints");
        let names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["checkpoint_4.bin".to_string()]);
    }

    #[test]
    fn test_truncated_record_is_none_but_reported_by_try_load() {
        let (store, storage) = memory_store();
        let path = store.save(&advanced(0, 10)).unwrap();

        let mut bytes = storage.get(&path).unwrap();
        bytes.truncate(40);
        storage.put(path, bytes);

        assert_eq!(store.load(0), None);
        assert!(store.try_load(0).is_err());
    }

    #[test]
    fn test_wrong_length_record_rejected_before_read() {
        let (store, storage) = memory_store();
        storage.put(store.path_for(3), vec![0u8; 4096]);

        let err = store.try_load(3).unwrap_err();
        assert!(err.to_string().contains("4096 bytes, expected 88"), "{err}");
        assert_eq!(store.load(3), None);
    }

    #[test]
    fn test_foreign_record_is_rejected() {
        let (store, storage) = memory_store();
        let path = store.save(&advanced(1, 10)).unwrap();

        // Rank 1's record copied into rank 0's slot.
        storage.put(store.path_for(0), storage.get(&path).unwrap());

        assert_eq!(store.load(0), None);
        let err = store.try_load(0).unwrap_err();
        assert!(err.to_string().contains("belongs to rank 1"));
        assert_eq!(store.load(1).unwrap().owner_rank, 1);
    }

    #[test]
    fn test_ranks_do_not_collide() {
        let (store, _temp) = local_store(RecordFormat::Raw, true);
        for rank in [0, 1, 2, 10, 11] {
            store.save(&advanced(rank, rank * 5)).unwrap();
        }

        assert_eq!(store.ranks().unwrap(), vec![0, 1, 2, 10, 11]);
        for rank in [0, 1, 2, 10, 11] {
            let state = store.load(rank).unwrap();
            assert_eq!(state.owner_rank, rank);
            assert_eq!(state.iteration, rank * 5);
        }
    }

    #[test]
    fn test_save_failure_is_reported() {
        let (store, storage) = memory_store();
        storage.set_fail_writes(true);

        assert!(store.save(&advanced(0, 0)).is_err());
        assert_eq!(store.load(0), None);
    }

    #[test]
    fn test_remove() {
        let (store, _temp) = local_store(RecordFormat::Raw, false);
        store.save(&advanced(3, 5)).unwrap();

        assert!(store.remove(3).unwrap());
        assert!(!store.remove(3).unwrap());
        assert_eq!(store.load(3), None);
    }

    #[test]
    fn test_raw_and_tagged_are_not_interchangeable() {
        let storage = MemoryStorage::new();
        let raw = CheckpointStore::new(
            Arc::new(storage.clone()),
            CheckpointConfig::default(),
            10,
        );
        let tagged = CheckpointStore::new(
            Arc::new(storage.clone()),
            CheckpointConfig {
                format: RecordFormat::Tagged,
                ..Default::default()
            },
            10,
        );

        raw.save(&advanced(0, 5)).unwrap();
        assert!(tagged.try_load(0).is_err());
    }
}
