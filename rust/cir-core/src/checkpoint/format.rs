// rust/cir-core/src/checkpoint/format.rs

//! Checkpoint record layouts.
//!
//! Every record is self-contained and addressed by its owner's rank. The body
//! is fixed-width, little-endian:
//!
//! ```text
//! +----------------------------+
//! | iteration (i32)            |
//! +----------------------------+
//! | vector[0..N] (f64 each)    |
//! +----------------------------+
//! | owner_rank (i32)           |
//! +----------------------------+
//! ```
//!
//! The `raw` format is the body alone (`4 + 8N + 4` bytes, 88 for N = 10).
//! The `tagged` format prepends a 24-byte header so corruption and layout
//! drift are detected instead of being mistaken for a missing checkpoint:
//!
//! ```text
//! +----------------------------+
//! | Magic "CIRS" (4 bytes)     |
//! +----------------------------+
//! | Version (u32)              |
//! +----------------------------+
//! | Vector length (u32)        |
//! +----------------------------+
//! | Reserved (u32)             |
//! +----------------------------+
//! | XXHash64 of body (u64)     |
//! +----------------------------+
//! | Body                       |
//! +----------------------------+
//! ```

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::config::RecordFormat;
use crate::error::{Result, RuntimeError};
use crate::state::ProcessState;

/// Header size in bytes for the tagged format.
pub const HEADER_SIZE: usize = 24;

const ITERATION_SIZE: usize = 4;
const ELEMENT_SIZE: usize = 8;
const RANK_SIZE: usize = 4;

/// Header for tagged checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Magic bytes identifying this as a checkpoint record ("CIRS")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Number of vector elements in the body
    pub vector_len: u32,
    /// Reserved for future use, always zero
    pub reserved: u32,
    /// XXHash64 checksum of the body
    pub checksum: u64,
}

impl RecordHeader {
    /// Magic bytes for tagged records
    pub const MAGIC: [u8; 4] = *b"CIRS";

    /// Current format version
    pub const VERSION: u32 = 1;

    pub fn new(vector_len: u32, checksum: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            vector_len,
            reserved: 0,
            checksum,
        }
    }

    /// Validates the header magic bytes.
    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    /// Validates the header version.
    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.vector_len.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserializes a header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);

        Some(Self {
            magic,
            version: read_u32(&bytes[4..8]),
            vector_len: read_u32(&bytes[8..12]),
            reserved: read_u32(&bytes[12..16]),
            checksum: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
        })
    }
}

/// Encodes and decodes [`ProcessState`] records of a fixed vector length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCodec {
    format: RecordFormat,
    vector_len: usize,
}

impl RecordCodec {
    pub fn new(format: RecordFormat, vector_len: usize) -> Self {
        Self { format, vector_len }
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    pub fn vector_len(&self) -> usize {
        self.vector_len
    }

    /// Size of the fixed-width body.
    pub fn body_size(&self) -> usize {
        ITERATION_SIZE + ELEMENT_SIZE * self.vector_len + RANK_SIZE
    }

    /// Total size of an encoded record.
    pub fn record_size(&self) -> usize {
        match self.format {
            RecordFormat::Raw => self.body_size(),
            RecordFormat::Tagged => HEADER_SIZE + self.body_size(),
        }
    }

    pub fn encode(&self, state: &ProcessState) -> Result<Vec<u8>> {
        if state.vector.len() != self.vector_len {
            return Err(RuntimeError::serialization(format!(
                "state vector has {} elements, record layout expects {}",
                state.vector.len(),
                self.vector_len
            )));
        }

        let iteration = i32::try_from(state.iteration).map_err(|_| {
            RuntimeError::serialization(format!(
                "iteration {} does not fit the record's 32-bit field",
                state.iteration
            ))
        })?;
        let owner_rank = i32::try_from(state.owner_rank).map_err(|_| {
            RuntimeError::serialization(format!(
                "rank {} does not fit the record's 32-bit field",
                state.owner_rank
            ))
        })?;

        let mut body = Vec::with_capacity(self.body_size());
        body.extend_from_slice(&iteration.to_le_bytes());
        for value in &state.vector {
            body.extend_from_slice(&value.to_le_bytes());
        }
        body.extend_from_slice(&owner_rank.to_le_bytes());

        match self.format {
            RecordFormat::Raw => Ok(body),
            RecordFormat::Tagged => {
                let header = RecordHeader::new(self.vector_len as u32, checksum(&body));
                let mut record = Vec::with_capacity(HEADER_SIZE + body.len());
                record.extend_from_slice(&header.to_bytes());
                record.extend_from_slice(&body);
                Ok(record)
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<ProcessState> {
        let body = match self.format {
            RecordFormat::Raw => bytes,
            RecordFormat::Tagged => self.strip_header(bytes)?,
        };

        if body.len() != self.body_size() {
            return Err(RuntimeError::checkpoint(format!(
                "record size mismatch: expected {} bytes, got {}",
                self.body_size(),
                body.len()
            )));
        }

        let iteration = i32::from_le_bytes(body[..ITERATION_SIZE].try_into().map_err(|_| {
            RuntimeError::checkpoint("record truncated: iteration field incomplete")
        })?);
        let rank_offset = body.len() - RANK_SIZE;
        let owner_rank = i32::from_le_bytes(body[rank_offset..].try_into().map_err(|_| {
            RuntimeError::checkpoint("record truncated: rank field incomplete")
        })?);

        let iteration = u32::try_from(iteration).map_err(|_| {
            RuntimeError::checkpoint(format!("record has negative iteration {iteration}"))
        })?;
        let owner_rank = u32::try_from(owner_rank).map_err(|_| {
            RuntimeError::checkpoint(format!("record has negative owner rank {owner_rank}"))
        })?;

        let vector = body[ITERATION_SIZE..rank_offset]
            .chunks_exact(ELEMENT_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; ELEMENT_SIZE];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect();

        Ok(ProcessState {
            iteration,
            vector,
            owner_rank,
        })
    }

    fn strip_header<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8]> {
        let header = RecordHeader::from_bytes(bytes)
            .ok_or_else(|| RuntimeError::checkpoint("record too small for header"))?;

        if !header.validate_magic() {
            return Err(RuntimeError::checkpoint(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                RecordHeader::MAGIC,
                header.magic
            )));
        }

        if !header.validate_version() {
            return Err(RuntimeError::checkpoint(format!(
                "unsupported version: expected {}, got {}",
                RecordHeader::VERSION,
                header.version
            )));
        }

        if header.vector_len as usize != self.vector_len {
            return Err(RuntimeError::checkpoint(format!(
                "vector length mismatch: expected {}, got {}",
                self.vector_len, header.vector_len
            )));
        }

        let body = &bytes[HEADER_SIZE..];
        let computed = checksum(body);
        if computed != header.checksum {
            return Err(RuntimeError::checkpoint(format!(
                "checksum mismatch: expected {}, got {}",
                header.checksum, computed
            )));
        }

        Ok(body)
    }
}

/// Calculates XXHash64 checksum of data.
fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
