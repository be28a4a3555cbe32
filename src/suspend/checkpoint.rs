//! Checkpoint artifacts
//!
//! Container layout:
//!
//! ```text
//! "RTCHCKPT" | u32 LE header length | JSON header
//! per contained partition: u64 LE length | Parquet buffered frame (empty if none)
//! ```
//!
//! The single layout writes every partition into one file. The partitioned
//! layout writes one descriptor per partition, `partition-00000.ckpt` and so
//! on, under the checkpoint directory.

use crate::engine::PartitionState;
use crate::error::{RatchetError, Result};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlparser::ast::Statement;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const MAGIC: &[u8; 8] = b"RTCHCKPT";
pub const FORMAT_VERSION: u32 = 1;

lazy_static! {
    static ref DESCRIPTOR_NAME: Regex = Regex::new(r"^partition-(\d{5})\.ckpt$").unwrap();
}

/// Fingerprint of a query definition: the normalised text of every setup
/// statement, in order, followed by the result-producing statement.
pub fn statement_fingerprint(setup: &[Statement], statement: &Statement) -> String {
    let mut hasher = Sha256::new();
    for step in setup.iter().chain(std::iter::once(statement)) {
        hasher.update(step.to_string().as_bytes());
        hasher.update(b";\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Progress of one partition as recorded in a checkpoint header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub cursor: usize,
    pub finished: bool,
    pub buffered_rows: usize,
}

impl From<&PartitionState> for PartitionCursor {
    fn from(state: &PartitionState) -> Self {
        Self {
            index: state.index,
            start: state.start,
            end: state.end,
            cursor: state.cursor,
            finished: state.finished,
            buffered_rows: state.buffered_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub format_version: u32,
    pub checkpoint_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub driving_relation: String,
    pub driving_rows: usize,
    pub batch_rows: usize,
    pub partition_count: usize,
    pub forced: bool,
    pub partitions: Vec<PartitionCursor>,
}

/// A loaded checkpoint: header plus restored partition states in index order.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub header: CheckpointHeader,
    pub states: Vec<PartitionState>,
}

fn corrupt(path: &Path, detail: impl Into<String>) -> RatchetError {
    RatchetError::CheckpointCorrupt {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

/// Serialize `header` followed by the buffered frames of `states`.
pub fn encode(header: &CheckpointHeader, states: &[PartitionState]) -> Result<Vec<u8>> {
    let header_bytes = serde_json::to_vec(header)?;
    let mut out = Vec::with_capacity(16 + header_bytes.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);

    for state in states {
        match &state.buffer {
            Some(buffer) => {
                let mut frame = buffer.clone();
                let mut bytes = Vec::new();
                ParquetWriter::new(&mut bytes).finish(&mut frame)?;
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            None => out.extend_from_slice(&0u64.to_le_bytes()),
        }
    }
    Ok(out)
}

struct Reader<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| corrupt(self.path, format!("truncated {}", what)))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(raw))
    }
}

/// Parse one artifact; `path` is only used for error context.
pub fn decode(path: &Path, bytes: &[u8]) -> Result<(CheckpointHeader, Vec<PartitionState>)> {
    let mut reader = Reader {
        path,
        bytes,
        offset: 0,
    };
    if reader.take(MAGIC.len(), "magic")? != MAGIC {
        return Err(corrupt(path, "not a checkpoint artifact (bad magic)"));
    }
    let header_len = reader.u32("header length")? as usize;
    let header: CheckpointHeader = serde_json::from_slice(reader.take(header_len, "header")?)
        .map_err(|e| corrupt(path, format!("unreadable header: {}", e)))?;
    if header.format_version != FORMAT_VERSION {
        return Err(corrupt(
            path,
            format!("unsupported format version {}", header.format_version),
        ));
    }

    let mut states = Vec::with_capacity(header.partitions.len());
    for cursor in &header.partitions {
        let len = usize::try_from(reader.u64("frame length")?)
            .map_err(|_| corrupt(path, "frame length overflow"))?;
        let buffer = if len == 0 {
            None
        } else {
            let raw = reader.take(len, "buffered frame")?;
            let frame = ParquetReader::new(Cursor::new(raw.to_vec()))
                .finish()
                .map_err(|e| corrupt(path, format!("partition {} frame: {}", cursor.index, e)))?;
            Some(frame)
        };
        let restored = PartitionState {
            index: cursor.index,
            start: cursor.start,
            end: cursor.end,
            cursor: cursor.cursor,
            finished: cursor.finished,
            buffer,
        };
        if restored.buffered_rows() != cursor.buffered_rows {
            return Err(corrupt(
                path,
                format!(
                    "partition {} holds {} rows, header records {}",
                    cursor.index,
                    restored.buffered_rows(),
                    cursor.buffered_rows
                ),
            ));
        }
        states.push(restored);
    }
    if reader.offset != bytes.len() {
        return Err(corrupt(path, "trailing bytes after last partition"));
    }
    Ok((header, states))
}

/// Reads and writes checkpoints at one location in one layout.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    location: PathBuf,
    partitioned: bool,
}

impl CheckpointStore {
    pub fn new(location: impl Into<PathBuf>, partitioned: bool) -> Self {
        Self {
            location: location.into(),
            partitioned,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn descriptor_path(&self, index: usize) -> PathBuf {
        self.location.join(format!("partition-{:05}.ckpt", index))
    }

    /// Persist `states`. `header.partitions` is filled in here.
    pub fn write(&self, mut header: CheckpointHeader, states: &[PartitionState]) -> Result<()> {
        header.partition_count = states.len();
        if !self.partitioned {
            if self.location.is_dir() {
                return Err(RatchetError::InvalidConfiguration(format!(
                    "checkpoint location {} is a directory; use the partitioned layout",
                    self.location.display()
                )));
            }
            if let Some(parent) = self.location.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            header.partitions = states.iter().map(PartitionCursor::from).collect();
            write_atomic(&self.location, &encode(&header, states)?)?;
        } else {
            std::fs::create_dir_all(&self.location)?;
            self.remove_stale_descriptors()?;
            for state in states {
                header.partitions = vec![PartitionCursor::from(state)];
                let bytes = encode(&header, std::slice::from_ref(state))?;
                write_atomic(&self.descriptor_path(state.index), &bytes)?;
            }
        }
        info!(
            "Checkpoint {} written to {} ({} partitions, {})",
            header.checkpoint_id,
            self.location.display(),
            states.len(),
            if self.partitioned { "partitioned" } else { "single file" }
        );
        Ok(())
    }

    fn remove_stale_descriptors(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.location)? {
            let entry = entry?;
            let name = entry.file_name();
            if DESCRIPTOR_NAME.is_match(&name.to_string_lossy()) {
                debug!("Removing stale descriptor {}", entry.path().display());
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Load a checkpoint, reconstituting partitions in index order.
    pub fn load(&self) -> Result<Checkpoint> {
        let checkpoint = if self.partitioned {
            self.load_partitioned()?
        } else {
            self.load_single()?
        };
        info!(
            "Checkpoint {} loaded from {} ({} partitions)",
            checkpoint.header.checkpoint_id,
            self.location.display(),
            checkpoint.states.len()
        );
        Ok(checkpoint)
    }

    fn load_single(&self) -> Result<Checkpoint> {
        if self.location.is_dir() {
            return Err(corrupt(
                &self.location,
                "expected a checkpoint file, found a directory (partitioned checkpoint?)",
            ));
        }
        if !self.location.exists() {
            return Err(corrupt(&self.location, "no checkpoint artifact at location"));
        }
        let bytes = std::fs::read(&self.location)?;
        let (header, states) = decode(&self.location, &bytes)?;
        check_partitions(&self.location, &header, states)
    }

    fn load_partitioned(&self) -> Result<Checkpoint> {
        if !self.location.is_dir() {
            return Err(corrupt(
                &self.location,
                "no partition descriptors: location is not a directory",
            ));
        }

        let mut descriptors: Vec<(usize, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.location)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(captures) = DESCRIPTOR_NAME.captures(&name) {
                if let Ok(index) = captures[1].parse::<usize>() {
                    descriptors.push((index, entry.path()));
                }
            }
        }
        if descriptors.is_empty() {
            return Err(corrupt(&self.location, "no partition descriptors found"));
        }
        descriptors.sort_by_key(|(index, _)| *index);

        let mut header: Option<CheckpointHeader> = None;
        let mut states = Vec::with_capacity(descriptors.len());
        for (index, path) in descriptors {
            let bytes = std::fs::read(&path)?;
            let (descriptor, mut contained) = decode(&path, &bytes)?;
            if contained.len() != 1 || contained[0].index != index {
                return Err(corrupt(
                    &path,
                    format!("descriptor does not hold partition {}", index),
                ));
            }
            if let Some(first) = &header {
                if first.checkpoint_id != descriptor.checkpoint_id {
                    return Err(corrupt(
                        &path,
                        format!(
                            "descriptor belongs to checkpoint {}, expected {}",
                            descriptor.checkpoint_id, first.checkpoint_id
                        ),
                    ));
                }
            } else {
                header = Some(descriptor.clone());
            }
            states.append(&mut contained);
        }

        let mut header = header.ok_or_else(|| corrupt(&self.location, "no descriptors"))?;
        header.partitions = states.iter().map(PartitionCursor::from).collect();
        check_partitions(&self.location, &header, states)
    }
}

fn check_partitions(
    path: &Path,
    header: &CheckpointHeader,
    states: Vec<PartitionState>,
) -> Result<Checkpoint> {
    let complete = states.len() == header.partition_count
        && states.iter().enumerate().all(|(i, s)| s.index == i);
    if !complete {
        return Err(RatchetError::PartitionCountMismatch {
            path: path.to_path_buf(),
            expected: header.partition_count,
            found: states.len(),
        });
    }
    Ok(Checkpoint {
        header: header.clone(),
        states,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
