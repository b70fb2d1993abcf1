//! Deterministic partitioning of a transfer into byte-range chunks.
//!
//! The plan is a pure function of `(total_bytes, chunk_size)`: a resumed
//! transfer recomputes exactly the same chunk list and skips the ones
//! already marked Done.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{TaskId, TransferError};

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Transfer status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// One slice of a task: the unit of retry and parallelism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub task_id: TaskId,
    /// Position in plan order.
    pub index: usize,
    pub range: ByteRange,
    pub status: ChunkStatus,
}

/// Splits `[0, total_bytes)` into contiguous ranges of at most `chunk_size`.
///
/// `total_bytes == 0` yields a single empty range so that an empty object
/// still produces one (trivial) transfer.
pub fn partition(total_bytes: u64, chunk_size: u64) -> Result<Vec<ByteRange>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidArgument(
            "chunk size must be greater than zero".into(),
        ));
    }
    if total_bytes == 0 {
        return Ok(vec![ByteRange::new(0, 0)]);
    }

    let count = total_bytes.div_ceil(chunk_size);
    let ranges = (0..count)
        .map(|i| {
            let start = i * chunk_size;
            ByteRange::new(start, (start + chunk_size).min(total_bytes))
        })
        .collect();
    Ok(ranges)
}

/// Owns a task's ordered chunk list and is the only place chunk status
/// changes.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    task_id: TaskId,
    total_bytes: u64,
    chunk_size: u64,
    chunks: Vec<Chunk>,
}

impl ChunkPlanner {
    /// Computes the plan for `total_bytes` split into `chunk_size` pieces.
    pub fn plan(task_id: TaskId, total_bytes: u64, chunk_size: u64) -> Result<Self, TransferError> {
        let chunks: Vec<Chunk> = partition(total_bytes, chunk_size)?
            .into_iter()
            .enumerate()
            .map(|(index, range)| Chunk {
                task_id,
                index,
                range,
                status: ChunkStatus::Pending,
            })
            .collect();
        trace!(task = %task_id, total_bytes, chunk_size, chunks = chunks.len(), "planned chunks");
        Ok(Self {
            task_id,
            total_bytes,
            chunk_size,
            chunks,
        })
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// All chunks in plan order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Chunks not yet Done, in plan order.
    pub fn remaining(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Done)
    }

    /// The first Pending chunk in plan order: the next one to dispatch.
    pub fn next_pending(&self) -> Option<&Chunk> {
        self.chunks
            .iter()
            .find(|c| c.status == ChunkStatus::Pending)
    }

    /// Returns `true` once every chunk is Done.
    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.status == ChunkStatus::Done)
    }

    /// Sum of the sizes of Done chunks.
    pub fn completed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Done)
            .map(|c| c.range.len())
            .sum()
    }

    /// Pending → InFlight.
    pub fn mark_in_flight(&mut self, index: usize) -> Result<&Chunk, TransferError> {
        self.set_status(index, ChunkStatus::InFlight, |s| s == ChunkStatus::Pending)
    }

    /// Marks a chunk Done. Done chunks are never dispatched again.
    pub fn mark_done(&mut self, index: usize) -> Result<&Chunk, TransferError> {
        self.set_status(index, ChunkStatus::Done, |s| {
            matches!(s, ChunkStatus::Pending | ChunkStatus::InFlight | ChunkStatus::Done)
        })
    }

    /// InFlight → Failed.
    pub fn mark_failed(&mut self, index: usize) -> Result<&Chunk, TransferError> {
        self.set_status(index, ChunkStatus::Failed, |s| s == ChunkStatus::InFlight)
    }

    /// Returns an InFlight chunk to Pending so it is dispatched again.
    pub fn requeue(&mut self, index: usize) -> Result<&Chunk, TransferError> {
        self.set_status(index, ChunkStatus::Pending, |s| s == ChunkStatus::InFlight)
    }

    fn set_status(
        &mut self,
        index: usize,
        next: ChunkStatus,
        allowed_from: impl Fn(ChunkStatus) -> bool,
    ) -> Result<&Chunk, TransferError> {
        let count = self.chunks.len();
        let chunk = self.chunks.get_mut(index).ok_or_else(|| {
            TransferError::InvalidArgument(format!(
                "chunk index {index} out of range (plan has {count} chunks)"
            ))
        })?;
        if !allowed_from(chunk.status) {
            return Err(TransferError::InvalidArgument(format!(
                "chunk {index} cannot move from {:?} to {next:?}",
                chunk.status
            )));
        }
        chunk.status = next;
        Ok(chunk)
    }
}
