//! Transfer task model with chunk planning and a process-wide task registry.
//!
//! This crate holds the state side of a transfer: what a task is, which
//! byte ranges it is split into and which tasks are currently known. The
//! async machinery that moves bytes lives in `ferry-engine`.

mod plan;
mod progress;
mod registry;
mod types;
mod validation;

use serde::{Deserialize, Serialize};

pub use plan::{ByteRange, Chunk, ChunkPlanner, ChunkStatus, partition};
pub use progress::SpeedCalculator;
pub use registry::TransferRegistry;
pub use types::{Direction, TaskId, TaskSnapshot, TaskSpec, TaskState, TransferTask};
pub use validation::{validate_object_path, validate_remote_key};

/// Default chunk size: 5 MiB.
///
/// Matches the smallest part size accepted by multipart object stores, so a
/// plan computed with the default is valid for every backend.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced while creating, planning or driving a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    #[error("remote object not found: {0}")]
    RemoteObjectNotFound(String),

    #[error("retryable transport error: {0}")]
    RetryableTransport(String),

    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

impl TransferError {
    /// Returns the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            Self::RemoteObjectNotFound(_) => ErrorKind::RemoteObjectNotFound,
            Self::RetryableTransport(_) => ErrorKind::RetryableTransport,
            Self::FatalTransport(_) => ErrorKind::FatalTransport,
            Self::RetryBudgetExhausted { .. } => ErrorKind::RetryBudgetExhausted,
        }
    }
}

/// Category of a [`TransferError`], reported to error subscribers and in
/// task snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidStateTransition,
    RemoteObjectNotFound,
    RetryableTransport,
    FatalTransport,
    RetryBudgetExhausted,
}
