//! Transport trait: the seam between the engine and a storage backend.
//!
//! The engine never talks to a network or disk directly. A backend (object
//! store client, local directory, test mock) implements [`Transport`] and is
//! handed to the engine as `Arc<dyn Transport>`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use ferry_transfer::{ByteRange, Direction, TaskId, TransferError};
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Transient failure; the engine retries with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; the task fails immediately.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Retryable(msg) => TransferError::RetryableTransport(msg),
            TransportError::Fatal(msg) => TransferError::FatalTransport(msg),
            TransportError::NotFound(key) => TransferError::RemoteObjectNotFound(key),
        }
    }
}

/// Everything a transport needs to move one chunk.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub task_id: TaskId,
    pub index: usize,
    pub direction: Direction,
    pub remote_key: String,
    pub local_path: PathBuf,
    pub range: ByteRange,
    /// Fired when the task is cancelled. Long-running transfers should
    /// check it and stop early.
    pub cancel: CancellationToken,
}

/// Shape of a whole transfer, passed to the lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub task_id: TaskId,
    pub direction: Direction,
    pub remote_key: String,
    pub local_path: PathBuf,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
}

/// Abstract storage backend.
///
/// Only [`transfer_chunk`](Self::transfer_chunk) and
/// [`stat_object`](Self::stat_object) are required. The lifecycle hooks
/// default to no-ops; multipart backends use them to initiate, complete and
/// abort an upload.
pub trait Transport: Send + Sync {
    /// Moves the bytes of `request.range` between the local file and the
    /// remote object. Called once per attempt.
    fn transfer_chunk<'a>(&'a self, request: &'a ChunkRequest) -> TransportFuture<'a, ()>;

    /// Returns the size of a remote object.
    fn stat_object<'a>(&'a self, remote_key: &'a str) -> TransportFuture<'a, u64>;

    /// Called once after planning, before the first chunk is dispatched.
    fn begin_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Called once every chunk is Done, before the task completes.
    fn complete_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Called on cancellation or failure once
    /// [`begin_transfer`](Self::begin_transfer) has been attempted, even if it
    /// failed or was interrupted. Errors are logged only.
    fn abort_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
