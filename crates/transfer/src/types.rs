use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::validation::validate_remote_key;
use crate::{ErrorKind, TransferError};

/// Opaque identifier assigned to a task when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TransferError::InvalidArgument(format!("invalid task id {s:?}: {e}")))
    }
}

/// Which way the bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local file to remote object.
    Upload,
    /// Remote object to local file.
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
        })
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// Pending ──start──> InProgress <──pause/resume──> Paused
///    │                   │  │                        │  │
///    └──cancel──> Cancelled <┘  └──> Completed        │  └──> Failed
///                      ^                  Failed <────┘
///                      └──────────────── cancel ──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl TaskState {
    /// Returns `true` for states no command can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Returns `true` while an engine is driving the task.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }

    /// Returns `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Cancelled)
                | (InProgress, Paused)
                | (Paused, InProgress)
                | (InProgress, Cancelled)
                | (Paused, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// What the caller asks for when submitting a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub direction: Direction,
    /// Upload source or download destination.
    pub local_path: PathBuf,
    /// Remote object identifier.
    pub remote_key: String,
}

impl TaskSpec {
    pub fn upload(local_path: impl Into<PathBuf>, remote_key: impl Into<String>) -> Self {
        Self {
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote_key: remote_key.into(),
        }
    }

    pub fn download(remote_key: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            local_path: local_path.into(),
            remote_key: remote_key.into(),
        }
    }

    /// Checks the fields a task cannot be created without.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.local_path.as_os_str().is_empty() {
            return Err(TransferError::InvalidArgument(
                "local path must not be empty".into(),
            ));
        }
        validate_remote_key(&self.remote_key)
    }
}

/// One upload or download: immutable identity plus guarded progress state.
///
/// All mutation goes through validated methods; a rejected call leaves the
/// task exactly as it was.
#[derive(Debug)]
pub struct TransferTask {
    id: TaskId,
    direction: Direction,
    local_path: PathBuf,
    remote_key: String,
    created_at: DateTime<Utc>,
    inner: RwLock<TaskInner>,
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    total_bytes: Option<u64>,
    bytes_transferred: u64,
    error: Option<TransferError>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TransferTask {
    /// Creates a pending task from a validated spec.
    pub fn new(spec: TaskSpec) -> Result<Self, TransferError> {
        spec.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            direction: spec.direction,
            local_path: spec.local_path,
            remote_key: spec.remote_key,
            created_at: now,
            inner: RwLock::new(TaskInner {
                state: TaskState::Pending,
                total_bytes: None,
                bytes_transferred: 0,
                error: None,
                updated_at: now,
                started_at: None,
                finished_at: None,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, TaskInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TaskInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_key(&self) -> &str {
        &self.remote_key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TaskState {
        self.read().state
    }

    pub fn is_terminal(&self) -> bool {
        self.read().state.is_terminal()
    }

    /// Total size, once the engine has determined it.
    pub fn total_bytes(&self) -> Option<u64> {
        self.read().total_bytes
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.read().bytes_transferred
    }

    /// The error that failed the task, if it failed.
    pub fn error(&self) -> Option<TransferError> {
        self.read().error.clone()
    }

    /// Moves the task to `next`, returning the state it left.
    pub fn transition(&self, next: TaskState) -> Result<TaskState, TransferError> {
        let mut s = self.write();
        apply_transition(&mut s, next)
    }

    /// Like [`transition`](Self::transition), but a task already in `next`
    /// is left alone. Returns `true` if the state changed.
    pub fn transition_idempotent(&self, next: TaskState) -> Result<bool, TransferError> {
        let mut s = self.write();
        if s.state == next {
            return Ok(false);
        }
        apply_transition(&mut s, next).map(|_| true)
    }

    /// Moves the task to Failed and attaches `error`.
    pub fn fail(&self, error: TransferError) -> Result<(), TransferError> {
        let mut s = self.write();
        apply_transition(&mut s, TaskState::Failed)?;
        s.error = Some(error);
        Ok(())
    }

    /// Records the total size. A size can be set once; repeating the same
    /// value is accepted.
    pub fn set_total_bytes(&self, total: u64) -> Result<(), TransferError> {
        let mut s = self.write();
        match s.total_bytes {
            Some(known) if known != total => Err(TransferError::InvalidArgument(format!(
                "total size already known as {known} bytes, got {total}"
            ))),
            _ if s.bytes_transferred > total => Err(TransferError::InvalidArgument(format!(
                "total size {total} is below the {} bytes already transferred",
                s.bytes_transferred
            ))),
            _ => {
                s.total_bytes = Some(total);
                s.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    /// Adds `bytes` to the transferred counter.
    ///
    /// Returns the new cumulative count, or `None` when the task no longer
    /// accepts progress because it left InProgress/Paused.
    pub fn record_progress(&self, bytes: u64) -> Result<Option<u64>, TransferError> {
        let mut s = self.write();
        if !s.state.is_active() {
            return Ok(None);
        }
        let next = s
            .bytes_transferred
            .checked_add(bytes)
            .ok_or_else(|| TransferError::InvalidArgument("byte counter overflow".into()))?;
        if let Some(total) = s.total_bytes
            && next > total
        {
            return Err(TransferError::InvalidArgument(format!(
                "progress {next} exceeds total size {total}"
            )));
        }
        s.bytes_transferred = next;
        s.updated_at = Utc::now();
        Ok(Some(next))
    }

    /// Returns a point-in-time copy of the task.
    pub fn snapshot(&self) -> TaskSnapshot {
        let s = self.read();
        TaskSnapshot {
            id: self.id,
            direction: self.direction,
            local_path: self.local_path.clone(),
            remote_key: self.remote_key.clone(),
            state: s.state,
            total_bytes: s.total_bytes,
            bytes_transferred: s.bytes_transferred,
            error: s.error.as_ref().map(ToString::to_string),
            error_kind: s.error.as_ref().map(TransferError::kind),
            created_at: self.created_at,
            updated_at: s.updated_at,
            started_at: s.started_at,
            finished_at: s.finished_at,
        }
    }
}

fn apply_transition(s: &mut TaskInner, next: TaskState) -> Result<TaskState, TransferError> {
    let from = s.state;
    if !from.can_transition_to(next) {
        return Err(TransferError::InvalidStateTransition { from, to: next });
    }
    let now = Utc::now();
    s.state = next;
    s.updated_at = now;
    if next == TaskState::InProgress && s.started_at.is_none() {
        s.started_at = Some(now);
    }
    if next.is_terminal() {
        s.finished_at = Some(now);
    }
    Ok(from)
}

/// Serializable copy of a task's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_key: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    pub bytes_transferred: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Returns progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        match self.total_bytes {
            Some(0) if self.state == TaskState::Completed => 100.0,
            Some(total) if total > 0 => self.bytes_transferred as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }
}
